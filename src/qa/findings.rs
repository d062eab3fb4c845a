//! Gate output types.
//!
//! - [`Severity`]: classification of one finding
//! - [`Finding`]: one issue a gate reported, with optional location and suggestion
//! - [`GateStatus`]: outcome of one gate (passed/warning/failed/skipped)
//! - [`GateResult`]: a gate's status plus its findings
//!
//! ## Example
//!
//! ```
//! use conveyor::qa::{Finding, GateResult, GateStatus, Severity};
//!
//! let finding = Finding::new(Severity::Error, "hardcoded-secret", "Hardcoded credential")
//!     .with_path("src/config.rs")
//!     .with_line(12);
//!
//! let result = GateResult::from_findings("secrets", vec![finding]);
//! assert_eq!(result.status, GateStatus::Failed);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Severity of a finding, most critical first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Fails the gate that reported it.
    Error,
    /// Downgrades the gate to `warning`.
    #[default]
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    /// Stable rule identifier, e.g. `hardcoded-secret`.
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl Finding {
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity,
            message: message.into(),
            path: None,
            line: None,
            suggestion: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// `path:line: message`, or just the message when there is no location.
    pub fn describe(&self) -> String {
        match (&self.path, self.line) {
            (Some(path), Some(line)) => format!("{path}:{line}: {}", self.message),
            (Some(path), None) => format!("{path}: {}", self.message),
            _ => self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Warning,
    Failed,
    Skipped,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::Warning => "warning",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Contribution to the gate score; `None` for skipped gates.
    pub fn score(&self) -> Option<f64> {
        match self {
            Self::Passed => Some(1.0),
            Self::Warning => Some(0.5),
            Self::Failed => Some(0.0),
            Self::Skipped => None,
        }
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub status: GateStatus,
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl GateResult {
    /// Any error fails the gate; otherwise any warning downgrades it.
    pub fn from_findings(gate_id: impl Into<String>, findings: Vec<Finding>) -> Self {
        let status = if findings.iter().any(|f| f.severity == Severity::Error) {
            GateStatus::Failed
        } else if findings.iter().any(|f| f.severity == Severity::Warning) {
            GateStatus::Warning
        } else {
            GateStatus::Passed
        };
        Self {
            gate_id: gate_id.into(),
            status,
            findings,
        }
    }

    pub fn skipped(gate_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            gate_id: gate_id.into(),
            status: GateStatus::Skipped,
            findings: vec![Finding::new(Severity::Info, "skipped", reason)],
        }
    }
}
