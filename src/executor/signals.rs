//! Tags an executor may print to talk back to the orchestrator:
//! - `<blocker>reason</blocker>`: the step cannot proceed
//! - `<artifact>path</artifact>` or `<artifact kind="diff">path</artifact>`: a file it produced

use regex::Regex;
use std::sync::LazyLock;

static BLOCKER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<blocker>(.*?)</blocker>").unwrap());

static ARTIFACT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<artifact(?:\s+kind="([^"]*)")?\s*>(.*?)</artifact>"#).unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSignal {
    pub kind: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSignals {
    pub blockers: Vec<String>,
    pub artifacts: Vec<ArtifactSignal>,
}

impl OutputSignals {
    pub fn is_blocked(&self) -> bool {
        !self.blockers.is_empty()
    }
}

pub fn extract_signals(text: &str) -> OutputSignals {
    let mut signals = OutputSignals::default();

    for cap in BLOCKER_REGEX.captures_iter(text) {
        if let Some(m) = cap.get(1) {
            let reason = m.as_str().trim();
            if !reason.is_empty() {
                signals.blockers.push(reason.to_string());
            }
        }
    }

    for cap in ARTIFACT_REGEX.captures_iter(text) {
        let path = cap.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        if path.is_empty() {
            continue;
        }
        let kind = cap
            .get(1)
            .map(|m| m.as_str().trim())
            .filter(|k| !k.is_empty())
            .unwrap_or("file");
        signals.artifacts.push(ArtifactSignal {
            kind: kind.to_string(),
            path: path.to_string(),
        });
    }

    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_blocker() {
        let s = extract_signals("Working...\n<blocker>Which database should be used?</blocker>");
        assert_eq!(s.blockers, vec!["Which database should be used?"]);
        assert!(s.is_blocked());
    }

    #[test]
    fn test_empty_blocker_is_ignored() {
        assert!(!extract_signals("<blocker>  </blocker>").is_blocked());
    }

    #[test]
    fn test_parse_artifacts_with_and_without_kind() {
        let s = extract_signals(
            "<artifact>src/lib.rs</artifact> and <artifact kind=\"diff\">out/change.patch</artifact>",
        );
        assert_eq!(
            s.artifacts,
            vec![
                ArtifactSignal {
                    kind: "file".into(),
                    path: "src/lib.rs".into()
                },
                ArtifactSignal {
                    kind: "diff".into(),
                    path: "out/change.patch".into()
                },
            ]
        );
    }

    #[test]
    fn test_no_signals() {
        assert_eq!(extract_signals("all good"), OutputSignals::default());
    }
}
