//! QA verdict engine.
//!
//! ## Module map
//!
//! - [`findings`]: `Finding`, `Severity`, `GateStatus`, `GateResult`
//! - [`gate`]: the `Gate` capability, `QaContext`, and the regex-driven `PatternGate`
//! - [`checklist`]: the `ChecklistValidator` capability and `PatternChecklist`
//! - [`verdict`]: the pure `compute_verdict`, `CodeAnalyzer`, and `QaEngine`

pub mod checklist;
pub mod findings;
pub mod gate;
pub mod verdict;

pub use checklist::{ChecklistItemResult, ChecklistResult, ChecklistValidator, PatternChecklist};
pub use findings::{Finding, GateResult, GateStatus, Severity};
pub use gate::{Gate, GateSpec, PatternGate, QaArtifact, QaContext, builtin_gate_defs};
pub use verdict::{
    CONSTITUTIONAL_GATE_FAILED, CodeAnalyzer, FindingsAnalyzer, GateOutcome, QaEngine, QaVerdict,
    QaWeights, ResolvedGate, blocking_failure, compute_verdict, gate_score,
};
