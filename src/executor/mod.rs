//! Concrete executors.
//!
//! - [`shell`]: `ShellExecutor`, one `sh -c` subprocess per job
//! - [`signals`]: `<blocker>` / `<artifact>` tags parsed from executor output

pub mod shell;
pub mod signals;

pub use shell::ShellExecutor;
pub use signals::{ArtifactSignal, OutputSignals, extract_signals};
