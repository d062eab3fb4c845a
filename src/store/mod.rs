//! Durable state: projects, protocol runs, step runs, jobs, events,
//! clarifications, QA verdicts and step artifacts in SQLite.

pub mod db;
pub mod models;

pub use db::{DbHandle, NewArtifact, NewEvent, NewJob, NewProtocolRun, StoreDb, Upsert};
pub use models::*;
