pub mod api;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod executor;
pub mod feedback;
pub mod logging;
pub mod machine;
pub mod qa;
pub mod queue;
pub mod registry;
pub mod store;
