//! CLI command implementations.
//!
//! | Module     | Commands handled                                               |
//! |------------|----------------------------------------------------------------|
//! | `project`  | `Init`, `Project`, `Config`                                    |
//! | `protocol` | `Create`, `List`, `Action`, `Answer`, `Status`, `Events`, `Clarifications` |
//! | `worker`   | `Worker`, `Sweep`, `Recover`, `Queue`                          |

pub mod project;
pub mod protocol;
pub mod worker;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use conveyor::config::ConveyorConfig;
use conveyor::machine::ProtocolStateMachine;
use conveyor::registry::Registry;
use conveyor::store::{DbHandle, StoreDb};

pub use project::{cmd_config, cmd_init, cmd_project};
pub use protocol::{cmd_action, cmd_answer, cmd_clarifications, cmd_create, cmd_events, cmd_list, cmd_status};
pub use worker::{cmd_queue, cmd_recover, cmd_sweep, cmd_worker};

/// Everything a command needs: resolved config, the database and the
/// state machine built from the same config.
pub struct Workspace {
    pub config: ConveyorConfig,
    pub db: DbHandle,
    pub machine: Arc<ProtocolStateMachine>,
}

impl Workspace {
    pub fn open(project_dir: &Path) -> Result<Self> {
        let config = ConveyorConfig::new(project_dir.to_path_buf())?;
        let db_path = config.db_path();
        if !db_path.exists() {
            anyhow::bail!(
                "No conveyor database at {}. Run `conveyor init` first.",
                db_path.display()
            );
        }
        let registry = Arc::new(Registry::from_config(&config.toml)?);
        let machine = ProtocolStateMachine::from_config(&config.toml, registry)?;
        let db = StoreDb::new(&db_path).context("Failed to open conveyor database")?;
        Ok(Self {
            config,
            db: DbHandle::new(db),
            machine: Arc::new(machine),
        })
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}
