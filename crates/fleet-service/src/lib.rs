//! fleet-service — the worker side of a Fleet node.
//!
//! The [`ServiceManager`] owns every worker process the local node runs
//! and caches the snapshots peers broadcast for theirs. It is driven from
//! the control loop: lifecycle operations, the liveness sweep and log
//! flushing all run on that one thread, so the manager takes `&mut self`
//! and needs no locks.
//!
//! ```text
//! ServiceManager
//!   ├── local:  unique id → process handle + log cache + snapshot
//!   ├── remote: unique id → last broadcast snapshot
//!   ├── ProcessLauncher (OsLauncher | ScriptedLauncher)
//!   └── PacketSender   (service updates on `fleet:services`)
//! ```

pub mod error;
pub mod log_cache;
pub mod manager;
pub mod process;

pub use error::{ServiceError, ServiceResult};
pub use log_cache::LogCache;
pub use manager::{Dispatch, Route, ServiceManager, ServiceSettings, lifecycle_operation};
pub use process::{LaunchSpec, OsLauncher, ProcessLauncher, STOP_COMMAND, ScriptedLauncher, ServiceProcess};
