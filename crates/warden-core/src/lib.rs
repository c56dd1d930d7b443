//! Warden Core
//!
//! Primitives shared by every Warden component:
//!
//! - [`ContentHash`]: 32-byte BLAKE3 hash used to address file content
//! - [`Storage`]: durable key/value interface with atomic replace and append
//! - [`EventBus`]: fan-out of [`GovernanceEvent`]s to subscribers
//! - [`KillSwitch`]: durable, externally settable stop flag
//! - [`ErrorClassifier`]: data-driven TRANSIENT/PERMANENT/POLICY classification
//! - [`Clock`]: injectable time source so tests can control retry schedules
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_core::{FsStorage, KillSwitch, SystemClock};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(FsStorage::new(".warden"));
//! let kill_switch = KillSwitch::new(storage, Arc::new(SystemClock));
//!
//! if kill_switch.is_triggered().await? {
//!     println!("stopped: no new work may start");
//! }
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod bus;
pub mod classify;
pub mod clock;
pub mod error;
pub mod hash;
pub mod ids;
pub mod kill_switch;
pub mod severity;
pub mod storage;
pub mod telemetry;

pub use bus::{EventBus, EventSubscriber, EventType, GovernanceEvent, PublishReport, SubscriberError};
pub use classify::{ClassificationRule, ClassificationTable, ErrorClass, ErrorClassifier};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{ClassifierError, StorageError};
pub use hash::{ContentHash, HashError};
pub use ids::{AgentId, DlqItemId, OperationId, RunId, SnapshotId};
pub use kill_switch::{KillSwitch, KillSwitchActor, KillSwitchError, KillSwitchState};
pub use severity::Severity;
pub use storage::{FsStorage, MemoryStorage, SharedStorage, Storage};
pub use telemetry::{LogFormat, TelemetryConfig, TelemetryError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
