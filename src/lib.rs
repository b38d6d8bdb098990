pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod measurement;
pub mod metrics;
pub mod packet;
pub mod probe;
pub mod socket;
pub mod target;
pub mod transit;
pub mod worker;

pub use config::{ClassConfig, CompiledTarget, HopConfig, PathConfig, RawConfig};
pub use manager::Manager;
pub use metrics::Snapshot;
pub use target::{Hop, Label, Target, TargetId, Tos};
