//! Inter-node streaming coordination for a shard-per-core database.
//!
//! A node runs one [`shard::ShardWorker`] per core. Streaming plans are
//! registered on the shard that owns their id, drive one session per peer,
//! and are reported through [`node::StreamNode::get_current_streams`], which
//! gathers snapshots from every shard.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod logging;
pub mod node;
pub mod report;
pub mod shard;
pub mod storage;
pub mod streaming;
pub mod transport;

pub use config::StreamingConfig;
pub use error::{FailureReason, Result, StreamError};
pub use node::StreamNode;
pub use streaming::{PlanHandle, PlanId, StreamPlan, StreamState};
