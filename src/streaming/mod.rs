//! Plans, sessions and the per-shard registry.
//!
//! # Architecture
//!
//! ```text
//!            StreamNode
//!     +----------+----------+
//!     |          |          |
//!  shard 0    shard 1    shard N      one thread + runtime each
//!     |
//!  StreamManager                      initiated / receiving registries
//!     |
//!  StreamResultFuture                 one per plan on its owning shard
//!     |
//!  StreamSession x peers              one task each, run concurrently
//! ```
//!
//! A plan lives on shard `plan_id % shard_count` on every node it touches.
//! Only by-value snapshots ([`types::StreamState`] and friends) leave a shard.

pub mod coordinator;
pub mod events;
pub mod manager;
pub mod plan;
pub mod protocol;
pub mod session;
pub mod types;

pub use coordinator::{PlanHandle, PlanStatus, StreamOutcome, StreamResultFuture};
pub use events::{EventReceiver, StreamEvent};
pub use manager::{PlanKind, StreamManager};
pub use plan::StreamPlan;
pub use session::{SessionContext, SessionHandle, SessionSpec, StreamSession};
pub use types::{
    Direction, FileDescriptor, PlanId, ProgressInfo, SessionInfo, SessionState, StreamState,
    StreamSummary, TableId,
};
