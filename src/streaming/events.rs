//! Notifications published while a plan runs.
//!
//! Each coordinator owns one broadcast channel. Subscribers that fall behind
//! lose old events (`RecvError::Lagged`); the plan never waits for them.

use crate::error::FailureReason;
use crate::streaming::types::{PlanId, ProgressInfo, SessionState};
use std::net::SocketAddr;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum StreamEvent {
    SessionPrepared {
        plan_id: PlanId,
        peer: SocketAddr,
        session_index: u32,
    },
    Progress {
        plan_id: PlanId,
        progress: ProgressInfo,
    },
    SessionComplete {
        plan_id: PlanId,
        peer: SocketAddr,
        session_index: u32,
        state: SessionState,
        failure: Option<FailureReason>,
    },
    StreamComplete {
        plan_id: PlanId,
        success: bool,
    },
}

impl StreamEvent {
    pub fn plan_id(&self) -> PlanId {
        match self {
            StreamEvent::SessionPrepared { plan_id, .. }
            | StreamEvent::Progress { plan_id, .. }
            | StreamEvent::SessionComplete { plan_id, .. }
            | StreamEvent::StreamComplete { plan_id, .. } => *plan_id,
        }
    }
}

pub type EventSender = broadcast::Sender<StreamEvent>;
pub type EventReceiver = broadcast::Receiver<StreamEvent>;

pub fn event_channel(capacity: usize) -> EventSender {
    broadcast::channel(capacity.max(1)).0
}

/// Publish without caring whether anyone listens.
pub(crate) fn emit(events: &EventSender, event: StreamEvent) {
    let _ = events.send(event);
}
