//! Per-plan coordinator: owns the sessions of one plan on one shard.
//!
//! The coordinator itself never runs anything on its own. Session tasks are
//! spawned on the owning shard's runtime and report back through the shard's
//! `finished` channel; the shard loop then calls [`StreamResultFuture::finish`].
//! That keeps every mutation of the coordinator on the shard loop.

use crate::streaming::events::{emit, event_channel, EventReceiver, EventSender, StreamEvent};
use crate::streaming::protocol::Prepare;
use crate::streaming::session::{SessionContext, SessionHandle, SessionSpec, StreamSession};
use crate::streaming::types::{PlanId, SessionInfo, SessionState, StreamState};
use crate::error::{Result, StreamError};
use crate::transport::BoxConnection;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Final result of a plan on this node.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub plan_id: PlanId,
    pub description: String,
    pub sessions: Vec<SessionInfo>,
}

impl StreamOutcome {
    /// True only if every session completed.
    pub fn is_success(&self) -> bool {
        self.sessions
            .iter()
            .all(|s| s.state == SessionState::Completed)
    }

    pub fn failed_sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.sessions.iter().filter(|s| s.is_failed())
    }
}

/// Coarse plan status published to [`PlanHandle`]s.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStatus {
    Running,
    /// At least one session failed or aborted; the rest are still winding down.
    Failing { failed: usize },
    Finished(StreamOutcome),
}

impl PlanStatus {
    pub fn outcome(&self) -> Option<&StreamOutcome> {
        match self {
            PlanStatus::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Result future of one plan. Owned by the shard's [`StreamManager`].
///
/// [`StreamManager`]: crate::streaming::manager::StreamManager
pub struct StreamResultFuture {
    plan_id: PlanId,
    description: String,
    ctx: SessionContext,
    handles: Vec<SessionHandle>,
    pending: Vec<StreamSession>,
    indices: HashMap<SocketAddr, u32>,
    abort: watch::Sender<bool>,
    status: watch::Sender<PlanStatus>,
    events: EventSender,
}

impl StreamResultFuture {
    pub fn new(
        plan_id: PlanId,
        description: impl Into<String>,
        ctx: SessionContext,
        event_capacity: usize,
    ) -> Self {
        Self {
            plan_id,
            description: description.into(),
            ctx,
            handles: Vec::new(),
            pending: Vec::new(),
            indices: HashMap::new(),
            abort: watch::channel(false).0,
            status: watch::channel(PlanStatus::Running).0,
            events: event_channel(event_capacity),
        }
    }

    /// Coordinator for a plan this node initiates: one session per spec.
    pub fn initiated(
        plan_id: PlanId,
        description: impl Into<String>,
        specs: Vec<SessionSpec>,
        ctx: SessionContext,
        event_capacity: usize,
    ) -> Self {
        let mut coordinator = Self::new(plan_id, description, ctx, event_capacity);
        for spec in specs {
            coordinator.add_session(spec);
        }
        coordinator
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn session_count(&self) -> usize {
        self.handles.len()
    }

    /// Queue an outbound session. Indices count up per peer within the plan.
    pub fn add_session(&mut self, spec: SessionSpec) -> SessionHandle {
        let index = self.indices.entry(spec.peer).or_insert(0);
        let session_index = *index;
        *index += 1;

        let session = StreamSession::new(
            self.plan_id,
            self.description.clone(),
            session_index,
            spec,
            self.ctx.clone(),
            self.abort.subscribe(),
            self.events.clone(),
        );
        self.enqueue(session)
    }

    /// Queue a session opened by a peer.
    pub fn add_incoming(&mut self, conn: BoxConnection, prepare: Prepare) -> Result<SessionHandle> {
        if prepare.plan_id != self.plan_id {
            return Err(StreamError::protocol(format!(
                "prepare for plan {} routed to coordinator of {}",
                prepare.plan_id, self.plan_id
            )));
        }
        let session = StreamSession::incoming(
            conn,
            prepare,
            self.ctx.clone(),
            self.abort.subscribe(),
            self.events.clone(),
        );
        Ok(self.enqueue(session))
    }

    fn enqueue(&mut self, session: StreamSession) -> SessionHandle {
        let handle = session.handle();
        self.handles.push(handle.clone());
        self.pending.push(session);
        handle
    }

    /// Spawn every queued session on the current runtime. Each task sends the
    /// plan id on `finished` once its session is terminal. Sessions run
    /// independently; nothing here orders them.
    pub fn start(&mut self, finished: &mpsc::UnboundedSender<PlanId>) {
        let plan_id = self.plan_id;
        for session in self.pending.drain(..) {
            let finished = finished.clone();
            debug!(plan_id = %plan_id, peer = %session.peer(), "Starting stream session");
            tokio::spawn(async move {
                session.run().await;
                let _ = finished.send(plan_id);
            });
        }
    }

    /// Every owned session is terminal and nothing is waiting to start.
    pub fn is_terminal(&self) -> bool {
        self.pending.is_empty() && self.handles.iter().all(|h| h.is_terminal())
    }

    pub fn is_finished(&self) -> bool {
        matches!(*self.status.borrow(), PlanStatus::Finished(_))
    }

    /// Best-effort view of the plan: each session is snapshotted on its own.
    pub fn snapshot(&self) -> StreamState {
        StreamState {
            plan_id: self.plan_id,
            description: self.description.clone(),
            sessions: self.handles.iter().map(|h| h.snapshot()).collect(),
        }
    }

    /// Ask every session to stop at its next suspension point.
    pub fn abort(&self) {
        if !self.abort.send_replace(true) {
            info!(plan_id = %self.plan_id, sessions = self.handles.len(), "Aborting stream plan");
        }
    }

    /// Update the published status after a session finished. Returns the
    /// outcome the first time every session is terminal.
    pub fn finish(&mut self) -> Option<StreamOutcome> {
        if self.is_finished() {
            return None;
        }
        if !self.is_terminal() {
            let failed = self
                .handles
                .iter()
                .filter(|h| matches!(h.state(), SessionState::Failed | SessionState::Aborted))
                .count();
            if failed > 0 {
                self.status.send_if_modified(|status| {
                    let next = PlanStatus::Failing { failed };
                    if *status == next {
                        return false;
                    }
                    *status = next;
                    true
                });
            }
            return None;
        }

        let state = self.snapshot();
        let outcome = StreamOutcome {
            plan_id: state.plan_id,
            description: state.description,
            sessions: state.sessions,
        };
        let success = outcome.is_success();
        if success {
            info!(plan_id = %self.plan_id, description = %self.description, "Stream plan completed");
        } else {
            warn!(
                plan_id = %self.plan_id,
                description = %self.description,
                failed = outcome.failed_sessions().count(),
                "Stream plan failed"
            );
        }
        self.status.send_replace(PlanStatus::Finished(outcome.clone()));
        emit(
            &self.events,
            StreamEvent::StreamComplete {
                plan_id: self.plan_id,
                success,
            },
        );
        Some(outcome)
    }

    pub fn handle(&self) -> PlanHandle {
        PlanHandle {
            plan_id: self.plan_id,
            status: self.status.subscribe(),
            events: self.events.clone(),
        }
    }
}

/// Caller-side view of a running plan.
#[derive(Clone)]
pub struct PlanHandle {
    plan_id: PlanId,
    status: watch::Receiver<PlanStatus>,
    events: EventSender,
}

impl PlanHandle {
    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    pub fn status(&self) -> PlanStatus {
        self.status.borrow().clone()
    }

    pub fn outcome(&self) -> Option<StreamOutcome> {
        self.status.borrow().outcome().cloned()
    }

    /// Events from now on. Subscribe before the plan finishes or the final
    /// events are missed.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Resolve once every session of the plan is terminal.
    pub async fn wait(&mut self) -> Result<StreamOutcome> {
        let plan_id = self.plan_id;
        self.status
            .wait_for(|s| matches!(s, PlanStatus::Finished(_)))
            .await
            .ok()
            .and_then(|s| s.outcome().cloned())
            .ok_or(StreamError::UnknownPlan(plan_id))
    }
}
