//! Shard workers.
//!
//! Each shard is one OS thread running a current-thread tokio runtime. The
//! thread owns its [`StreamManager`] outright; the rest of the node talks to
//! it only through [`ShardHandle`], a bounded command queue with a oneshot
//! reply per request. Session tasks are spawned on the shard's runtime and
//! report completion back to the same loop.

use crate::error::{Result, StreamError};
use crate::streaming::coordinator::{PlanHandle, StreamResultFuture};
use crate::streaming::manager::{PlanKind, StreamManager};
use crate::streaming::protocol::Prepare;
use crate::streaming::session::{SessionContext, SessionSpec};
use crate::streaming::types::{PlanId, StreamState};
use crate::transport::BoxConnection;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub enum ShardCommand {
    StartPlan {
        plan_id: PlanId,
        description: String,
        specs: Vec<SessionSpec>,
        respond_to: oneshot::Sender<Result<PlanHandle>>,
    },
    Accept {
        conn: BoxConnection,
        prepare: Prepare,
        respond_to: oneshot::Sender<Result<PlanHandle>>,
    },
    Abort {
        plan_id: PlanId,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Vec<StreamState>>,
    },
    /// Abort everything, wait for every plan to unregister, then stop.
    Shutdown { respond_to: oneshot::Sender<()> },
}

/// Sending side of a shard's command queue.
#[derive(Clone)]
pub struct ShardHandle {
    shard_id: usize,
    tx: mpsc::Sender<ShardCommand>,
}

impl ShardHandle {
    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ShardCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .await
            .map_err(|_| StreamError::ShardUnavailable(self.shard_id))?;
        rx.await
            .map_err(|_| StreamError::ShardUnavailable(self.shard_id))
    }

    pub async fn start_plan(
        &self,
        plan_id: PlanId,
        description: String,
        specs: Vec<SessionSpec>,
    ) -> Result<PlanHandle> {
        self.request(|respond_to| ShardCommand::StartPlan {
            plan_id,
            description,
            specs,
            respond_to,
        })
        .await?
    }

    pub async fn accept(&self, conn: BoxConnection, prepare: Prepare) -> Result<PlanHandle> {
        self.request(|respond_to| ShardCommand::Accept {
            conn,
            prepare,
            respond_to,
        })
        .await?
    }

    pub async fn abort(&self, plan_id: PlanId) -> Result<()> {
        self.request(|respond_to| ShardCommand::Abort {
            plan_id,
            respond_to,
        })
        .await?
    }

    /// Snapshots of every plan registered on this shard, taken at one
    /// shard-local instant.
    pub async fn snapshot(&self) -> Result<Vec<StreamState>> {
        self.request(|respond_to| ShardCommand::Snapshot { respond_to })
            .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|respond_to| ShardCommand::Shutdown { respond_to })
            .await
    }
}

/// A running shard thread.
pub struct ShardWorker {
    handle: ShardHandle,
    thread: Option<JoinHandle<()>>,
}

impl ShardWorker {
    /// Build the shard's runtime and start its thread.
    pub fn spawn(
        shard_id: usize,
        ctx: SessionContext,
        command_queue: usize,
        event_capacity: usize,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, rx) = mpsc::channel(command_queue.max(1));

        let thread = std::thread::Builder::new()
            .name(format!("stream-shard-{}", shard_id))
            .spawn(move || {
                runtime.block_on(run_shard(shard_id, ctx, event_capacity, rx));
            })?;

        Ok(Self {
            handle: ShardHandle { shard_id, tx },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> ShardHandle {
        self.handle.clone()
    }

    /// Wait for the shard thread to exit. Call after [`ShardHandle::shutdown`].
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(shard = self.handle.shard_id, "Shard thread panicked");
            }
        }
    }
}

async fn run_shard(
    shard_id: usize,
    ctx: SessionContext,
    event_capacity: usize,
    mut commands: mpsc::Receiver<ShardCommand>,
) {
    let mut manager = StreamManager::new(shard_id);
    let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<PlanId>();
    let mut draining = false;
    let mut shutdown_ack: Option<oneshot::Sender<()>> = None;

    info!(shard = shard_id, "Stream shard started");

    loop {
        if draining && manager.is_empty() {
            break;
        }

        tokio::select! {
            Some(plan_id) = finished_rx.recv() => {
                for outcome in manager.session_finished(&plan_id) {
                    debug!(
                        shard = shard_id,
                        plan_id = %outcome.plan_id,
                        success = outcome.is_success(),
                        "Plan finished on shard"
                    );
                }
            }
            cmd = commands.recv(), if !draining => match cmd {
                Some(ShardCommand::Shutdown { respond_to }) => {
                    let aborted = manager.abort_all();
                    info!(shard = shard_id, aborted, "Stream shard shutting down");
                    draining = true;
                    shutdown_ack = Some(respond_to);
                }
                Some(cmd) => handle_command(
                    &mut manager,
                    cmd,
                    &ctx,
                    event_capacity,
                    &finished_tx,
                ),
                None => {
                    manager.abort_all();
                    draining = true;
                }
            },
        }
    }

    info!(shard = shard_id, "Stream shard stopped");
    if let Some(ack) = shutdown_ack {
        let _ = ack.send(());
    }
}

fn handle_command(
    manager: &mut StreamManager,
    cmd: ShardCommand,
    ctx: &SessionContext,
    event_capacity: usize,
    finished: &mpsc::UnboundedSender<PlanId>,
) {
    match cmd {
        ShardCommand::StartPlan {
            plan_id,
            description,
            specs,
            respond_to,
        } => {
            let coordinator = StreamResultFuture::initiated(
                plan_id,
                description,
                specs,
                ctx.clone(),
                event_capacity,
            );
            let result = manager.register_initiated(coordinator).map(|c| {
                let handle = c.handle();
                c.start(finished);
                handle
            });
            // A plan without sessions is done as soon as it starts
            if result.is_ok() {
                manager.session_finished(&plan_id);
            }
            let _ = respond_to.send(result);
        }
        ShardCommand::Accept {
            conn,
            prepare,
            respond_to,
        } => {
            let plan_id = prepare.plan_id;
            let result = match manager.get_mut(PlanKind::Receiving, &plan_id) {
                Some(coordinator) => coordinator.add_incoming(conn, prepare).map(|_| {
                    coordinator.start(finished);
                    coordinator.handle()
                }),
                None => {
                    let mut coordinator = StreamResultFuture::new(
                        plan_id,
                        prepare.description.clone(),
                        ctx.clone(),
                        event_capacity,
                    );
                    coordinator
                        .add_incoming(conn, prepare)
                        .and_then(|_| manager.register_receiving(coordinator))
                        .map(|c| {
                            let handle = c.handle();
                            c.start(finished);
                            handle
                        })
                }
            };
            let _ = respond_to.send(result);
        }
        ShardCommand::Abort {
            plan_id,
            respond_to,
        } => {
            let _ = respond_to.send(manager.abort(&plan_id));
        }
        ShardCommand::Snapshot { respond_to } => {
            let _ = respond_to.send(manager.snapshot_all());
        }
        ShardCommand::Shutdown { respond_to } => {
            let _ = respond_to.send(());
        }
    }
}
