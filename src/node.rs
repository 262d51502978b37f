//! A streaming node: shards, the shared transport and storage, and the loop
//! that routes inbound sessions to the shard owning their plan.

use crate::aggregator::{self, StreamTotals};
use crate::config::StreamingConfig;
use crate::error::{Result, StreamError};
use crate::shard::{ShardHandle, ShardWorker};
use crate::storage::StreamStorage;
use crate::streaming::coordinator::PlanHandle;
use crate::streaming::protocol::{negotiate_version, Message, SessionFailed, VersionNegotiationResult};
use crate::streaming::session::{SessionContext, SessionSpec};
use crate::streaming::types::{PlanId, StreamState};
use crate::transport::{BoxConnection, Incoming, PeerTransport};
use futures::future::join_all;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct StreamNode {
    config: StreamingConfig,
    storage: Arc<dyn StreamStorage>,
    workers: Vec<ShardWorker>,
    shards: Vec<ShardHandle>,
    accept_task: Option<JoinHandle<()>>,
}

impl StreamNode {
    /// Spawn `config.shard_count` shard threads sharing `transport` and `storage`.
    pub fn start(
        config: StreamingConfig,
        transport: Arc<dyn PeerTransport>,
        storage: Arc<dyn StreamStorage>,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = SessionContext {
            transport,
            storage: storage.clone(),
            chunk_size: config.chunk_size,
            compress: config.compress,
        };

        let mut workers = Vec::with_capacity(config.shard_count);
        for shard_id in 0..config.shard_count {
            workers.push(ShardWorker::spawn(
                shard_id,
                ctx.clone(),
                config.command_queue,
                config.event_capacity,
            )?);
        }
        let shards = workers.iter().map(|w| w.handle()).collect();
        info!(shards = config.shard_count, "Stream node started");

        Ok(Self {
            config,
            storage,
            workers,
            shards,
            accept_task: None,
        })
    }

    /// Accept inbound sessions from `incoming` on the current runtime.
    pub fn serve<I>(&mut self, incoming: I)
    where
        I: Incoming + 'static,
    {
        if let Some(previous) = self.accept_task.take() {
            previous.abort();
        }
        let shards = self.shards.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(shards, incoming)));
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn StreamStorage> {
        &self.storage
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shards(&self) -> &[ShardHandle] {
        &self.shards
    }

    fn shard_for(&self, plan_id: PlanId) -> Result<&ShardHandle> {
        owning_shard(&self.shards, plan_id)
    }

    /// Start a plan on the shard that owns `plan_id`.
    pub async fn start_plan(
        &self,
        plan_id: PlanId,
        description: impl Into<String>,
        specs: Vec<SessionSpec>,
    ) -> Result<PlanHandle> {
        self.shard_for(plan_id)?
            .start_plan(plan_id, description.into(), specs)
            .await
    }

    /// Every plan known to any shard of this node.
    pub async fn get_current_streams(&self) -> Vec<StreamState> {
        aggregator::get_current_streams(&self.shards).await
    }

    pub async fn progress_totals(&self) -> StreamTotals {
        aggregator::progress_totals(&self.shards).await
    }

    pub async fn abort_plan(&self, plan_id: PlanId) -> Result<()> {
        self.shard_for(plan_id)?.abort(plan_id).await
    }

    /// Stop accepting, abort every plan and wait for all shards to drain.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        let results = join_all(self.shards.iter().map(|s| s.shutdown())).await;
        for (shard_id, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                warn!(shard = shard_id, "Shard shutdown failed: {}", e);
            }
        }

        let workers = std::mem::take(&mut self.workers);
        tokio::task::spawn_blocking(move || {
            for worker in workers {
                worker.join();
            }
        })
        .await
        .map_err(|e| StreamError::Io(std::io::Error::other(e)))?;
        info!("Stream node stopped");
        Ok(())
    }
}

fn owning_shard(shards: &[ShardHandle], plan_id: PlanId) -> Result<&ShardHandle> {
    let shard_id = plan_id.shard_of(shards.len());
    shards
        .get(shard_id)
        .ok_or(StreamError::ShardUnavailable(shard_id))
}

async fn accept_loop<I: Incoming>(shards: Vec<ShardHandle>, mut incoming: I) {
    while let Some(conn) = incoming.accept().await {
        let shards = shards.clone();
        tokio::spawn(async move {
            let peer = conn.peer();
            if let Err(e) = route_incoming(&shards, conn).await {
                warn!(peer = %peer, "Rejected inbound stream session: {}", e);
            }
        });
    }
    debug!("Inbound listener closed");
}

/// Read the opening `Prepare` and hand the connection to the owning shard.
async fn route_incoming(shards: &[ShardHandle], mut conn: BoxConnection) -> Result<()> {
    let prepare = match Message::decode(conn.receive().await?)? {
        Message::Prepare(prepare) => prepare,
        other => {
            let err = StreamError::UnexpectedMessage {
                expected: "Prepare",
                got: other.name(),
            };
            reject(&mut conn, &err).await;
            return Err(err);
        }
    };

    if let VersionNegotiationResult::TooOld { .. } | VersionNegotiationResult::TooNew { .. } =
        negotiate_version(prepare.version)
    {
        let err = StreamError::protocol(format!(
            "unsupported protocol version {}",
            prepare.version
        ));
        reject(&mut conn, &err).await;
        return Err(err);
    }

    let shard = owning_shard(shards, prepare.plan_id)?;
    debug!(
        plan_id = %prepare.plan_id,
        peer = %conn.peer(),
        shard = shard.shard_id(),
        "Routing inbound stream session"
    );
    shard.accept(conn, prepare).await?;
    Ok(())
}

async fn reject(conn: &mut BoxConnection, err: &StreamError) {
    let msg = Message::SessionFailed(SessionFailed {
        reason: err.to_string(),
    });
    if let Ok(frame) = msg.encode() {
        let _ = conn.send(frame).await;
    }
    let _ = conn.close().await;
}
