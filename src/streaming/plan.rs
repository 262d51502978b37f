//! Builder for a streaming plan.
//!
//! ```no_run
//! # use shard_stream::streaming::plan::StreamPlan;
//! # use shard_stream::streaming::types::TableId;
//! # async fn demo(node: &shard_stream::node::StreamNode, table: TableId) -> shard_stream::Result<()> {
//! let peer = "10.0.0.2:7000".parse().unwrap();
//! let mut plan = StreamPlan::new("rebuild")
//!     .request_ranges(peer, [table])
//!     .execute(node)
//!     .await?;
//! let outcome = plan.wait().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::Result;
use crate::node::StreamNode;
use crate::storage::StreamStorage;
use crate::streaming::coordinator::PlanHandle;
use crate::streaming::session::SessionSpec;
use crate::streaming::types::{FileDescriptor, PlanId, TableId};
use std::net::SocketAddr;

#[derive(Debug, Default, Clone)]
struct PeerRequest {
    transfer_tables: Vec<TableId>,
    transfer_files: Vec<FileDescriptor>,
    request_tables: Vec<TableId>,
}

#[derive(Debug, Clone)]
pub struct StreamPlan {
    plan_id: PlanId,
    description: String,
    peers: Vec<(SocketAddr, PeerRequest)>,
}

impl StreamPlan {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            plan_id: PlanId::new(),
            description: description.into(),
            peers: Vec::new(),
        }
    }

    pub fn with_plan_id(mut self, plan_id: PlanId) -> Self {
        self.plan_id = plan_id;
        self
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn peer(&mut self, peer: SocketAddr) -> &mut PeerRequest {
        let pos = match self.peers.iter().position(|(p, _)| *p == peer) {
            Some(pos) => pos,
            None => {
                self.peers.push((peer, PeerRequest::default()));
                self.peers.len() - 1
            }
        };
        &mut self.peers[pos].1
    }

    /// Push every file of `tables` to `peer`.
    pub fn transfer_ranges(mut self, peer: SocketAddr, tables: impl IntoIterator<Item = TableId>) -> Self {
        self.peer(peer).transfer_tables.extend(tables);
        self
    }

    /// Push exactly these files to `peer`.
    pub fn transfer_files(
        mut self,
        peer: SocketAddr,
        files: impl IntoIterator<Item = FileDescriptor>,
    ) -> Self {
        self.peer(peer).transfer_files.extend(files);
        self
    }

    /// Pull `tables` from `peer`.
    pub fn request_ranges(mut self, peer: SocketAddr, tables: impl IntoIterator<Item = TableId>) -> Self {
        self.peer(peer).request_tables.extend(tables);
        self
    }

    /// Expand table ranges into concrete files, one session per peer.
    pub async fn resolve(&self, storage: &dyn StreamStorage) -> Result<Vec<SessionSpec>> {
        let mut specs = Vec::with_capacity(self.peers.len());
        for (peer, request) in &self.peers {
            let mut files = request.transfer_files.clone();
            for table in &request.transfer_tables {
                files.extend(storage.list_files(*table).await?);
            }
            specs.push(
                SessionSpec::new(*peer)
                    .with_files(files)
                    .with_requests(request.request_tables.iter().copied()),
            );
        }
        Ok(specs)
    }

    pub async fn execute(self, node: &StreamNode) -> Result<PlanHandle> {
        let specs = self.resolve(node.storage().as_ref()).await?;
        node.start_plan(self.plan_id, self.description, specs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_resolve_groups_by_peer() {
        let storage = MemoryStorage::new();
        let t1 = TableId::from_u128(1);
        let t2 = TableId::from_u128(2);
        storage.insert_file(t1, "a.db", Bytes::from_static(b"aaaa"));
        storage.insert_file(t1, "b.db", Bytes::from_static(b"bb"));

        let p1: SocketAddr = "10.0.6.1:7000".parse().unwrap();
        let p2: SocketAddr = "10.0.6.2:7000".parse().unwrap();
        let plan = StreamPlan::new("bootstrap")
            .transfer_ranges(p1, [t1])
            .request_ranges(p2, [t2])
            .request_ranges(p1, [t2]);

        let specs = plan.resolve(&storage).await.unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].peer, p1);
        assert_eq!(specs[0].files.len(), 2);
        assert_eq!(specs[0].requests, vec![t2]);
        assert_eq!(specs[0].summaries()[0].total_size, 6);
        assert_eq!(specs[1].peer, p2);
        assert!(specs[1].files.is_empty());
    }
}
