#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use shard_stream::storage::MemoryStorage;
    use shard_stream::streaming::{
        Direction, FileDescriptor, SessionSpec, SessionState, StreamEvent, StreamPlan, TableId,
    };
    use shard_stream::transport::{MemoryNetwork, MemoryTransport};
    use shard_stream::{FailureReason, PlanId, StreamError, StreamNode, StreamingConfig};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    const TABLE: u128 = 0x7ab1e;

    fn addr(index: usize) -> SocketAddr {
        SocketAddr::from(([10, 1, 0, (index + 1) as u8], 7000))
    }

    fn table() -> TableId {
        TableId::from_u128(TABLE)
    }

    struct Cluster {
        net: MemoryNetwork,
        nodes: Vec<StreamNode>,
        storages: Vec<Arc<MemoryStorage>>,
    }

    impl Cluster {
        fn start(size: usize, shards: usize, chunk_size: usize) -> anyhow::Result<Self> {
            let net = MemoryNetwork::new();
            let mut nodes = Vec::new();
            let mut storages = Vec::new();
            for index in 0..size {
                let storage = Arc::new(MemoryStorage::new());
                let (transport, incoming) = net.bind(addr(index));
                let config = StreamingConfig {
                    shard_count: shards,
                    chunk_size,
                    ..Default::default()
                };
                let mut node = StreamNode::start(config, Arc::new(transport), storage.clone())?;
                node.serve(incoming);
                nodes.push(node);
                storages.push(storage);
            }
            Ok(Self {
                net,
                nodes,
                storages,
            })
        }

        async fn shutdown(self) -> anyhow::Result<()> {
            for node in self.nodes {
                node.shutdown().await?;
            }
            Ok(())
        }
    }

    async fn eventually_empty(node: &StreamNode) -> anyhow::Result<()> {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !node.get_current_streams().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_two_peers_complete_and_unregister() -> anyhow::Result<()> {
        let cluster = Cluster::start(3, 2, 16)?;
        cluster.storages[0].insert_file(table(), "to-1.db", Bytes::from(vec![1u8; 100]));
        let to_one = FileDescriptor::new(table(), "to-1.db", 100);
        cluster.storages[0].insert_file(table(), "to-2.db", Bytes::from(vec![2u8; 60]));
        let to_two = FileDescriptor::new(table(), "to-2.db", 60);

        let plan_id = PlanId::from_u128(1);
        let mut plan = StreamPlan::new("repair")
            .with_plan_id(plan_id)
            .transfer_files(addr(1), [to_one])
            .transfer_files(addr(2), [to_two])
            .execute(&cluster.nodes[0])
            .await?;

        let outcome = plan.wait().await?;
        assert!(outcome.is_success());
        assert_eq!(outcome.sessions.len(), 2);
        for session in &outcome.sessions {
            assert_eq!(session.state, SessionState::Completed);
            assert_eq!(session.files_sent, 1);
            assert!(session.sending_files.is_empty());
        }

        assert_eq!(cluster.storages[1].file(table(), "to-1.db").unwrap().len(), 100);
        assert_eq!(cluster.storages[2].file(table(), "to-2.db").unwrap().len(), 60);

        for node in &cluster.nodes {
            eventually_empty(node).await?;
        }
        cluster.shutdown().await
    }

    #[tokio::test]
    async fn test_one_peer_disconnects_other_completes() -> anyhow::Result<()> {
        let cluster = Cluster::start(3, 2, 8)?;
        cluster.storages[0].insert_file(table(), "big.db", Bytes::from(vec![9u8; 256]));
        let file = FileDescriptor::new(table(), "big.db", 256);
        // Prepare, header and two chunks reach peer 2, then the link drops
        cluster.net.disconnect_after(addr(2), 4);

        let mut plan = StreamPlan::new("decommission")
            .transfer_files(addr(1), [file.clone()])
            .transfer_files(addr(2), [file])
            .execute(&cluster.nodes[0])
            .await?;

        let outcome = plan.wait().await?;
        assert!(!outcome.is_success());
        let by_peer = |peer| {
            outcome
                .sessions
                .iter()
                .find(|s| s.peer == peer)
                .cloned()
                .unwrap()
        };
        let healthy = by_peer(addr(1));
        let broken = by_peer(addr(2));
        assert_eq!(healthy.state, SessionState::Completed);
        assert_eq!(broken.state, SessionState::Failed);
        assert_eq!(broken.failure, Some(FailureReason::ConnectionLost));
        assert!(broken.sending_files.is_empty());

        // The receiving side let go of the half-written file
        eventually_empty(&cluster.nodes[2]).await?;
        assert!(cluster.storages[2].partial_files().is_empty());
        assert!(cluster.storages[2].file(table(), "big.db").is_none());
        assert!(cluster.storages[1].file(table(), "big.db").is_some());

        cluster.shutdown().await
    }

    #[tokio::test]
    async fn test_concurrent_reads_see_bounded_progress() -> anyhow::Result<()> {
        let cluster = Cluster::start(2, 3, 16)?;
        cluster.net.set_latency(Some(Duration::from_millis(1)));
        cluster.storages[0].insert_file(table(), "data.db", Bytes::from(vec![3u8; 2048]));
        cluster.storages[1].insert_file(TableId::from_u128(2), "back.db", Bytes::from(vec![4u8; 512]));

        let mut plan = StreamPlan::new("bootstrap")
            .transfer_ranges(addr(1), [table()])
            .request_ranges(addr(1), [TableId::from_u128(2)])
            .execute(&cluster.nodes[0])
            .await?;

        let mut observed = 0;
        while plan.outcome().is_none() {
            for node in &cluster.nodes {
                for state in node.get_current_streams().await {
                    for session in &state.sessions {
                        for progress in session
                            .sending_files
                            .values()
                            .chain(session.receiving_files.values())
                        {
                            assert!(progress.current_bytes() <= progress.total_bytes());
                            observed += 1;
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        assert!(observed > 0, "never caught a transfer in flight");

        let outcome = plan.wait().await?;
        assert!(outcome.is_success());
        let session = &outcome.sessions[0];
        assert_eq!(session.total_size_sent(), 2048);
        assert_eq!(session.total_size_received(), 512);
        assert_eq!(cluster.storages[0].file(TableId::from_u128(2), "back.db").unwrap().len(), 512);

        cluster.shutdown().await
    }

    #[tokio::test]
    async fn test_abort_mid_transfer_aborts_every_session() -> anyhow::Result<()> {
        let cluster = Cluster::start(3, 2, 4)?;
        cluster.net.set_latency(Some(Duration::from_millis(1)));
        cluster.storages[0].insert_file(table(), "slow.db", Bytes::from(vec![5u8; 64 * 1024]));

        let mut plan = StreamPlan::new("rebuild")
            .transfer_ranges(addr(1), [table()])
            .transfer_ranges(addr(2), [table()])
            .execute(&cluster.nodes[0])
            .await?;
        let mut events = plan.subscribe();

        // Wait until receiving has started somewhere
        loop {
            match events.recv().await {
                Ok(StreamEvent::Progress { progress, .. })
                    if progress.direction() == Direction::Send && progress.current_bytes() > 8 =>
                {
                    break
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => anyhow::bail!("event stream closed: {}", e),
            }
        }
        cluster.nodes[0].abort_plan(plan.plan_id()).await?;

        let outcome = plan.wait().await?;
        assert!(!outcome.is_success());
        for session in &outcome.sessions {
            assert_eq!(session.state, SessionState::Aborted);
            assert_eq!(session.failure, Some(FailureReason::TransferAborted));
            assert!(session.sending_files.is_empty());
        }

        for (node, storage) in cluster.nodes.iter().zip(&cluster.storages).skip(1) {
            eventually_empty(node).await?;
            assert!(storage.partial_files().is_empty());
            assert!(storage.file(table(), "slow.db").is_none());
        }
        cluster.shutdown().await
    }

    #[tokio::test]
    async fn test_duplicate_plan_on_same_node() -> anyhow::Result<()> {
        let cluster = Cluster::start(1, 2, 64)?;
        // Bound but nobody accepts, so the first plan stays in PREPARING
        let (_silent, _silent_in): (MemoryTransport, _) = cluster.net.bind(addr(9));

        let plan_id = PlanId::new();
        let mut first = cluster.nodes[0]
            .start_plan(plan_id, "first", vec![SessionSpec::new(addr(9))])
            .await?;
        let err = cluster.nodes[0]
            .start_plan(plan_id, "second", vec![SessionSpec::new(addr(9))])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::DuplicatePlan { .. }));

        let streams = cluster.nodes[0].get_current_streams().await;
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].description, "first");
        assert_eq!(streams[0].sessions[0].state, SessionState::Preparing);

        cluster.nodes[0].abort_plan(plan_id).await?;
        let outcome = first.wait().await?;
        assert_eq!(outcome.sessions[0].state, SessionState::Aborted);
        cluster.shutdown().await
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails_plan() -> anyhow::Result<()> {
        let cluster = Cluster::start(2, 1, 64)?;
        cluster.net.set_unreachable(addr(1), true);

        let mut plan = cluster.nodes[0]
            .start_plan(PlanId::new(), "repair", vec![SessionSpec::new(addr(1))])
            .await?;
        let outcome = plan.wait().await?;
        assert_eq!(outcome.sessions[0].state, SessionState::Failed);
        assert_eq!(outcome.sessions[0].failure, Some(FailureReason::PeerUnreachable));

        eventually_empty(&cluster.nodes[0]).await?;
        cluster.shutdown().await
    }

    #[tokio::test]
    async fn test_compressed_transfer_reports_uncompressed_bytes() -> anyhow::Result<()> {
        let net = MemoryNetwork::new();
        let mut nodes = Vec::new();
        let mut storages = Vec::new();
        for index in 0..2 {
            let storage = Arc::new(MemoryStorage::new());
            let (transport, incoming) = net.bind(addr(index));
            let config = StreamingConfig {
                shard_count: 1,
                chunk_size: 1024,
                compress: true,
                ..Default::default()
            };
            let mut node = StreamNode::start(config, Arc::new(transport), storage.clone())?;
            node.serve(incoming);
            nodes.push(node);
            storages.push(storage);
        }
        storages[0].insert_file(table(), "zeros.db", Bytes::from(vec![0u8; 10_000]));

        let mut plan = StreamPlan::new("compressed")
            .transfer_ranges(addr(1), [table()])
            .execute(&nodes[0])
            .await?;
        let outcome = plan.wait().await?;
        assert!(outcome.is_success());
        assert_eq!(outcome.sessions[0].bytes_sent, 10_000);
        assert_eq!(&storages[1].file(table(), "zeros.db").unwrap()[..], &[0u8; 10_000][..]);

        for node in nodes {
            node.shutdown().await?;
        }
        Ok(())
    }
}
