//! One conversation with one peer for one plan.
//!
//! A [`StreamSession`] is owned by exactly one task on its shard. That task
//! is the only writer of the session's [`SessionInfo`]; everybody else holds a
//! [`SessionHandle`] and reads by-value snapshots from a `watch` channel.
//!
//! # Conversation
//!
//! ```text
//! initiator                         follower
//!    | --- Prepare ------------------> |
//!    | <-------------- PrepareAck ---- |   both: Preparing -> Streaming
//!    | --- FileHeader/Chunk*/FileEnd > |
//!    | <---------------- Received ---- |   (per file)
//!    | --- SendDone -----------------> |
//!    | <- FileHeader/Chunk*/FileEnd -- |
//!    | --- Received -----------------> |   (per file)
//!    | <---------------- SendDone ---- |
//!    | --- Complete -----------------> |
//!    | <---------------- Complete ---- |   both: Streaming -> Completed
//! ```

use crate::error::{FailureReason, Result, StreamError};
use crate::storage::StreamStorage;
use crate::streaming::events::{emit, EventSender, StreamEvent};
use crate::streaming::protocol::{
    negotiate_version, Chunk, ChunkFlags, FileEnd, FileHeader, Message, Prepare, PrepareAck,
    Received, SendDone, SessionFailed, VersionNegotiationResult, PROTOCOL_VERSION,
};
use crate::streaming::types::{
    Direction, FileDescriptor, PlanId, ProgressInfo, SessionInfo, SessionState, StreamSummary,
    TableId,
};
use crate::transport::{BoxConnection, PeerTransport};
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Collaborators every session on a shard shares.
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn PeerTransport>,
    pub storage: Arc<dyn StreamStorage>,
    pub chunk_size: usize,
    pub compress: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Follower,
}

/// What a plan wants from one peer: files to push, tables to pull.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub peer: SocketAddr,
    pub files: Vec<FileDescriptor>,
    pub requests: Vec<TableId>,
}

impl SessionSpec {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            peer,
            files: Vec::new(),
            requests: Vec::new(),
        }
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = FileDescriptor>) -> Self {
        self.files.extend(files);
        self
    }

    pub fn with_requests(mut self, tables: impl IntoIterator<Item = TableId>) -> Self {
        self.requests.extend(tables);
        self
    }

    /// One summary per table, in order of first appearance.
    pub fn summaries(&self) -> Vec<StreamSummary> {
        let mut summaries: Vec<StreamSummary> = Vec::new();
        for file in &self.files {
            match summaries.iter_mut().find(|s| s.table_id == file.table_id) {
                Some(s) => {
                    s.files = s.files.saturating_add(1);
                    s.total_size = s.total_size.saturating_add(file.size);
                }
                None => summaries.push(StreamSummary::new(file.table_id, 1, file.size)),
            }
        }
        summaries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Pending,
    Active,
    Completed,
}

/// One entry of the session's ordered transfer log.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub file: FileDescriptor,
    pub direction: Direction,
    pub status: TransferStatus,
}

/// Read side of a session. Cheap to clone; never blocks the session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    info: watch::Receiver<SessionInfo>,
}

impl SessionHandle {
    pub fn snapshot(&self) -> SessionInfo {
        self.info.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.info.borrow().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Resolve once the session reached a terminal state.
    pub async fn wait_terminal(&mut self) -> SessionInfo {
        let terminal = self
            .info
            .wait_for(|i| i.state.is_terminal())
            .await
            .map(|info| info.clone())
            .ok();
        // Writer gone: whatever was published last is final
        terminal.unwrap_or_else(|| self.snapshot())
    }
}

pub struct StreamSession {
    plan_id: PlanId,
    description: String,
    role: SessionRole,
    ctx: SessionContext,
    info: watch::Sender<SessionInfo>,
    transfers: Vec<Transfer>,
    requests: Vec<TableId>,
    inbound: Option<Prepare>,
    conn: Option<BoxConnection>,
    /// Files being received, by name; discarded if the session dies.
    receiving: HashMap<String, FileDescriptor>,
    abort: watch::Receiver<bool>,
    events: EventSender,
}

impl StreamSession {
    /// Session this node initiates towards `spec.peer`. Nothing is sent
    /// until [`StreamSession::open`].
    pub fn new(
        plan_id: PlanId,
        description: impl Into<String>,
        session_index: u32,
        spec: SessionSpec,
        ctx: SessionContext,
        abort: watch::Receiver<bool>,
        events: EventSender,
    ) -> Self {
        let mut info = SessionInfo::new(spec.peer, spec.peer, session_index);
        info.sending_summaries = spec.summaries();
        let transfers = spec
            .files
            .into_iter()
            .map(|file| Transfer {
                file,
                direction: Direction::Send,
                status: TransferStatus::Pending,
            })
            .collect();

        Self {
            plan_id,
            description: description.into(),
            role: SessionRole::Initiator,
            ctx,
            info: watch::channel(info).0,
            transfers,
            requests: spec.requests,
            inbound: None,
            conn: None,
            receiving: HashMap::new(),
            abort,
            events,
        }
    }

    /// Session opened by a peer whose `Prepare` already arrived on `conn`.
    pub fn incoming(
        conn: BoxConnection,
        prepare: Prepare,
        ctx: SessionContext,
        abort: watch::Receiver<bool>,
        events: EventSender,
    ) -> Self {
        let mut info = SessionInfo::new(conn.peer(), conn.connecting(), prepare.session_index);
        info.receiving_summaries = prepare.summaries.clone();

        Self {
            plan_id: prepare.plan_id,
            description: prepare.description.clone(),
            role: SessionRole::Follower,
            ctx,
            info: watch::channel(info).0,
            transfers: Vec::new(),
            requests: prepare.requests.clone(),
            inbound: Some(prepare),
            conn: Some(conn),
            receiving: HashMap::new(),
            abort,
            events,
        }
    }

    pub fn plan_id(&self) -> PlanId {
        self.plan_id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn peer(&self) -> SocketAddr {
        self.info.borrow().peer
    }

    pub fn session_index(&self) -> u32 {
        self.info.borrow().session_index
    }

    pub fn state(&self) -> SessionState {
        self.info.borrow().state
    }

    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            info: self.info.subscribe(),
        }
    }

    /// Frozen copy of the current state.
    pub fn snapshot(&self) -> SessionInfo {
        self.info.borrow().clone()
    }

    // =========================================================================
    // Driver
    // =========================================================================

    /// Drive the whole conversation to a terminal state and return the final
    /// snapshot. Never returns while the session is still live.
    pub async fn run(mut self) -> SessionInfo {
        let result = match self.role {
            SessionRole::Initiator => self.drive_initiator().await,
            SessionRole::Follower => self.drive_follower().await,
        };
        if let Err(e) = result {
            self.terminate(&e).await;
        }

        let final_info = self.snapshot();
        emit(
            &self.events,
            StreamEvent::SessionComplete {
                plan_id: self.plan_id,
                peer: final_info.peer,
                session_index: final_info.session_index,
                state: final_info.state,
                failure: final_info.failure.clone(),
            },
        );
        final_info
    }

    async fn drive_initiator(&mut self) -> Result<()> {
        self.open().await?;
        for file in self.pending(Direction::Send) {
            self.transfer_file(file).await?;
        }
        self.send_done().await?;
        self.receive_until_done().await?;
        self.close().await
    }

    async fn drive_follower(&mut self) -> Result<()> {
        self.accept().await?;
        self.receive_until_done().await?;
        for file in self.pending(Direction::Send) {
            self.transfer_file(file).await?;
        }
        self.send_done().await?;
        self.close().await
    }

    fn pending(&self, direction: Direction) -> Vec<FileDescriptor> {
        self.transfers
            .iter()
            .filter(|t| t.direction == direction && t.status == TransferStatus::Pending)
            .map(|t| t.file.clone())
            .collect()
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Connect to the peer and announce what this session will move.
    /// A failed connect leaves the session `Failed` with `PeerUnreachable`.
    pub async fn open(&mut self) -> Result<()> {
        let result = self.open_inner().await;
        self.settle(result).await
    }

    async fn open_inner(&mut self) -> Result<()> {
        let peer = self.peer();
        let transport = self.ctx.transport.clone();
        let conn = tokio::select! {
            biased;
            Ok(_) = self.abort.wait_for(|a| *a) => return Err(StreamError::TransferAborted),
            conn = transport.connect(peer) => conn?,
        };
        let connecting = conn.connecting();
        self.info.send_modify(|i| i.connecting = connecting);
        self.conn = Some(conn);

        let prepare = Prepare {
            version: PROTOCOL_VERSION,
            plan_id: self.plan_id,
            description: self.description.clone(),
            session_index: self.session_index(),
            summaries: self.info.borrow().sending_summaries.clone(),
            requests: self.requests.clone(),
        };
        self.send(Message::Prepare(prepare)).await?;

        match self.recv().await? {
            Message::PrepareAck(ack) => {
                self.info.send_modify(|i| i.receiving_summaries = ack.summaries);
            }
            other => {
                return Err(StreamError::UnexpectedMessage {
                    expected: "PrepareAck",
                    got: other.name(),
                })
            }
        }
        self.prepared()
    }

    /// Follower side of `open`: resolve the requested tables and answer.
    pub async fn accept(&mut self) -> Result<()> {
        let result = self.accept_inner().await;
        self.settle(result).await
    }

    async fn accept_inner(&mut self) -> Result<()> {
        let version = self.inbound.as_ref().map(|p| p.version).unwrap_or(0);
        if let VersionNegotiationResult::TooOld { .. } | VersionNegotiationResult::TooNew { .. } =
            negotiate_version(version)
        {
            return Err(StreamError::protocol(format!(
                "unsupported protocol version {}",
                version
            )));
        }

        let mut summaries = Vec::with_capacity(self.requests.len());
        for table in self.requests.clone() {
            let summary = self.ctx.storage.enumerate_ranges(table).await?;
            let files = self.ctx.storage.list_files(table).await?;
            if StreamSummary::of_files(table, &files) != summary {
                return Err(StreamError::storage(format!(
                    "range of table {} changed while preparing",
                    table
                )));
            }
            summaries.push(summary);
            self.transfers.extend(files.into_iter().map(|file| Transfer {
                file,
                direction: Direction::Send,
                status: TransferStatus::Pending,
            }));
        }
        self.info
            .send_modify(|i| i.sending_summaries = summaries.clone());

        self.send(Message::PrepareAck(PrepareAck { summaries })).await?;
        self.prepared()
    }

    fn prepared(&mut self) -> Result<()> {
        self.transition(SessionState::Streaming)?;
        let info = self.snapshot();
        info!(
            plan_id = %self.plan_id,
            peer = %info.peer,
            session_index = info.session_index,
            sending = info.total_files_to_send(),
            receiving = info.total_files_to_receive(),
            "Stream session prepared"
        );
        emit(
            &self.events,
            StreamEvent::SessionPrepared {
                plan_id: self.plan_id,
                peer: info.peer,
                session_index: info.session_index,
            },
        );
        Ok(())
    }

    /// Send one file to the peer and wait for its acknowledgement.
    pub async fn transfer_file(&mut self, file: FileDescriptor) -> Result<()> {
        let result = self.transfer_file_inner(file).await;
        self.settle(result).await
    }

    async fn transfer_file_inner(&mut self, file: FileDescriptor) -> Result<()> {
        self.ensure_streaming()?;
        if !self
            .info
            .borrow()
            .sending_summaries
            .iter()
            .any(|s| s.table_id == file.table_id)
        {
            return Err(StreamError::protocol(format!(
                "file {} belongs to no announced summary",
                file.name
            )));
        }

        let slot = self.activate(&file, Direction::Send);
        let (peer, index) = (self.peer(), self.session_index());
        let name = file.name.clone();

        self.send(Message::FileHeader(FileHeader {
            table_id: file.table_id,
            file_name: name.clone(),
            size: file.size,
        }))
        .await?;
        let progress = ProgressInfo::new(peer, index, name.clone(), Direction::Send, file.size);
        self.info.send_modify(|i| {
            i.sending_files.insert(name.clone(), progress);
        });

        let mut offset = 0u64;
        while offset < file.size {
            let want = (file.size - offset).min(self.ctx.chunk_size as u64) as usize;
            let data = self.ctx.storage.read_chunk(&file, offset, want).await?;
            if data.is_empty() {
                return Err(StreamError::storage(format!(
                    "{} ended at {} of {} announced bytes",
                    name, offset, file.size
                )));
            }
            let len = data.len() as u64;
            let (flags, data) = if self.ctx.compress {
                (
                    ChunkFlags::COMPRESSED,
                    Bytes::from(lz4_flex::compress_prepend_size(&data)),
                )
            } else {
                (ChunkFlags::empty(), data)
            };

            self.send(Message::Chunk(Chunk {
                file_name: name.clone(),
                offset,
                flags,
                data,
            }))
            .await?;
            self.advance(Direction::Send, &name, len)?;
            offset += len;
        }

        self.send(Message::FileEnd(FileEnd {
            file_name: name.clone(),
        }))
        .await?;
        match self.recv().await? {
            Message::Received(ack) if ack.file_name == name => {}
            other => {
                return Err(StreamError::UnexpectedMessage {
                    expected: "Received",
                    got: other.name(),
                })
            }
        }

        self.info.send_modify(|i| {
            i.sending_files.remove(&name);
            i.files_sent += 1;
            i.bytes_sent += file.size;
        });
        self.transfers[slot].status = TransferStatus::Completed;
        debug!(plan_id = %self.plan_id, peer = %peer, file = %name, "File sent");
        Ok(())
    }

    /// Receive the file announced by `header`, commit it and acknowledge.
    pub async fn receive_file(&mut self, header: FileHeader) -> Result<()> {
        let result = self.receive_file_inner(header).await;
        self.settle(result).await
    }

    async fn receive_file_inner(&mut self, header: FileHeader) -> Result<()> {
        self.ensure_streaming()?;
        if !self
            .info
            .borrow()
            .receiving_summaries
            .iter()
            .any(|s| s.table_id == header.table_id)
        {
            return Err(StreamError::protocol(format!(
                "peer announced {} for a table outside the session summaries",
                header.file_name
            )));
        }
        if self.receiving.contains_key(&header.file_name) {
            return Err(StreamError::protocol(format!(
                "{} announced twice",
                header.file_name
            )));
        }

        let file = FileDescriptor::new(header.table_id, header.file_name, header.size);
        let name = file.name.clone();
        let slot = self.activate(&file, Direction::Receive);
        self.receiving.insert(name.clone(), file.clone());
        let progress = ProgressInfo::new(
            self.peer(),
            self.session_index(),
            name.clone(),
            Direction::Receive,
            file.size,
        );
        self.info.send_modify(|i| {
            i.receiving_files.insert(name.clone(), progress);
        });

        let mut received = 0u64;
        loop {
            match self.recv().await? {
                Message::Chunk(chunk) if chunk.file_name == name => {
                    if chunk.offset != received {
                        return Err(StreamError::protocol(format!(
                            "{}: chunk at offset {}, expected {}",
                            name, chunk.offset, received
                        )));
                    }
                    let remaining = file.size - received;
                    let data = if chunk.flags.contains(ChunkFlags::COMPRESSED) {
                        // Bound the allocation by what the header announced
                        let raw_len = compressed_len(&chunk.data).ok_or_else(|| {
                            StreamError::protocol(format!("{}: compressed chunk too short", name))
                        })?;
                        if raw_len > remaining {
                            return Err(StreamError::ProgressOverflow {
                                file: name,
                                attempted: received.saturating_add(raw_len),
                                total: file.size,
                            });
                        }
                        Bytes::from(lz4_flex::decompress_size_prepended(&chunk.data).map_err(
                            |e| StreamError::protocol(format!("{}: bad compressed chunk: {}", name, e)),
                        )?)
                    } else {
                        chunk.data
                    };
                    let len = data.len() as u64;
                    if len > remaining {
                        return Err(StreamError::ProgressOverflow {
                            file: name,
                            attempted: received.saturating_add(len),
                            total: file.size,
                        });
                    }

                    self.ctx.storage.write_chunk(&file, received, data).await?;
                    self.advance(Direction::Receive, &name, len)?;
                    received += len;
                }
                Message::FileEnd(end) if end.file_name == name => break,
                other => {
                    return Err(StreamError::UnexpectedMessage {
                        expected: "Chunk or FileEnd",
                        got: other.name(),
                    })
                }
            }
        }

        if received != file.size {
            return Err(StreamError::protocol(format!(
                "{} ended after {} of {} bytes",
                name, received, file.size
            )));
        }
        self.ctx.storage.commit_file(&file).await?;
        self.receiving.remove(&name);
        self.send(Message::Received(Received {
            file_name: name.clone(),
        }))
        .await?;

        self.info.send_modify(|i| {
            i.receiving_files.remove(&name);
            i.files_received += 1;
            i.bytes_received += file.size;
        });
        self.transfers[slot].status = TransferStatus::Completed;
        debug!(plan_id = %self.plan_id, file = %name, "File received");
        Ok(())
    }

    async fn send_done(&mut self) -> Result<()> {
        let files = self
            .transfers
            .iter()
            .filter(|t| t.direction == Direction::Send && t.status == TransferStatus::Completed)
            .count() as u64;
        self.send(Message::SendDone(SendDone { files })).await
    }

    async fn receive_until_done(&mut self) -> Result<()> {
        loop {
            match self.recv().await? {
                Message::FileHeader(header) => self.receive_file(header).await?,
                Message::SendDone(_) => return Ok(()),
                other => {
                    return Err(StreamError::UnexpectedMessage {
                        expected: "FileHeader or SendDone",
                        got: other.name(),
                    })
                }
            }
        }
    }

    /// Finish the conversation. Reaches `Completed` only if every announced
    /// summary was satisfied in both directions, otherwise `Failed` with
    /// `IncompleteSummary`.
    pub async fn close(&mut self) -> Result<()> {
        let result = self.close_inner().await;
        self.settle(result).await
    }

    async fn close_inner(&mut self) -> Result<()> {
        if self.role == SessionRole::Follower {
            match self.recv().await? {
                Message::Complete => {}
                other => {
                    return Err(StreamError::UnexpectedMessage {
                        expected: "Complete",
                        got: other.name(),
                    })
                }
            }
        }

        let pending = self.unsatisfied_summaries();
        if pending > 0 {
            return Err(StreamError::IncompleteSummary { pending });
        }
        self.send(Message::Complete).await?;

        if self.role == SessionRole::Initiator {
            match self.recv().await? {
                Message::Complete => {}
                other => {
                    return Err(StreamError::UnexpectedMessage {
                        expected: "Complete",
                        got: other.name(),
                    })
                }
            }
        }

        self.transition(SessionState::Completed)?;
        if let Some(mut conn) = self.conn.take() {
            let _ = conn.close().await;
        }
        let info = self.snapshot();
        info!(
            plan_id = %self.plan_id,
            peer = %info.peer,
            session_index = info.session_index,
            files_sent = info.files_sent,
            files_received = info.files_received,
            "Stream session completed"
        );
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_streaming(&self) -> Result<()> {
        match self.state() {
            SessionState::Streaming => Ok(()),
            other => Err(StreamError::protocol(format!(
                "session is {}, transfers need STREAMING",
                other
            ))),
        }
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        let current = self.state();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(StreamError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        self.info.send_modify(|i| i.state = next);
        debug!(plan_id = %self.plan_id, from = %current, to = %next, "Session state changed");
        Ok(())
    }

    /// Mark the matching pending transfer active, or log a new one.
    fn activate(&mut self, file: &FileDescriptor, direction: Direction) -> usize {
        let existing = self.transfers.iter().position(|t| {
            t.direction == direction
                && t.status == TransferStatus::Pending
                && t.file.name == file.name
                && t.file.table_id == file.table_id
        });
        match existing {
            Some(slot) => {
                self.transfers[slot].status = TransferStatus::Active;
                slot
            }
            None => {
                self.transfers.push(Transfer {
                    file: file.clone(),
                    direction,
                    status: TransferStatus::Active,
                });
                self.transfers.len() - 1
            }
        }
    }

    fn advance(&mut self, direction: Direction, name: &str, bytes: u64) -> Result<()> {
        let mut outcome = Err(StreamError::protocol(format!(
            "no transfer in progress for {}",
            name
        )));
        self.info.send_modify(|i| {
            let files = match direction {
                Direction::Send => &mut i.sending_files,
                Direction::Receive => &mut i.receiving_files,
            };
            if let Some(progress) = files.get_mut(name) {
                outcome = progress.advance(bytes).map(|_| progress.clone());
            }
        });
        let progress = outcome?;
        emit(
            &self.events,
            StreamEvent::Progress {
                plan_id: self.plan_id,
                progress,
            },
        );
        Ok(())
    }

    /// Announced summaries not yet covered by completed transfers.
    pub fn unsatisfied_summaries(&self) -> usize {
        let mut done: HashMap<(Direction, TableId), (u32, u64)> = HashMap::new();
        for t in self
            .transfers
            .iter()
            .filter(|t| t.status == TransferStatus::Completed)
        {
            let entry = done.entry((t.direction, t.file.table_id)).or_default();
            entry.0 = entry.0.saturating_add(1);
            entry.1 = entry.1.saturating_add(t.file.size);
        }

        let info = self.info.borrow();
        let unmet = |direction: Direction, summaries: &[StreamSummary]| {
            summaries
                .iter()
                .filter(|s| {
                    let (files, bytes) = done
                        .get(&(direction, s.table_id))
                        .copied()
                        .unwrap_or_default();
                    files < s.files || bytes < s.total_size
                })
                .count()
        };
        unmet(Direction::Send, &info.sending_summaries)
            + unmet(Direction::Receive, &info.receiving_summaries)
    }

    async fn send(&mut self, msg: Message) -> Result<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| StreamError::protocol("session has no connection"))?;
        let frame = msg.encode()?;
        tokio::select! {
            biased;
            Ok(_) = self.abort.wait_for(|a| *a) => Err(StreamError::TransferAborted),
            sent = conn.send(frame) => sent,
        }
    }

    /// Next message from the peer. A peer-side failure or abort surfaces as
    /// the matching error.
    async fn recv(&mut self) -> Result<Message> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| StreamError::protocol("session has no connection"))?;
        let frame = tokio::select! {
            biased;
            Ok(_) = self.abort.wait_for(|a| *a) => return Err(StreamError::TransferAborted),
            frame = conn.receive() => frame?,
        };
        match Message::decode(frame)? {
            Message::SessionFailed(failed) => Err(StreamError::RemoteFailure(failed.reason)),
            Message::Abort => Err(StreamError::TransferAborted),
            msg => Ok(msg),
        }
    }

    async fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.terminate(e).await;
        }
        result
    }

    /// Move to `Failed` or `Aborted`, tell the peer when the link still
    /// works, and hand partially received files back to storage.
    async fn terminate(&mut self, err: &StreamError) {
        if self.state().is_terminal() {
            return;
        }
        let reason = FailureReason::from(err);
        let next = match err {
            StreamError::TransferAborted => SessionState::Aborted,
            _ => SessionState::Failed,
        };

        if let Some(conn) = self.conn.as_mut() {
            if !err.is_transport() && !matches!(err, StreamError::RemoteFailure(_)) {
                let goodbye = match next {
                    SessionState::Aborted => Message::Abort,
                    _ => Message::SessionFailed(SessionFailed {
                        reason: reason.to_string(),
                    }),
                };
                if let Ok(frame) = goodbye.encode() {
                    let _ = conn.send(frame).await;
                }
            }
            let _ = conn.close().await;
        }
        self.conn = None;

        let partial: Vec<FileDescriptor> = self.receiving.drain().map(|(_, f)| f).collect();
        for file in &partial {
            if let Err(e) = self.ctx.storage.discard_partial(file).await {
                warn!(plan_id = %self.plan_id, file = %file.name, "Failed to discard partial file: {}", e);
            }
        }
        for t in self
            .transfers
            .iter_mut()
            .filter(|t| t.status == TransferStatus::Active)
        {
            t.status = TransferStatus::Pending;
        }

        let failure = reason.clone();
        self.info.send_modify(|i| {
            i.sending_files.clear();
            i.receiving_files.clear();
            i.state = next;
            i.failure = Some(failure);
        });
        warn!(
            plan_id = %self.plan_id,
            peer = %self.peer(),
            state = %next,
            reason = %reason,
            discarded = partial.len(),
            "Stream session terminated"
        );
    }
}

/// Uncompressed length an lz4 chunk declares in its little-endian prefix.
fn compressed_len(data: &[u8]) -> Option<u64> {
    let prefix: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(prefix) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::streaming::events::event_channel;
    use crate::transport::MemoryNetwork;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    struct Pair {
        net: MemoryNetwork,
        initiator_ctx: SessionContext,
        follower_ctx: SessionContext,
        source: Arc<MemoryStorage>,
        sink: Arc<MemoryStorage>,
        incoming: crate::transport::MemoryIncoming,
    }

    fn pair(chunk_size: usize, compress: bool) -> Pair {
        let net = MemoryNetwork::new();
        let (a, _a_in) = net.bind(addr(1));
        let (b, b_in) = net.bind(addr(2));
        let source = Arc::new(MemoryStorage::new());
        let sink = Arc::new(MemoryStorage::new());
        Pair {
            initiator_ctx: SessionContext {
                transport: Arc::new(a),
                storage: source.clone(),
                chunk_size,
                compress,
            },
            follower_ctx: SessionContext {
                transport: Arc::new(b),
                storage: sink.clone(),
                chunk_size,
                compress,
            },
            net,
            source,
            sink,
            incoming: b_in,
        }
    }

    async fn spawn_follower(
        mut incoming: crate::transport::MemoryIncoming,
        ctx: SessionContext,
        abort: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<SessionInfo> {
        use crate::transport::Incoming;
        tokio::spawn(async move {
            let mut conn = incoming.accept().await.unwrap();
            let prepare = match Message::decode(conn.receive().await.unwrap()).unwrap() {
                Message::Prepare(p) => p,
                other => panic!("Expected Prepare, got {:?}", other),
            };
            StreamSession::incoming(conn, prepare, ctx, abort, event_channel(64))
                .run()
                .await
        })
    }

    #[tokio::test]
    async fn test_session_happy_path_both_directions() {
        let p = pair(4, true);
        let out_table = TableId::from_u128(1);
        let in_table = TableId::from_u128(2);
        p.source.insert_file(out_table, "out.db", Bytes::from_static(b"0123456789"));
        p.sink.insert_file(in_table, "in.db", Bytes::from_static(b"abcdef"));

        let (_abort_tx, abort_rx) = watch::channel(false);
        let follower = spawn_follower(p.incoming, p.follower_ctx, abort_rx.clone()).await;

        let spec = SessionSpec::new(addr(2))
            .with_files(vec![FileDescriptor::new(out_table, "out.db", 10)])
            .with_requests(vec![in_table]);
        let session = StreamSession::new(
            PlanId::from_u128(1),
            "repair",
            0,
            spec,
            p.initiator_ctx,
            abort_rx,
            event_channel(64),
        );
        let handle = session.handle();
        assert_eq!(handle.state(), SessionState::Preparing);

        let done = session.run().await;
        assert_eq!(done.state, SessionState::Completed);
        assert_eq!(done.files_sent, 1);
        assert_eq!(done.files_received, 1);
        assert!(done.sending_files.is_empty());
        assert_eq!(handle.snapshot().state, SessionState::Completed);

        let remote = follower.await.unwrap();
        assert_eq!(remote.state, SessionState::Completed);
        assert_eq!(remote.peer, addr(1));

        assert_eq!(&p.sink.file(out_table, "out.db").unwrap()[..], b"0123456789");
        assert_eq!(&p.source.file(in_table, "in.db").unwrap()[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_open_unreachable_peer_fails() {
        let p = pair(1024, false);
        p.net.set_unreachable(addr(2), true);
        let (_abort_tx, abort_rx) = watch::channel(false);
        let mut session = StreamSession::new(
            PlanId::new(),
            "bootstrap",
            0,
            SessionSpec::new(addr(2)),
            p.initiator_ctx,
            abort_rx,
            event_channel(8),
        );

        let err = session.open().await.unwrap_err();
        assert!(matches!(err, StreamError::PeerUnreachable { .. }));
        let info = session.snapshot();
        assert_eq!(info.state, SessionState::Failed);
        assert_eq!(info.failure, Some(FailureReason::PeerUnreachable));
    }

    #[tokio::test]
    async fn test_connection_lost_mid_transfer_discards_partial() {
        let p = pair(2, false);
        let table = TableId::from_u128(3);
        p.source.insert_file(table, "big.db", Bytes::from(vec![7u8; 64]));
        // Prepare + header + a few chunks, then the link drops
        p.net.disconnect_after(addr(2), 5);

        let (_abort_tx, abort_rx) = watch::channel(false);
        let follower = spawn_follower(p.incoming, p.follower_ctx, abort_rx.clone()).await;
        let spec = SessionSpec::new(addr(2)).with_files(vec![FileDescriptor::new(table, "big.db", 64)]);
        let session = StreamSession::new(
            PlanId::new(),
            "decommission",
            0,
            spec,
            p.initiator_ctx,
            abort_rx,
            event_channel(8),
        );

        let done = session.run().await;
        assert_eq!(done.state, SessionState::Failed);
        assert_eq!(done.failure, Some(FailureReason::ConnectionLost));
        assert!(done.sending_files.is_empty());

        let remote = follower.await.unwrap();
        assert_eq!(remote.state, SessionState::Failed);
        assert!(remote.receiving_files.is_empty());
        assert!(p.sink.partial_files().is_empty());
        assert!(p.sink.file(table, "big.db").is_none());
    }

    #[tokio::test]
    async fn test_close_with_unsatisfied_summary_fails() {
        let p = pair(1024, false);
        let table = TableId::from_u128(4);
        p.source.insert_file(table, "a.db", Bytes::from_static(b"abc"));

        let (_abort_tx, abort_rx) = watch::channel(false);
        let follower = spawn_follower(p.incoming, p.follower_ctx, abort_rx.clone()).await;
        let spec = SessionSpec::new(addr(2)).with_files(vec![FileDescriptor::new(table, "a.db", 3)]);
        let mut session = StreamSession::new(
            PlanId::new(),
            "rebuild",
            0,
            spec,
            p.initiator_ctx,
            abort_rx,
            event_channel(8),
        );

        session.open().await.unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.unsatisfied_summaries(), 1);

        // Skip the transfer entirely
        let err = session.close().await.unwrap_err();
        assert!(matches!(err, StreamError::IncompleteSummary { pending: 1 }));
        assert_eq!(session.state(), SessionState::Failed);

        let remote = follower.await.unwrap();
        assert_eq!(remote.state, SessionState::Failed);
        assert!(matches!(remote.failure, Some(FailureReason::Remote(_))));
    }

    #[tokio::test]
    async fn test_abort_mid_transfer() {
        let p = pair(1, false);
        p.net.set_latency(Some(std::time::Duration::from_millis(2)));
        let table = TableId::from_u128(5);
        p.source.insert_file(table, "slow.db", Bytes::from(vec![1u8; 10_000]));

        let (_follower_abort_tx, follower_abort) = watch::channel(false);
        let follower = spawn_follower(p.incoming, p.follower_ctx, follower_abort).await;

        let (abort_tx, abort_rx) = watch::channel(false);
        let spec =
            SessionSpec::new(addr(2)).with_files(vec![FileDescriptor::new(table, "slow.db", 10_000)]);
        let session = StreamSession::new(
            PlanId::new(),
            "rebuild",
            0,
            spec,
            p.initiator_ctx,
            abort_rx,
            event_channel(8),
        );
        let mut handle = session.handle();
        let driver = tokio::spawn(session.run());

        // Wait until bytes are actually moving
        loop {
            let info = handle.snapshot();
            if info
                .sending_files
                .values()
                .any(|f| f.current_bytes() > 0)
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        abort_tx.send_replace(true);

        let done = driver.await.unwrap();
        assert_eq!(done.state, SessionState::Aborted);
        assert!(done.sending_files.is_empty());
        assert_eq!(handle.wait_terminal().await.state, SessionState::Aborted);

        let remote = follower.await.unwrap();
        assert_eq!(remote.state, SessionState::Aborted);
        assert!(remote.receiving_files.is_empty());
        assert!(p.sink.partial_files().is_empty());
    }

    /// Follower session fed by a hand-driven dialer that announces `size`
    /// bytes and then sends `chunk` as the first piece of the file.
    async fn overrun_follower(size: u64, chunk: Chunk) -> (SessionInfo, Arc<MemoryStorage>, Message) {
        use crate::transport::Incoming;
        let p = pair(1024, false);
        let table = TableId::from_u128(6);
        let mut raw = p.initiator_ctx.transport.connect(addr(2)).await.unwrap();
        let mut incoming = p.incoming;
        let conn = incoming.accept().await.unwrap();

        let prepare = Prepare {
            version: PROTOCOL_VERSION,
            plan_id: PlanId::from_u128(6),
            description: "repair".to_string(),
            session_index: 0,
            summaries: vec![StreamSummary::new(table, 1, size)],
            requests: vec![],
        };
        let (_abort_tx, abort_rx) = watch::channel(false);
        let follower = tokio::spawn(
            StreamSession::incoming(conn, prepare, p.follower_ctx, abort_rx, event_channel(8)).run(),
        );

        let ack = Message::decode(raw.receive().await.unwrap()).unwrap();
        assert!(matches!(ack, Message::PrepareAck(_)));
        let header = Message::FileHeader(FileHeader {
            table_id: table,
            file_name: chunk.file_name.clone(),
            size,
        });
        raw.send(header.encode().unwrap()).await.unwrap();
        raw.send(Message::Chunk(chunk).encode().unwrap()).await.unwrap();

        let reply = Message::decode(raw.receive().await.unwrap()).unwrap();
        (follower.await.unwrap(), p.sink, reply)
    }

    fn assert_overrun_failed(info: &SessionInfo, sink: &MemoryStorage, reply: &Message) {
        assert_eq!(info.state, SessionState::Failed);
        match &info.failure {
            Some(FailureReason::Other(reason)) => {
                assert!(reason.contains("exceed announced size"), "{}", reason)
            }
            other => panic!("Expected overflow failure, got {:?}", other),
        }
        assert!(info.receiving_files.is_empty());
        assert_eq!(info.files_received, 0);
        assert!(sink.partial_files().is_empty());
        assert!(matches!(reply, Message::SessionFailed(_)));
    }

    #[tokio::test]
    async fn test_chunk_past_announced_size_fails_session() {
        let chunk = Chunk {
            file_name: "small.db".to_string(),
            offset: 0,
            flags: ChunkFlags::empty(),
            data: Bytes::from(vec![1u8; 16]),
        };
        let (info, sink, reply) = overrun_follower(8, chunk).await;
        assert_overrun_failed(&info, &sink, &reply);
        assert!(sink.file(TableId::from_u128(6), "small.db").is_none());
    }

    #[tokio::test]
    async fn test_compressed_chunk_checked_before_inflating() {
        // Tiny on the wire, a mebibyte once inflated
        let inflated = vec![0u8; 1024 * 1024];
        let chunk = Chunk {
            file_name: "bomb.db".to_string(),
            offset: 0,
            flags: ChunkFlags::COMPRESSED,
            data: Bytes::from(lz4_flex::compress_prepend_size(&inflated)),
        };
        assert!(chunk.data.len() < 16 * 1024);
        let (info, sink, reply) = overrun_follower(8, chunk).await;
        assert_overrun_failed(&info, &sink, &reply);
    }

    /// Storage whose range summary lags behind its file listing.
    struct StaleRanges(Arc<MemoryStorage>);

    #[async_trait::async_trait]
    impl StreamStorage for StaleRanges {
        async fn list_files(&self, table: TableId) -> Result<Vec<FileDescriptor>> {
            self.0.list_files(table).await
        }

        async fn enumerate_ranges(&self, table: TableId) -> Result<StreamSummary> {
            Ok(StreamSummary::new(table, 0, 0))
        }

        async fn read_chunk(&self, file: &FileDescriptor, offset: u64, len: usize) -> Result<Bytes> {
            self.0.read_chunk(file, offset, len).await
        }

        async fn write_chunk(&self, file: &FileDescriptor, offset: u64, data: Bytes) -> Result<()> {
            self.0.write_chunk(file, offset, data).await
        }

        async fn commit_file(&self, file: &FileDescriptor) -> Result<()> {
            self.0.commit_file(file).await
        }

        async fn discard_partial(&self, file: &FileDescriptor) -> Result<()> {
            self.0.discard_partial(file).await
        }
    }

    #[tokio::test]
    async fn test_accept_summarises_through_enumerate_ranges() {
        let mut p = pair(1024, false);
        let table = TableId::from_u128(7);
        p.sink.insert_file(table, "moved.db", Bytes::from_static(b"abc"));
        p.follower_ctx.storage = Arc::new(StaleRanges(p.sink.clone()));

        let (_abort_tx, abort_rx) = watch::channel(false);
        let follower = spawn_follower(p.incoming, p.follower_ctx, abort_rx.clone()).await;
        let spec = SessionSpec::new(addr(2)).with_requests(vec![table]);
        let mut session = StreamSession::new(
            PlanId::new(),
            "bootstrap",
            0,
            spec,
            p.initiator_ctx,
            abort_rx,
            event_channel(8),
        );

        let err = session.open().await.unwrap_err();
        assert!(matches!(err, StreamError::RemoteFailure(_)));
        assert_eq!(session.state(), SessionState::Failed);

        let remote = follower.await.unwrap();
        assert_eq!(remote.state, SessionState::Failed);
        match remote.failure {
            Some(FailureReason::Other(reason)) => assert!(reason.contains("changed"), "{}", reason),
            other => panic!("Expected storage failure, got {:?}", other),
        }
    }

    #[test]
    fn test_compressed_len_reads_prefix() {
        let data = lz4_flex::compress_prepend_size(b"abcdefgh");
        assert_eq!(compressed_len(&data), Some(8));
        assert_eq!(compressed_len(&[1, 2]), None);
    }

    #[test]
    fn test_spec_summaries_group_by_table() {
        let t1 = TableId::from_u128(1);
        let t2 = TableId::from_u128(2);
        let spec = SessionSpec::new(addr(2)).with_files(vec![
            FileDescriptor::new(t1, "a", 10),
            FileDescriptor::new(t2, "b", 5),
            FileDescriptor::new(t1, "c", 1),
        ]);
        let summaries = spec.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0], StreamSummary::new(t1, 2, 11));
        assert_eq!(summaries[1], StreamSummary::new(t2, 1, 5));
    }
}
