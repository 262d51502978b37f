//! Value types shared by sessions, coordinators and the aggregator.
//!
//! Everything in here is plain data. Live, mutable state stays inside the
//! session that owns it; what crosses shard boundaries is one of these types,
//! by value.

use crate::error::{FailureReason, Result, StreamError};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of one streaming operation. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlanId(Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    pub fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Shard that owns this plan's coordinator on any node with `shard_count` shards.
    pub fn shard_of(&self, shard_count: usize) -> usize {
        (self.as_u128() % shard_count.max(1) as u128) as usize
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for PlanId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| StreamError::protocol(format!("invalid plan id {:?}: {}", s, e)))
    }
}

/// Identifier of a table (column family).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(Uuid);

impl TableId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for TableId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

// =============================================================================
// Direction and session state
// =============================================================================

/// Direction of a file transfer, seen from the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Send,
    Receive,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Send => "SEND",
            Direction::Receive => "RECEIVE",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::Send => Direction::Receive,
            Direction::Receive => Direction::Send,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one peer conversation.
///
/// ```text
/// Preparing -> Streaming -> Completed
///     |            |
///     +------------+-----> Failed
///     +------------+-----> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Preparing,
    Streaming,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Preparing => "PREPARING",
            SessionState::Streaming => "STREAMING",
            SessionState::Completed => "COMPLETED",
            SessionState::Failed => "FAILED",
            SessionState::Aborted => "ABORTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Aborted
        )
    }

    /// Whether `next` is reachable from `self`. Terminal states are final.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Preparing, Streaming) => true,
            (Preparing | Streaming, Failed | Aborted) => true,
            (Streaming, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Summaries and files
// =============================================================================

/// Declared manifest of one table range a session intends to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamSummary {
    pub table_id: TableId,
    pub files: u32,
    pub total_size: u64,
}

impl StreamSummary {
    pub fn new(table_id: TableId, files: u32, total_size: u64) -> Self {
        Self {
            table_id,
            files,
            total_size,
        }
    }

    /// Summary covering exactly `files`.
    pub fn of_files<'a>(table_id: TableId, files: impl IntoIterator<Item = &'a FileDescriptor>) -> Self {
        let (count, size) = files
            .into_iter()
            .fold((0u32, 0u64), |(n, s), f| {
                (n.saturating_add(1), s.saturating_add(f.size))
            });
        Self::new(table_id, count, size)
    }
}

/// One file the storage collaborator can stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileDescriptor {
    pub table_id: TableId,
    pub name: String,
    pub size: u64,
}

impl FileDescriptor {
    pub fn new(table_id: TableId, name: impl Into<String>, size: u64) -> Self {
        Self {
            table_id,
            name: name.into(),
            size,
        }
    }
}

// =============================================================================
// Progress
// =============================================================================

/// Live byte counters of one in-flight file.
///
/// `total_bytes` is fixed at construction and `current_bytes` can only grow
/// up to it; both are private so the only way to move progress is
/// [`ProgressInfo::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressInfo {
    peer: SocketAddr,
    session_index: u32,
    file_name: String,
    direction: Direction,
    current_bytes: u64,
    total_bytes: u64,
}

impl ProgressInfo {
    pub fn new(
        peer: SocketAddr,
        session_index: u32,
        file_name: impl Into<String>,
        direction: Direction,
        total_bytes: u64,
    ) -> Self {
        Self {
            peer,
            session_index,
            file_name: file_name.into(),
            direction,
            current_bytes: 0,
            total_bytes,
        }
    }

    /// Record `bytes` more transferred. Rejects anything past `total_bytes`
    /// and leaves the counters untouched in that case.
    pub fn advance(&mut self, bytes: u64) -> Result<u64> {
        let attempted = self.current_bytes.saturating_add(bytes);
        if attempted > self.total_bytes {
            return Err(StreamError::ProgressOverflow {
                file: self.file_name.clone(),
                attempted,
                total: self.total_bytes,
            });
        }
        self.current_bytes = attempted;
        Ok(self.current_bytes)
    }

    pub fn is_completed(&self) -> bool {
        self.current_bytes == self.total_bytes
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session_index(&self) -> u32 {
        self.session_index
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn current_bytes(&self) -> u64 {
        self.current_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Frozen view of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    /// Address actually dialed; differs from `peer` behind a proxy.
    pub connecting: SocketAddr,
    pub session_index: u32,
    pub state: SessionState,
    pub sending_summaries: Vec<StreamSummary>,
    pub receiving_summaries: Vec<StreamSummary>,
    pub sending_files: BTreeMap<String, ProgressInfo>,
    pub receiving_files: BTreeMap<String, ProgressInfo>,
    /// Files and bytes of transfers that already finished.
    pub files_sent: u64,
    pub bytes_sent: u64,
    pub files_received: u64,
    pub bytes_received: u64,
    pub failure: Option<FailureReason>,
}

impl SessionInfo {
    pub fn new(peer: SocketAddr, connecting: SocketAddr, session_index: u32) -> Self {
        Self {
            peer,
            connecting,
            session_index,
            state: SessionState::Preparing,
            sending_summaries: Vec::new(),
            receiving_summaries: Vec::new(),
            sending_files: BTreeMap::new(),
            receiving_files: BTreeMap::new(),
            files_sent: 0,
            bytes_sent: 0,
            files_received: 0,
            bytes_received: 0,
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SessionState::Failed | SessionState::Aborted)
    }

    pub fn total_files_to_send(&self) -> u64 {
        saturating_sum(self.sending_summaries.iter().map(|s| s.files as u64))
    }

    pub fn total_size_to_send(&self) -> u64 {
        saturating_sum(self.sending_summaries.iter().map(|s| s.total_size))
    }

    pub fn total_files_to_receive(&self) -> u64 {
        saturating_sum(self.receiving_summaries.iter().map(|s| s.files as u64))
    }

    pub fn total_size_to_receive(&self) -> u64 {
        saturating_sum(self.receiving_summaries.iter().map(|s| s.total_size))
    }

    /// Finished bytes plus the in-flight part of files still moving.
    pub fn total_size_sent(&self) -> u64 {
        self.bytes_sent
            .saturating_add(saturating_sum(self.sending_files.values().map(|p| p.current_bytes())))
    }

    pub fn total_size_received(&self) -> u64 {
        self.bytes_received.saturating_add(saturating_sum(
            self.receiving_files.values().map(|p| p.current_bytes()),
        ))
    }
}

// Sizes come from peers and storage; never panic on their sum.
fn saturating_sum(values: impl Iterator<Item = u64>) -> u64 {
    values.fold(0, u64::saturating_add)
}

/// Point-in-time view of one plan as seen on one node.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamState {
    pub plan_id: PlanId,
    pub description: String,
    pub sessions: Vec<SessionInfo>,
}

impl StreamState {
    pub fn has_failed_session(&self) -> bool {
        self.sessions.iter().any(|s| s.is_failed())
    }

    pub fn has_active_session(&self) -> bool {
        self.sessions.iter().any(|s| !s.is_terminal())
    }
}

// =============================================================================
// Tests
// =============================================================================
