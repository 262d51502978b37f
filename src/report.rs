//! Reporting schema for `get_current_streams`.
//!
//! These records are the external contract. They are built from the internal
//! snapshot types by the one-way `From` impls below and never the other way
//! round, so internal types can change without touching the schema.

use crate::streaming::types::{
    Direction, ProgressInfo, SessionInfo, SessionState, StreamState, StreamSummary,
};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectionRecord {
    Send,
    Receive,
}

impl From<Direction> for DirectionRecord {
    fn from(d: Direction) -> Self {
        match d {
            Direction::Send => DirectionRecord::Send,
            Direction::Receive => DirectionRecord::Receive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStateRecord {
    Preparing,
    Streaming,
    Completed,
    Failed,
    Aborted,
}

impl From<SessionState> for SessionStateRecord {
    fn from(s: SessionState) -> Self {
        match s {
            SessionState::Preparing => SessionStateRecord::Preparing,
            SessionState::Streaming => SessionStateRecord::Streaming,
            SessionState::Completed => SessionStateRecord::Completed,
            SessionState::Failed => SessionStateRecord::Failed,
            SessionState::Aborted => SessionStateRecord::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSummaryRecord {
    pub cf_id: String,
    pub files: u32,
    pub total_size: u64,
}

impl From<&StreamSummary> for StreamSummaryRecord {
    fn from(s: &StreamSummary) -> Self {
        Self {
            cf_id: s.table_id.to_string(),
            files: s.files,
            total_size: s.total_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressInfoRecord {
    pub peer: String,
    pub session_index: u32,
    pub file_name: String,
    pub direction: DirectionRecord,
    pub current_bytes: u64,
    pub total_bytes: u64,
}

impl From<&ProgressInfo> for ProgressInfoRecord {
    fn from(p: &ProgressInfo) -> Self {
        Self {
            peer: p.peer().to_string(),
            session_index: p.session_index(),
            file_name: p.file_name().to_string(),
            direction: p.direction().into(),
            current_bytes: p.current_bytes(),
            total_bytes: p.total_bytes(),
        }
    }
}

/// One entry of a file-name keyed map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressInfoMapper {
    pub key: String,
    pub value: ProgressInfoRecord,
}

fn files(map: &BTreeMap<String, ProgressInfo>) -> Vec<ProgressInfoMapper> {
    map.iter()
        .map(|(key, value)| ProgressInfoMapper {
            key: key.clone(),
            value: value.into(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamInfoRecord {
    pub peer: String,
    pub session_index: u32,
    pub connecting: String,
    pub state: SessionStateRecord,
    pub receiving_summaries: Vec<StreamSummaryRecord>,
    pub sending_summaries: Vec<StreamSummaryRecord>,
    pub receiving_files: Vec<ProgressInfoMapper>,
    pub sending_files: Vec<ProgressInfoMapper>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl From<&SessionInfo> for StreamInfoRecord {
    fn from(s: &SessionInfo) -> Self {
        Self {
            peer: s.peer.to_string(),
            session_index: s.session_index,
            connecting: s.connecting.to_string(),
            state: s.state.into(),
            receiving_summaries: s.receiving_summaries.iter().map(Into::into).collect(),
            sending_summaries: s.sending_summaries.iter().map(Into::into).collect(),
            receiving_files: files(&s.receiving_files),
            sending_files: files(&s.sending_files),
            failure: s.failure.as_ref().map(|f| f.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStateRecord {
    pub plan_id: String,
    pub description: String,
    pub sessions: Vec<StreamInfoRecord>,
}

impl From<&StreamState> for StreamStateRecord {
    fn from(state: &StreamState) -> Self {
        Self {
            plan_id: state.plan_id.to_string(),
            description: state.description.clone(),
            sessions: state.sessions.iter().map(Into::into).collect(),
        }
    }
}

pub fn to_records(states: &[StreamState]) -> Vec<StreamStateRecord> {
    states.iter().map(Into::into).collect()
}

pub fn to_json(states: &[StreamState]) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&to_records(states))
}
