// src/install/protocol.rs

//! Parent/worker wire protocol
//!
//! Each worker is spawned with three pipes in place of its standard streams:
//!
//! - stdin: control bytes from the parent, [`ECHO_ON`] or [`ECHO_OFF`]
//! - stdout: state events, one JSON object per line
//! - stderr: build output, written only while echo is on
//!
//! State events are `{"state": "<phase>"}` when a phase starts and
//! `{"progress": n, "total": m}` as phases complete. The terminal states
//! are `finished` and `failed`.

use crate::error::Result;
use serde::{Deserialize, Serialize};

pub const ECHO_ON: u8 = b'1';
pub const ECHO_OFF: u8 = b'0';

pub const STATE_FINISHED: &str = "finished";
pub const STATE_FAILED: &str = "failed";
/// Phase name of an install from the buildcache
pub const STATE_FETCHING: &str = "fetch-from-cache";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateEvent {
    State { state: String },
    Progress { progress: u64, total: u64 },
}

impl StateEvent {
    pub fn state(name: &str) -> Self {
        Self::State {
            state: name.to_string(),
        }
    }

    pub fn progress(progress: u64, total: u64) -> Self {
        Self::Progress { progress, total }
    }

    /// Encode as one newline-terminated line
    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::State { state } if state == STATE_FINISHED || state == STATE_FAILED)
    }
}

/// Splits a byte stream that arrives in arbitrary chunks into lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `bytes`; returns every line completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
            if !text.trim().is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Whatever is left without a trailing newline
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        (!text.trim().is_empty()).then_some(text)
    }
}
