use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::utils::id::BlockId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockState {
    Waiting,
    Transferring,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("block {block} cannot move from {from:?} to {to:?}")]
pub struct BlockTransitionError {
    pub block: BlockId,
    pub from: BlockState,
    pub to: BlockState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub checksum: Option<String>,
}

/// A group of files moved as one transfer unit.
///
/// State only moves `waiting -> transferring -> finished`, or back from
/// `transferring` to `waiting` when a transfer fails or a checksum mismatches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    /// Source directory the file paths are relative to.
    pub root: String,
    pub files: Vec<FileEntry>,
    pub size: u64,
    pub tx_bytes: u64,
    state: BlockState,
    /// Start of the current transfer attempt (unix seconds).
    pub start: Option<i64>,
    pub end: Option<i64>,
    /// Realized average rate of the last completed attempt, bytes/s.
    pub avg_rate: f64,
    /// Checksum-mismatch retries already spent on this block.
    pub checksum_retry: u32,
}

impl Block {
    pub fn new(root: impl Into<String>, files: Vec<FileEntry>) -> Self {
        let size = files.iter().map(|f| f.size).sum();
        Block {
            id: BlockId::generate(),
            root: root.into(),
            files,
            size,
            tx_bytes: 0,
            state: BlockState::Waiting,
            start: None,
            end: None,
            avg_rate: 0.0,
            checksum_retry: 0,
        }
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn has_checksums(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(|f| f.checksum.is_some())
    }

    pub fn start_transfer(&mut self) -> Result<(), BlockTransitionError> {
        self.transition(BlockState::Waiting, BlockState::Transferring)
    }

    pub fn finish(&mut self, now: i64) -> Result<(), BlockTransitionError> {
        self.transition(BlockState::Transferring, BlockState::Finished)?;
        self.end = Some(now);
        Ok(())
    }

    /// Returns the block to `waiting` so a later attempt can pick it up.
    pub fn reset_to_waiting(&mut self) -> Result<(), BlockTransitionError> {
        self.transition(BlockState::Transferring, BlockState::Waiting)?;
        self.start = None;
        Ok(())
    }

    /// Credits transferred bytes, capped at the block size. Returns the amount actually credited.
    pub fn credit(&mut self, bytes: u64) -> u64 {
        let credited = bytes.min(self.size - self.tx_bytes);
        self.tx_bytes += credited;
        credited
    }

    /// Credits whatever is still outstanding so `tx_bytes == size`.
    pub fn credit_remaining(&mut self) -> u64 {
        self.credit(self.size - self.tx_bytes)
    }

    /// Takes back bytes credited earlier (checksum mismatch).
    pub fn retrogress(&mut self, bytes: u64) {
        self.tx_bytes = self.tx_bytes.saturating_sub(bytes);
    }

    fn transition(&mut self, from: BlockState, to: BlockState) -> Result<(), BlockTransitionError> {
        if self.state != from {
            return Err(BlockTransitionError { block: self.id.clone(), from: self.state, to });
        }
        self.state = to;
        Ok(())
    }
}
