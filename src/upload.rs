//! Push-side upload sessions.
//!
//! A session is driven through `Initiated -> Writing -> {Committed | Aborted}`.
//! Both terminal states are final. Sessions are single-owner: every mutating
//! operation takes `&mut self`, so overlapping calls cannot compile.

use std::fmt;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::digest::OciDigest;
use crate::error::{Result, TransferError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initiated,
    Writing,
    Committed,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Committed | SessionState::Aborted)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Initiated => "initiated",
            SessionState::Writing => "writing",
            SessionState::Committed => "committed",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Progress report for an in-flight upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStatus {
    pub reference: String,
    pub location: String,
    pub offset: u64,
    pub started_at: DateTime<Utc>,
}

/// The chunked content-writer contract every destination implements.
#[async_trait]
pub trait UploadSession: Send {
    /// Appends `data`, returning the number of bytes accepted.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Rewinds the upload to `offset`, discarding everything after it.
    async fn truncate(&mut self, offset: u64) -> Result<()>;

    /// Finalizes the upload. The destination verifies `expected`.
    async fn commit(&mut self, size: u64, expected: &OciDigest) -> Result<()>;

    /// Abandons the upload and releases whatever the destination holds for it.
    async fn abort(&mut self) -> Result<()>;

    fn status(&self) -> Result<UploadStatus>;

    /// Digest of the bytes written so far.
    fn digest(&self) -> OciDigest;

    fn state(&self) -> SessionState;
}

/// Running sha256 over an upload's byte range.
#[derive(Clone, Default)]
pub struct DigestAccumulator {
    hasher: Sha256,
    offset: u64,
}

impl DigestAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.offset += data.len() as u64;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn digest(&self) -> OciDigest {
        OciDigest::from_hasher(self.hasher.clone())
    }

    /// Resets the accumulator so it covers exactly `retained`.
    ///
    /// sha256 state cannot be rewound, so the retained prefix is rehashed.
    pub fn rewind(&mut self, retained: &[u8]) {
        self.hasher = Sha256::new();
        self.offset = 0;
        self.update(retained);
    }
}

impl fmt::Debug for DigestAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestAccumulator")
            .field("offset", &self.offset)
            .field("digest", &self.digest().to_string())
            .finish()
    }
}

/// In-memory bookkeeping shared by the session implementations: lifecycle
/// state, the retained bytes and their digest.
#[derive(Debug)]
pub(crate) struct UploadBuffer {
    state: SessionState,
    data: BytesMut,
    accumulator: DigestAccumulator,
}

impl UploadBuffer {
    pub(crate) fn new() -> Self {
        Self {
            state: SessionState::Initiated,
            data: BytesMut::new(),
            accumulator: DigestAccumulator::new(),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn offset(&self) -> u64 {
        self.accumulator.offset()
    }

    pub(crate) fn digest(&self) -> OciDigest {
        self.accumulator.digest()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn ensure_open(&self, operation: &'static str) -> Result<()> {
        if self.state.is_terminal() {
            return Err(TransferError::InvalidSessionState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open("write to")?;
        self.data.extend_from_slice(data);
        self.accumulator.update(data);
        self.state = SessionState::Writing;
        Ok(data.len())
    }

    pub(crate) fn truncate(&mut self, offset: u64) -> Result<()> {
        self.ensure_open("truncate")?;
        let written = self.offset();
        if offset > written {
            return Err(TransferError::InvalidOffset { offset, written });
        }
        self.data.truncate(offset as usize);
        self.accumulator.rewind(&self.data);
        Ok(())
    }

    /// Checks `size` and `expected` against what was written.
    ///
    /// On mismatch the session is aborted; on success the retained bytes are
    /// handed back for the destination to persist, and the caller must follow
    /// up with [`UploadBuffer::mark_committed`] or [`UploadBuffer::mark_aborted`].
    pub(crate) fn verify(&mut self, size: u64, expected: &OciDigest) -> Result<Bytes> {
        self.ensure_open("commit")?;
        let actual_size = self.offset();
        if actual_size != size {
            self.mark_aborted();
            return Err(TransferError::SizeMismatch {
                expected: size,
                actual: actual_size,
            });
        }
        let actual = self.digest();
        if &actual != expected {
            self.mark_aborted();
            return Err(TransferError::DigestMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        Ok(self.data.clone().freeze())
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = SessionState::Committed;
        self.data = BytesMut::new();
    }

    pub(crate) fn mark_aborted(&mut self) {
        self.state = SessionState::Aborted;
        self.data = BytesMut::new();
    }
}
