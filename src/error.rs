// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Error types for uploads.
//!
//! Only recoverable conditions live here.  Precondition violations (a region outside the
//! texture, a backend without compute support) are programmer errors and panic instead.

/// The staging buffer or a texture could not be allocated.
///
/// No smaller retry is attempted; the caller decides what to do.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AllocationError {
    #[error("out of GPU memory allocating {bytes} bytes for {what}")]
    OutOfMemory { what: &'static str, bytes: u64 },
    #[error("{what} of {bytes} bytes exceeds the device limit of {limit} bytes")]
    TooLarge {
        what: &'static str,
        bytes: u64,
        limit: u64,
    },
    #[error("backend allocation failure: {0}")]
    Backend(String),
}

/// The decoder could not produce an image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("malformed image: {0}")]
    Malformed(String),
    #[error("unsupported pixel layout: {0}")]
    UnsupportedLayout(String),
    #[error("decode cancelled")]
    Cancelled,
}

/// Why an upload did not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum UploadError {
    /// The cancellation token fired at one of the checkpoints.
    #[error("operation cancelled")]
    Cancelled,
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("allocation failed: {0}")]
    Allocation(#[from] AllocationError),
}

impl UploadError {
    /// True when the upload stopped because its token was cancelled.
    ///
    /// A decoder that notices the token itself reports [DecodeError::Cancelled]; that counts too.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            UploadError::Cancelled | UploadError::Decode(DecodeError::Cancelled)
        )
    }
}

/// Returned by [crate::gate::AsyncGate::acquire] when the token fires before the grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("gate acquisition cancelled")]
pub struct Cancelled;

impl From<Cancelled> for UploadError {
    fn from(_: Cancelled) -> Self {
        UploadError::Cancelled
    }
}
