// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0

/// Why a wgpu device could not be set up or read.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("No such adapter")]
    NoSuchAdapter,
    #[error("{0}")]
    RequestDeviceError(#[from] wgpu::RequestDeviceError),
    #[error("adapter does not support compute shaders")]
    ComputeUnsupported,
    #[error("could not start the wgpu poll thread: {0}")]
    PollThread(String),
    #[error("readback failed: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),
}
