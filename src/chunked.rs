// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Time-sliced copies into the staging buffer.

A 64MB image copied in one go stalls the frame.  [ChunkedUploader::copy] writes at most
`chunk_bytes` per iteration and, once the time since the last yield exceeds the budget, gives up
one scheduling quantum before continuing.  The number of writes depends only on the source length
and chunk size; the budget only decides where the yields fall.
*/

use crate::config::{BYTES_PER_ELEMENT, UploadConfig};
use crate::context::{MainContext, smuggle, yield_quantum};
use crate::error::UploadError;
use crate::imp::Backend;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[cfg(not(target_arch = "wasm32"))]
use std::time::Instant;
#[cfg(target_arch = "wasm32")]
use web_time::Instant;

/// What one copy did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyReport {
    /// Number of chunk writes issued.
    pub writes: usize,
    /// Total bytes written.
    pub bytes: usize,
    /// Number of times the copy yielded because the budget ran out.
    pub yields: usize,
}

/// Copies byte arrays into a staging buffer in bounded chunks.
pub struct ChunkedUploader<B: Backend> {
    backend: Arc<B>,
    context: Arc<dyn MainContext>,
    time_budget: Duration,
    chunk_bytes: usize,
    yield_sleep: Duration,
}

impl<B: Backend> ChunkedUploader<B> {
    pub fn new(backend: Arc<B>, context: Arc<dyn MainContext>, config: &UploadConfig) -> Self {
        Self::with_budget(
            backend,
            context,
            config.time_budget,
            config.chunk_bytes,
            config.yield_sleep,
        )
    }

    /// # Panics
    /// If `chunk_bytes` is not a positive multiple of 4.
    pub fn with_budget(
        backend: Arc<B>,
        context: Arc<dyn MainContext>,
        time_budget: Duration,
        chunk_bytes: usize,
        yield_sleep: Duration,
    ) -> Self {
        assert!(
            chunk_bytes > 0 && chunk_bytes % BYTES_PER_ELEMENT == 0,
            "chunk_bytes ({chunk_bytes}) must be a positive multiple of {BYTES_PER_ELEMENT}"
        );
        ChunkedUploader {
            backend,
            context,
            time_budget,
            chunk_bytes,
            yield_sleep,
        }
    }

    /**
    Writes all of `source` to the start of `buffer`.

    The token is checked before every chunk.  On cancellation the buffer holds a prefix of the
    source; nothing else is affected.
    */
    pub async fn copy(
        &self,
        buffer: &B::Buffer,
        source: Arc<[u8]>,
        token: &CancellationToken,
    ) -> Result<CopyReport, UploadError> {
        let total = source.len();
        let mut report = CopyReport::default();
        let interval = logwise::perfwarn_begin!("chunked copy");
        let mut since_yield = Instant::now();
        while report.bytes < total {
            if token.is_cancelled() {
                logwise::trace_sync!(
                    "copy cancelled after {written} of {total} bytes",
                    written = report.bytes,
                    total = total
                );
                return Err(UploadError::Cancelled);
            }
            let offset = report.bytes;
            let len = (total - offset).min(self.chunk_bytes);
            let backend = self.backend.clone();
            let buffer = buffer.clone();
            let source = source.clone();
            smuggle(&*self.context, "write chunk", move || {
                backend.write_buffer(&buffer, offset, &source[offset..offset + len])
            })
            .await;
            report.writes += 1;
            report.bytes += len;

            if report.bytes < total && since_yield.elapsed() >= self.time_budget {
                yield_quantum(self.yield_sleep).await;
                report.yields += 1;
                since_yield = Instant::now();
            }
        }
        drop(interval);
        logwise::trace_sync!(
            "copied {bytes} bytes in {writes} writes, {yields} yields",
            bytes = report.bytes,
            writes = report.writes,
            yields = report.yields
        );
        Ok(report)
    }
}

impl<B: Backend> std::fmt::Debug for ChunkedUploader<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedUploader")
            .field("time_budget", &self.time_budget)
            .field("chunk_bytes", &self.chunk_bytes)
            .field("yield_sleep", &self.yield_sleep)
            .finish_non_exhaustive()
    }
}
