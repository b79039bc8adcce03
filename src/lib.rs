// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! texture_streaming moves decoded images into GPU textures without stalling the frame.

Large images are a problem for real-time output.  A 4096×4096 RGBA image is 64MB, and copying it to
the GPU in one go blows any reasonable frame budget.  This crate is the runtime half of an
image-loading pipeline: a decoder (yours, or the bundled [decode::PngDecoder]) produces raw RGBA
bytes, and this crate turns them into a live texture.

# How an upload works

| Step            | Type                            | What happens                                                     |
|-----------------|---------------------------------|------------------------------------------------------------------|
| Acquire         | [gate::AsyncGate]               | Wait (cancellably, FIFO) for exclusive use of the staging buffer |
| Ensure capacity | [staging::StagingBufferManager] | Grow the staging buffer to the next power of two if needed       |
| Copy            | [chunked::ChunkedUploader]      | Write bytes in chunks, yielding whenever the time budget is used |
| Convert         | [dispatch::TextureDispatcher]   | Unpack, gamma-decode and flip into the texture on the GPU        |
| Mips            | [dispatch::TextureDispatcher]   | Regenerate lower levels after the conversion has completed       |

[TextureUploader] ties the steps together and is the type most callers want.

# Contexts

GPU backends usually want their APIs called "in context", often on one particular thread.
Every GPU-affecting call in this crate is shipped to a [context::MainContext] first, so the public
API can be called from any thread.

# Backends

[imp::Backend] is the seam to the GPU.  [imp::SoftwareBackend] emulates everything on the CPU
and is what the tests run against.  With the `backend_wgpu` feature (on by default),
`imp::WgpuBackend` runs the conversion as a WGSL compute shader.

```
use std::sync::Arc;
use texture_streaming::{CancellationToken, TextureUploader, UploadConfig};
use texture_streaming::context::Relaxed;
use texture_streaming::imp::SoftwareBackend;

test_executors::sleep_on(async {
    let backend = Arc::new(SoftwareBackend::new());
    let config = UploadConfig { min_staging_elements: 64, ..UploadConfig::default() };
    let uploader = TextureUploader::new(backend, Arc::new(Relaxed), config);
    let token = CancellationToken::new();

    let texture = uploader.acquire_texture(4, 4, 1, false, &token).await.unwrap();
    let white: Arc<[u8]> = vec![0xFF; 4 * 4 * 4].into();
    uploader.upload_region(&texture, 0, 0, 4, 4, 0, white, &token).await.unwrap();
});
```
*/

pub mod chunked;
pub mod config;
pub mod context;
pub mod decode;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod imp;
pub mod pixel_formats;
pub mod staging;
pub mod texture;
mod uploader;

pub use config::UploadConfig;
pub use error::{AllocationError, DecodeError, UploadError};
pub use texture::{TextureDescriptor, TextureHandle};
pub use tokio_util::sync::CancellationToken;
pub use uploader::{TextureUploader, UploadReport, UploadState};
