// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The seam between the upload pipeline and a GPU.

Every method here is called on the designated [crate::context::MainContext], never concurrently
for the same staging buffer.  Handles are cheap clones so they can travel to that context.
*/

use crate::dispatch::ConversionParams;
use crate::error::AllocationError;
use crate::texture::TextureDescriptor;
use std::fmt::Debug;

mod software;
pub use software::{SoftwareBackend, SoftwareBuffer, SoftwareEvent, SoftwareStats, SoftwareTexture};

//wgpu objects are not Send on the web, so the backend is native-only
#[cfg(all(feature = "backend_wgpu", not(target_arch = "wasm32")))]
mod wgpu;
#[cfg(all(feature = "backend_wgpu", not(target_arch = "wasm32")))]
pub use wgpu::{BoundDevice, Error as WgpuError, WgpuBackend, WgpuBuffer, WgpuTexture};

/// Callback run once previously submitted GPU work has finished.
pub type WorkDone = Box<dyn FnOnce() + Send + 'static>;

/// GPU primitives needed to stream textures.
pub trait Backend: Send + Sync + 'static {
    /// A linear buffer of 4-byte elements, readable by the conversion kernel.
    type Buffer: Clone + Debug + Send + Sync + 'static;
    /// An RGBA32Float texture with storage-write capability.
    type Texture: Clone + Debug + Send + Sync + 'static;

    /// Whether the conversion kernel can run at all (compute shaders and storage textures).
    fn supports_conversion(&self) -> bool;

    fn create_buffer(&self, elements: usize, label: &str) -> Result<Self::Buffer, AllocationError>;
    fn dispose_buffer(&self, buffer: Self::Buffer);

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<Self::Texture, AllocationError>;
    fn dispose_texture(&self, texture: Self::Texture);

    /// Writes `bytes` at `byte_offset`.  The offset is a multiple of 4; the length may not be.
    fn write_buffer(&self, buffer: &Self::Buffer, byte_offset: usize, bytes: &[u8]);

    /// Compiles or otherwise readies the conversion kernel.  Idempotent.
    fn prepare_conversion(&self);

    /// Runs the conversion kernel over `workgroups` tiles.
    fn dispatch_conversion(
        &self,
        buffer: &Self::Buffer,
        texture: &Self::Texture,
        params: &ConversionParams,
        workgroups: [u32; 3],
    );

    /// Arranges for `callback` to run when all work submitted so far has completed.
    ///
    /// The callback may run on any thread, including inline.
    fn on_work_done(&self, callback: WorkDone);

    /// Regenerates levels `1..mip_count` from level 0.
    fn generate_mips(&self, texture: &Self::Texture, descriptor: &TextureDescriptor);
}
