// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The wgpu backend.

The conversion kernel and the mip downsampler are WGSL compute shaders with 8×8 workgroups.
Allocation failures are caught with error scopes and reported as [AllocationError]s instead of
being left to the uncaptured-error handler.
*/

mod bound_device;
mod error;
mod kernel;
mod readback;

pub use bound_device::BoundDevice;
pub use error::Error;

use super::{Backend, WorkDone};
use crate::config::BYTES_PER_ELEMENT;
use crate::dispatch::{ConversionParams, workgroups};
use crate::error::AllocationError;
use crate::pixel_formats::TEXTURE_BYTES_PER_PIXEL;
use crate::texture::TextureDescriptor;
use kernel::{Kernels, TEXTURE_FORMAT};
use std::num::NonZeroU64;
use std::sync::{Arc, OnceLock};
use wgpu::util::DeviceExt;

/// A staging buffer on the GPU.
#[derive(Debug, Clone)]
pub struct WgpuBuffer {
    buffer: wgpu::Buffer,
}

impl WgpuBuffer {
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

/// An RGBA32Float texture, with one single-level view per mip level.
#[derive(Debug, Clone)]
pub struct WgpuTexture {
    texture: wgpu::Texture,
    levels: Arc<[wgpu::TextureView]>,
}

impl WgpuTexture {
    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    /// A view of the whole mip chain, for sampling.
    pub fn create_view(&self) -> wgpu::TextureView {
        self.texture.create_view(&Default::default())
    }
}

/// [Backend] on a wgpu device.
#[derive(Debug)]
pub struct WgpuBackend {
    device: BoundDevice,
    kernels: OnceLock<Kernels>,
}

impl WgpuBackend {
    /// Binds a device on the default adapter.
    pub async fn new() -> Result<Self, Error> {
        Ok(Self::with_device(BoundDevice::pick().await?))
    }

    pub fn with_device(device: BoundDevice) -> Self {
        WgpuBackend {
            device,
            kernels: OnceLock::new(),
        }
    }

    pub fn bound_device(&self) -> &BoundDevice {
        &self.device
    }

    fn kernels(&self) -> &Kernels {
        self.kernels.get_or_init(|| Kernels::new(self.device.device()))
    }

    /// Runs `create` inside out-of-memory and validation error scopes.
    fn scoped<T>(
        &self,
        what: &'static str,
        bytes: u64,
        create: impl FnOnce(&wgpu::Device) -> T,
    ) -> Result<T, AllocationError> {
        let device = self.device.device();
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = create(device);
        let validation = pollster::block_on(device.pop_error_scope());
        let oom = pollster::block_on(device.pop_error_scope());
        if oom.is_some() {
            logwise::error_sync!(
                "out of memory allocating {bytes} bytes for {what}",
                bytes = bytes,
                what = logwise::privacy::LogIt(what)
            );
            return Err(AllocationError::OutOfMemory { what, bytes });
        }
        if let Some(e) = validation {
            logwise::error_sync!(
                "allocation of {what} rejected: {err}",
                what = logwise::privacy::LogIt(what),
                err = logwise::privacy::LogIt(&e)
            );
            return Err(AllocationError::Backend(e.to_string()));
        }
        Ok(value)
    }
}

impl Backend for WgpuBackend {
    type Buffer = WgpuBuffer;
    type Texture = WgpuTexture;

    fn supports_conversion(&self) -> bool {
        self.device
            .adapter()
            .get_downlevel_capabilities()
            .flags
            .contains(wgpu::DownlevelFlags::COMPUTE_SHADERS)
    }

    fn create_buffer(&self, elements: usize, label: &str) -> Result<WgpuBuffer, AllocationError> {
        let limits = self.device.device().limits();
        //the kernel binds the buffer as one storage binding
        let limit = limits
            .max_buffer_size
            .min(limits.max_storage_buffer_binding_size as u64);
        let bytes = (elements as u64)
            .checked_mul(BYTES_PER_ELEMENT as u64)
            .unwrap_or(u64::MAX);
        if bytes > limit {
            return Err(AllocationError::TooLarge {
                what: "staging buffer",
                bytes,
                limit,
            });
        }
        let buffer = self.scoped("staging buffer", bytes, |device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: bytes,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        Ok(WgpuBuffer { buffer })
    }

    fn dispose_buffer(&self, buffer: WgpuBuffer) {
        buffer.buffer.destroy();
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<WgpuTexture, AllocationError> {
        let max = self.device.device().limits().max_texture_dimension_2d;
        let bytes = (descriptor.width as u64 * descriptor.height as u64)
            .saturating_mul(TEXTURE_BYTES_PER_PIXEL as u64);
        if descriptor.width > max || descriptor.height > max {
            return Err(AllocationError::TooLarge {
                what: "texture",
                bytes,
                limit: max as u64 * max as u64 * TEXTURE_BYTES_PER_PIXEL as u64,
            });
        }
        let texture = self.scoped("texture", bytes, |device| {
            device.create_texture(&wgpu::TextureDescriptor {
                label: Some(descriptor.debug_name.as_str()),
                size: wgpu::Extent3d {
                    width: descriptor.width,
                    height: descriptor.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: descriptor.mip_count,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: TEXTURE_FORMAT,
                usage: wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            })
        })?;
        let levels: Arc<[wgpu::TextureView]> = (0..descriptor.mip_count)
            .map(|level| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(descriptor.debug_name.as_str()),
                    base_mip_level: level,
                    mip_level_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();
        Ok(WgpuTexture { texture, levels })
    }

    fn dispose_texture(&self, texture: WgpuTexture) {
        texture.texture.destroy();
    }

    fn write_buffer(&self, buffer: &WgpuBuffer, byte_offset: usize, bytes: &[u8]) {
        let queue = self.device.queue();
        if bytes.len() % wgpu::COPY_BUFFER_ALIGNMENT as usize == 0 {
            queue.write_buffer(&buffer.buffer, byte_offset as u64, bytes);
        } else {
            //only the final chunk of a copy can be ragged
            let mut padded = bytes.to_vec();
            padded.resize(bytes.len().next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT as usize), 0);
            queue.write_buffer(&buffer.buffer, byte_offset as u64, &padded);
        }
    }

    fn prepare_conversion(&self) {
        self.kernels();
    }

    fn dispatch_conversion(
        &self,
        buffer: &WgpuBuffer,
        texture: &WgpuTexture,
        params: &ConversionParams,
        workgroups: [u32; 3],
    ) {
        let kernels = self.kernels();
        let device = self.device.device();
        let uniforms = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("conversion params"),
            contents: &params.to_uniform_bytes(),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let region_bytes = params.width as u64 * params.height as u64 * BYTES_PER_ELEMENT as u64;
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("conversion"),
            layout: &kernels.convert_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &buffer.buffer,
                        offset: 0,
                        size: NonZeroU64::new(region_bytes),
                    }),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(
                        &texture.levels[params.mip_level as usize],
                    ),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: uniforms.as_entire_binding(),
                },
            ],
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("conversion"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("conversion"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernels.convert);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups[0], workgroups[1], workgroups[2]);
        }
        self.device.queue().submit(std::iter::once(encoder.finish()));
        self.device.set_needs_poll();
    }

    fn on_work_done(&self, callback: WorkDone) {
        self.device
            .queue()
            .on_submitted_work_done(move || callback());
        self.device.set_needs_poll();
    }

    fn generate_mips(&self, texture: &WgpuTexture, descriptor: &TextureDescriptor) {
        let kernels = self.kernels();
        let device = self.device.device();
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("mips"),
        });
        for level in 1..descriptor.mip_count {
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("downsample"),
                layout: &kernels.downsample_layout,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: wgpu::BindingResource::TextureView(
                            &texture.levels[(level - 1) as usize],
                        ),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: wgpu::BindingResource::TextureView(
                            &texture.levels[level as usize],
                        ),
                    },
                ],
            });
            let (w, h) = descriptor.level_size(level);
            let [x, y, z] = workgroups(w, h);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("downsample"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&kernels.downsample);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, z);
        }
        self.device.queue().submit(std::iter::once(encoder.finish()));
        self.device.set_needs_poll();
    }
}
