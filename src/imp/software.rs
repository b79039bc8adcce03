// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A CPU emulation of the GPU primitives.

Runs the conversion kernel and mip downsampler tile by tile exactly as the shaders do, records
every call, and can be told to fail allocations.  Useful for tests and for hosts without a GPU.
*/

use super::{Backend, WorkDone};
use crate::config::{BYTES_PER_ELEMENT, TILE_SIZE};
use crate::dispatch::{ConversionParams, destination_row};
use crate::error::AllocationError;
use crate::pixel_formats::{Float4, TEXTURE_BYTES_PER_PIXEL, Unorm4};
use crate::texture::TextureDescriptor;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A staging buffer in host memory.
#[derive(Clone)]
pub struct SoftwareBuffer {
    id: usize,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SoftwareBuffer {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn byte_len(&self) -> usize {
        lock(&self.bytes).len()
    }
}

impl Debug for SoftwareBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBuffer")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

struct Levels {
    width: u32,
    height: u32,
    texels: Vec<Vec<Float4>>,
}

/// An RGBA32Float texture in host memory.  Rows are stored in texture order.
#[derive(Clone)]
pub struct SoftwareTexture {
    id: usize,
    levels: Arc<Mutex<Levels>>,
}

impl SoftwareTexture {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Reads one texel.  `y` is a texture row, so row 0 holds the last source row.
    pub fn read_texel(&self, mip_level: u32, x: u32, y: u32) -> Float4 {
        let levels = lock(&self.levels);
        let (w, _) = level_size(levels.width, levels.height, mip_level);
        levels.texels[mip_level as usize][y as usize * w as usize + x as usize]
    }

    /// Copies out a whole level, row-major in texture order.
    pub fn read_level(&self, mip_level: u32) -> Vec<Float4> {
        lock(&self.levels).texels[mip_level as usize].clone()
    }
}

impl Debug for SoftwareTexture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareTexture")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

//host allocation that reports failure instead of aborting
fn filled<T: Clone>(len: usize, value: T, what: &'static str, bytes: u64) -> Result<Vec<T>, AllocationError> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| AllocationError::OutOfMemory { what, bytes })?;
    v.resize(len, value);
    Ok(v)
}

fn level_size(width: u32, height: u32, level: u32) -> (u32, u32) {
    ((width >> level).max(1), (height >> level).max(1))
}

/// Something the backend was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SoftwareEvent {
    CreateBuffer { id: usize, elements: usize },
    DisposeBuffer { id: usize },
    CreateTexture { id: usize },
    DisposeTexture { id: usize },
    Write { buffer: usize, offset: usize, len: usize },
    Dispatch { texture: usize, workgroups: [u32; 3] },
    WorkDone,
    Mips { texture: usize, levels: u32 },
}

/// Counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub buffers_created: usize,
    pub buffers_disposed: usize,
    pub textures_created: usize,
    pub textures_disposed: usize,
    pub writes: usize,
    pub bytes_written: usize,
    pub dispatches: usize,
    pub mip_generations: usize,
    pub kernel_preparations: usize,
}

impl SoftwareStats {
    /// Total calls that touched the emulated GPU.
    pub fn gpu_calls(&self) -> usize {
        self.buffers_created
            + self.buffers_disposed
            + self.textures_created
            + self.textures_disposed
            + self.writes
            + self.dispatches
            + self.mip_generations
            + self.kernel_preparations
    }
}

/// See the [module documentation](self).
pub struct SoftwareBackend {
    next_id: AtomicUsize,
    supports_conversion: bool,
    //allocations above this many bytes fail with OutOfMemory
    allocation_limit: AtomicU64,
    kernel_ready: AtomicBool,
    stats: Mutex<SoftwareStats>,
    events: Mutex<Vec<SoftwareEvent>>,
}

impl SoftwareBackend {
    pub fn new() -> Self {
        SoftwareBackend {
            next_id: AtomicUsize::new(0),
            supports_conversion: true,
            allocation_limit: AtomicU64::new(u64::MAX),
            kernel_ready: AtomicBool::new(false),
            stats: Mutex::new(SoftwareStats::default()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// A backend that reports no compute support, like a device without compute shaders.
    pub fn without_conversion() -> Self {
        SoftwareBackend {
            supports_conversion: false,
            ..Self::new()
        }
    }

    /// Makes every later allocation larger than `bytes` fail.  `None` removes the limit.
    pub fn set_allocation_limit(&self, bytes: Option<u64>) {
        self.allocation_limit
            .store(bytes.unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn stats(&self) -> SoftwareStats {
        *lock(&self.stats)
    }

    pub fn events(&self) -> Vec<SoftwareEvent> {
        lock(&self.events).clone()
    }

    fn record(&self, event: SoftwareEvent, update: impl FnOnce(&mut SoftwareStats)) {
        update(&mut lock(&self.stats));
        lock(&self.events).push(event);
    }

    fn check_allocation(&self, what: &'static str, bytes: u64) -> Result<(), AllocationError> {
        if bytes > self.allocation_limit.load(Ordering::Relaxed) {
            logwise::error_sync!(
                "software allocation of {bytes} bytes refused",
                bytes = bytes
            );
            Err(AllocationError::OutOfMemory { what, bytes })
        } else {
            Ok(())
        }
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SoftwareBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SoftwareBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("supports_conversion", &self.supports_conversion)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Backend for SoftwareBackend {
    type Buffer = SoftwareBuffer;
    type Texture = SoftwareTexture;

    fn supports_conversion(&self) -> bool {
        self.supports_conversion
    }

    fn create_buffer(&self, elements: usize, _label: &str) -> Result<SoftwareBuffer, AllocationError> {
        let bytes = elements
            .checked_mul(BYTES_PER_ELEMENT)
            .ok_or(AllocationError::TooLarge {
                what: "staging buffer",
                bytes: u64::MAX,
                limit: usize::MAX as u64,
            })?;
        self.check_allocation("staging buffer", bytes as u64)?;
        let storage = filled(bytes, 0u8, "staging buffer", bytes as u64)?;
        let id = self.next_id();
        self.record(SoftwareEvent::CreateBuffer { id, elements }, |s| {
            s.buffers_created += 1
        });
        Ok(SoftwareBuffer {
            id,
            bytes: Arc::new(Mutex::new(storage)),
        })
    }

    fn dispose_buffer(&self, buffer: SoftwareBuffer) {
        self.record(SoftwareEvent::DisposeBuffer { id: buffer.id }, |s| {
            s.buffers_disposed += 1
        });
    }

    fn create_texture(&self, descriptor: &TextureDescriptor) -> Result<SoftwareTexture, AllocationError> {
        let counts: Vec<u64> = (0..descriptor.mip_count)
            .map(|level| {
                let (w, h) = descriptor.level_size(level);
                w as u64 * h as u64
            })
            .collect();
        let bytes = counts
            .iter()
            .fold(0u64, |total, &count| total.saturating_add(count))
            .saturating_mul(TEXTURE_BYTES_PER_PIXEL as u64);
        self.check_allocation("texture", bytes)?;
        let mut texels = Vec::with_capacity(counts.len());
        for count in counts {
            let len = usize::try_from(count).map_err(|_| AllocationError::TooLarge {
                what: "texture",
                bytes,
                limit: usize::MAX as u64,
            })?;
            texels.push(filled(len, Float4::default(), "texture", bytes)?);
        }
        let id = self.next_id();
        self.record(SoftwareEvent::CreateTexture { id }, |s| s.textures_created += 1);
        Ok(SoftwareTexture {
            id,
            levels: Arc::new(Mutex::new(Levels {
                width: descriptor.width,
                height: descriptor.height,
                texels,
            })),
        })
    }

    fn dispose_texture(&self, texture: SoftwareTexture) {
        self.record(SoftwareEvent::DisposeTexture { id: texture.id }, |s| {
            s.textures_disposed += 1
        });
    }

    fn write_buffer(&self, buffer: &SoftwareBuffer, byte_offset: usize, bytes: &[u8]) {
        debug_assert_eq!(byte_offset % BYTES_PER_ELEMENT, 0);
        lock(&buffer.bytes)[byte_offset..byte_offset + bytes.len()].copy_from_slice(bytes);
        self.record(
            SoftwareEvent::Write {
                buffer: buffer.id,
                offset: byte_offset,
                len: bytes.len(),
            },
            |s| {
                s.writes += 1;
                s.bytes_written += bytes.len();
            },
        );
    }

    fn prepare_conversion(&self) {
        if !self.kernel_ready.swap(true, Ordering::Relaxed) {
            lock(&self.stats).kernel_preparations += 1;
        }
    }

    fn dispatch_conversion(
        &self,
        buffer: &SoftwareBuffer,
        texture: &SoftwareTexture,
        params: &ConversionParams,
        workgroups: [u32; 3],
    ) {
        self.prepare_conversion();
        let source = lock(&buffer.bytes);
        let mut levels = lock(&texture.levels);
        let (level_width, _) = level_size(levels.width, levels.height, params.mip_level);
        let dest = &mut levels.texels[params.mip_level as usize];
        //one invocation per (gx, gy), like the shader
        for gy in 0..workgroups[1] * TILE_SIZE {
            for gx in 0..workgroups[0] * TILE_SIZE {
                if gx >= params.width || gy >= params.height {
                    continue;
                }
                let pixel = Unorm4::from_bytes(&source, gy as usize * params.width as usize + gx as usize);
                let x = params.offset_x + gx;
                let y = destination_row(params.texture_height, gy, params.offset_y);
                dest[y as usize * level_width as usize + x as usize] = Float4::from_gamma_squared(pixel);
            }
        }
        drop(levels);
        drop(source);
        self.record(
            SoftwareEvent::Dispatch {
                texture: texture.id,
                workgroups,
            },
            |s| s.dispatches += 1,
        );
    }

    fn on_work_done(&self, callback: WorkDone) {
        //dispatches complete synchronously
        self.record(SoftwareEvent::WorkDone, |_| {});
        callback();
    }

    fn generate_mips(&self, texture: &SoftwareTexture, descriptor: &TextureDescriptor) {
        let mut levels = lock(&texture.levels);
        for level in 1..descriptor.mip_count {
            let (src_w, src_h) = descriptor.level_size(level - 1);
            let (w, h) = descriptor.level_size(level);
            let mut out = Vec::with_capacity(w as usize * h as usize);
            {
                let src = &levels.texels[(level - 1) as usize];
                for y in 0..h {
                    for x in 0..w {
                        let mut taps = Vec::with_capacity(4);
                        for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                            let sx = (x * 2 + dx).min(src_w - 1);
                            let sy = (y * 2 + dy).min(src_h - 1);
                            taps.push(src[sy as usize * src_w as usize + sx as usize]);
                        }
                        out.push(Float4::avg(&taps));
                    }
                }
            }
            levels.texels[level as usize] = out;
        }
        drop(levels);
        self.record(
            SoftwareEvent::Mips {
                texture: texture.id,
                levels: descriptor.mip_count,
            },
            |s| s.mip_generations += 1,
        );
    }
}
