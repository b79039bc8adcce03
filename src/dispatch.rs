// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Runs the pixel-conversion kernel and, afterwards, mip regeneration.

The kernel reads one packed element per pixel from the staging buffer, unpacks four 8-bit
channels, applies [crate::pixel_formats::decode_gamma_squared] and writes an RGBA32Float texel.
Source rows run top to bottom and texture rows bottom to top, so the kernel flips; see
[destination_row].

Dispatch is asynchronous on real GPUs.  [TextureDispatcher::settle] yields one quantum and then
waits for the GPU to report completion, so mip regeneration always sees the converted level 0.
*/

use crate::config::TILE_SIZE;
use crate::context::{MainContext, smuggle, yield_quantum};
use crate::imp::Backend;
use crate::texture::{TextureDescriptor, TextureHandle};
use std::sync::Arc;
use std::time::Duration;

/// Uniforms for one conversion dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionParams {
    pub offset_x: u32,
    pub offset_y: u32,
    pub width: u32,
    pub height: u32,
    /// Height of the destination level, used for the flip.
    pub texture_height: u32,
    pub mip_level: u32,
}

impl ConversionParams {
    /// Parameters for writing a `width`×`height` region at (`x`, `y`) of `mip_level`.
    pub fn for_region(
        descriptor: &TextureDescriptor,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        mip_level: u32,
    ) -> Self {
        let (_, level_height) = descriptor.level_size(mip_level);
        ConversionParams {
            offset_x: x,
            offset_y: y,
            width,
            height,
            texture_height: level_height,
            mip_level,
        }
    }

    /// Uniform-buffer layout: the first five fields as little-endian u32, padded to 32 bytes.
    pub fn to_uniform_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        let fields = [
            self.offset_x,
            self.offset_y,
            self.width,
            self.height,
            self.texture_height,
        ];
        for (i, f) in fields.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&f.to_le_bytes());
        }
        out
    }
}

/// Tile counts covering a `width`×`height` region, rounding up.
///
/// ```
/// use texture_streaming::dispatch::workgroups;
/// assert_eq!(workgroups(17, 8), [3, 1, 1]);
/// assert_eq!(workgroups(1, 1), [1, 1, 1]);
/// ```
pub fn workgroups(width: u32, height: u32) -> [u32; 3] {
    [width.div_ceil(TILE_SIZE), height.div_ceil(TILE_SIZE), 1]
}

/// Texture row written for source row `row` of a region placed at `offset_y`.
///
/// ```
/// use texture_streaming::dispatch::destination_row;
/// //row 0 of a full 4-row upload lands on row 3
/// assert_eq!(destination_row(4, 0, 0), 3);
/// assert_eq!(destination_row(4, 3, 0), 0);
/// ```
#[inline]
pub fn destination_row(texture_height: u32, row: u32, offset_y: u32) -> u32 {
    texture_height - (row + offset_y) - 1
}

/// Issues conversion and mip work for one backend.
pub struct TextureDispatcher<B: Backend> {
    backend: Arc<B>,
    context: Arc<dyn MainContext>,
    yield_sleep: Duration,
}

impl<B: Backend> TextureDispatcher<B> {
    pub fn new(backend: Arc<B>, context: Arc<dyn MainContext>, yield_sleep: Duration) -> Self {
        TextureDispatcher {
            backend,
            context,
            yield_sleep,
        }
    }

    /// Readies the kernel ahead of the first dispatch.
    pub async fn prepare(&self) {
        let backend = self.backend.clone();
        smuggle(&*self.context, "prepare conversion", move || {
            backend.prepare_conversion()
        })
        .await
    }

    /// Dispatches the kernel over `params`' region, reading from the start of `buffer`.
    ///
    /// Returns once the work is submitted, not once it has run.
    pub async fn convert(
        &self,
        buffer: &B::Buffer,
        texture: &TextureHandle<B>,
        params: ConversionParams,
    ) {
        let descriptor = texture.descriptor();
        if params.mip_level != 0
            && (params.width, params.height) != descriptor.level_size(params.mip_level)
        {
            logwise::warn_sync!(
                "partial upload to mip level {level}: the flip uses the whole level height, which is only correct for full-level uploads",
                level = params.mip_level
            );
        }
        let groups = workgroups(params.width, params.height);
        logwise::trace_sync!(
            "dispatch conversion {groups} for {params}",
            groups = logwise::privacy::LogIt(&groups),
            params = logwise::privacy::LogIt(&params)
        );
        let backend = self.backend.clone();
        let buffer = buffer.clone();
        let texture = texture.inner.clone();
        let interval = logwise::perfwarn_begin!("conversion dispatch");
        smuggle(&*self.context, "dispatch conversion", move || {
            backend.dispatch_conversion(&buffer, &texture, &params, groups)
        })
        .await;
        drop(interval);
    }

    /// One scheduling quantum, then an explicit wait for submitted GPU work to finish.
    pub async fn settle(&self) {
        yield_quantum(self.yield_sleep).await;
        let (s, r) = r#continue::continuation();
        let backend = self.backend.clone();
        smuggle(&*self.context, "on work done", move || {
            backend.on_work_done(Box::new(move || s.send(())))
        })
        .await;
        r.await
    }

    /// Rebuilds the lower levels when the texture has them and level 0 was just written.
    ///
    /// Returns whether anything was regenerated.
    pub async fn regenerate_mips(&self, texture: &TextureHandle<B>, uploaded_level: u32) -> bool {
        if texture.mip_count() <= 1 || uploaded_level != 0 {
            return false;
        }
        let backend = self.backend.clone();
        let inner = texture.inner.clone();
        let descriptor = texture.descriptor().clone();
        smuggle(&*self.context, "generate mips", move || {
            backend.generate_mips(&inner, &descriptor)
        })
        .await;
        true
    }
}

impl<B: Backend> std::fmt::Debug for TextureDispatcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureDispatcher")
            .field("yield_sleep", &self.yield_sleep)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Relaxed;
    use crate::imp::{SoftwareBackend, SoftwareEvent};

    #[test]
    fn workgroups_cover_region() {
        for (w, h) in [(1, 1), (8, 8), (9, 7), (100, 33), (4096, 4096)] {
            let [x, y, z] = workgroups(w, h);
            assert!(x * TILE_SIZE >= w && (x - 1) * TILE_SIZE < w);
            assert!(y * TILE_SIZE >= h && (y - 1) * TILE_SIZE < h);
            assert_eq!(z, 1);
        }
    }

    #[test]
    fn flip_with_offset() {
        //a 2-row region at offset 1 in an 8-row texture lands on rows 6 and 5
        assert_eq!(destination_row(8, 0, 1), 6);
        assert_eq!(destination_row(8, 1, 1), 5);
    }

    #[test]
    fn params_for_mip_level_use_level_height() {
        let d = TextureDescriptor {
            width: 16,
            height: 8,
            mip_count: 3,
            temporary: false,
            debug_name: "p".into(),
        };
        let p = ConversionParams::for_region(&d, 0, 0, 4, 2, 2);
        assert_eq!(p.texture_height, 2);
        let bytes = p.to_uniform_bytes();
        assert_eq!(&bytes[16..20], &2u32.to_le_bytes());
        assert_eq!(&bytes[20..], &[0; 12]);
    }

    #[test]
    fn mips_follow_completed_work() {
        let backend = Arc::new(SoftwareBackend::new());
        let dispatcher = TextureDispatcher::new(backend.clone(), Arc::new(Relaxed), Duration::ZERO);
        let descriptor = TextureDescriptor {
            width: 8,
            height: 8,
            mip_count: 4,
            temporary: false,
            debug_name: "mips".into(),
        };
        let texture = TextureHandle {
            inner: backend.create_texture(&descriptor).unwrap(),
            descriptor,
        };
        let buffer = backend.create_buffer(64, "staging").unwrap();
        test_executors::sleep_on(async {
            let params = ConversionParams::for_region(texture.descriptor(), 0, 0, 8, 8, 0);
            dispatcher.convert(&buffer, &texture, params).await;
            dispatcher.settle().await;
            assert!(dispatcher.regenerate_mips(&texture, 0).await);
            assert!(!dispatcher.regenerate_mips(&texture, 1).await);
        });
        let events = backend.events();
        let dispatched = events
            .iter()
            .position(|e| matches!(e, SoftwareEvent::Dispatch { .. }))
            .unwrap();
        let done = events
            .iter()
            .position(|e| matches!(e, SoftwareEvent::WorkDone))
            .unwrap();
        let mips = events
            .iter()
            .position(|e| matches!(e, SoftwareEvent::Mips { .. }))
            .unwrap();
        assert!(dispatched < done && done < mips);
    }
}
