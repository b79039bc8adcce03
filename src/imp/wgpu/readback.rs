// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::{Error, WgpuBackend, WgpuTexture};
use crate::pixel_formats::{Float4, TEXTURE_BYTES_PER_PIXEL};

impl WgpuBackend {
    /**
    Copies one mip level back to the CPU, row-major in texture order.

    Waits for everything submitted before it.  Intended for tests and diagnostics.
    */
    pub async fn read_level(&self, texture: &WgpuTexture, mip_level: u32) -> Result<Vec<Float4>, Error> {
        let width = (texture.texture.width() >> mip_level).max(1);
        let height = (texture.texture.height() >> mip_level).max(1);
        let unpadded_bytes_per_row = width * TEXTURE_BYTES_PER_PIXEL as u32;
        let bytes_per_row = unpadded_bytes_per_row.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
            * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

        let device = self.device.device();
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture readback"),
            size: bytes_per_row as u64 * height as u64,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("texture readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(bytes_per_row),
                    rows_per_image: None,
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.device.queue().submit(std::iter::once(encoder.finish()));

        let (s, r) = r#continue::continuation();
        readback.map_async(wgpu::MapMode::Read, .., move |result| s.send(result));
        //map_async needs a poll to complete
        self.device.set_needs_poll();
        r.await?;

        let mut texels = Vec::with_capacity(width as usize * height as usize);
        {
            let data = readback.slice(..).get_mapped_range();
            for row in data.chunks_exact(bytes_per_row as usize) {
                for texel in row[..unpadded_bytes_per_row as usize].chunks_exact(TEXTURE_BYTES_PER_PIXEL) {
                    let channel = |i: usize| {
                        f32::from_le_bytes([texel[i], texel[i + 1], texel[i + 2], texel[i + 3]])
                    };
                    texels.push(Float4 {
                        r: channel(0),
                        g: channel(4),
                        b: channel(8),
                        a: channel(12),
                    });
                }
            }
        }
        readback.unmap();
        Ok(texels)
    }
}
