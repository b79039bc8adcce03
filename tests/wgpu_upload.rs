// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Uploads through the compute kernel on a real adapter.
#![cfg(all(feature = "testing", feature = "backend_wgpu", not(target_arch = "wasm32")))]

use std::sync::Arc;
use std::time::Duration;
use texture_streaming::context::DedicatedThread;
use texture_streaming::decode::RawRgbaDecoder;
use texture_streaming::imp::WgpuBackend;
use texture_streaming::pixel_formats::Float4;
use texture_streaming::{CancellationToken, TextureUploader, UploadConfig};

const WHITE: Float4 = Float4 {
    r: 1.0,
    g: 1.0,
    b: 1.0,
    a: 1.0,
};

fn uploader() -> Option<TextureUploader<WgpuBackend>> {
    let backend = match test_executors::sleep_on(WgpuBackend::new()) {
        Ok(backend) => backend,
        Err(e) => {
            println!("skipping, no usable adapter: {e}");
            return None;
        }
    };
    let context = DedicatedThread::spawn("wgpu_upload").unwrap();
    let config = UploadConfig {
        time_budget: Duration::from_millis(4),
        chunk_bytes: 256,
        min_staging_elements: 64,
        debug_name: "wgpu_upload".to_string(),
        ..UploadConfig::default()
    };
    Some(TextureUploader::new(Arc::new(backend), Arc::new(context), config))
}

#[test]
fn white_image_converts_on_the_gpu() {
    let Some(uploader) = uploader() else {
        return;
    };
    let token = CancellationToken::new();
    let decoder = RawRgbaDecoder {
        width: 4,
        height: 4,
    };
    let white: Arc<[u8]> = vec![0xFF; 4 * 4 * 4].into();
    test_executors::sleep_on(async {
        let texture = uploader.load_texture(white, &decoder, 3, &token).await.unwrap();
        let level = uploader
            .backend()
            .read_level(texture.backend_texture(), 0)
            .await
            .unwrap();
        assert_eq!(level.len(), 16);
        //bottom-left, after the flip
        assert_eq!(level[3 * 4], WHITE);
        assert!(level.iter().all(|t| *t == WHITE));

        let smallest = uploader
            .backend()
            .read_level(texture.backend_texture(), 2)
            .await
            .unwrap();
        assert_eq!(smallest, vec![WHITE]);
    });
    test_executors::sleep_on(uploader.dispose());
}

#[test]
fn rows_land_flipped_on_the_gpu() {
    let Some(uploader) = uploader() else {
        return;
    };
    let token = CancellationToken::new();
    //1x2: top row opaque black, bottom row white
    let pixels: Arc<[u8]> = vec![0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF].into();
    let decoder = RawRgbaDecoder {
        width: 1,
        height: 2,
    };
    test_executors::sleep_on(async {
        let texture = uploader.load_texture(pixels, &decoder, 1, &token).await.unwrap();
        let level = uploader
            .backend()
            .read_level(texture.backend_texture(), 0)
            .await
            .unwrap();
        assert_eq!(level[0], WHITE);
        assert_eq!(
            level[1],
            Float4 {
                r: 0.0,
                g: 0.0,
                b: 0.0,
                a: 1.0
            }
        );
    });
    test_executors::sleep_on(uploader.dispose());
}
