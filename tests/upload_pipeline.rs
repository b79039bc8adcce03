// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The upload pipeline end to end, against the software backend.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use texture_streaming::chunked::ChunkedUploader;
use texture_streaming::context::{DedicatedThread, Job, MainContext, Relaxed};
use texture_streaming::decode::{PngDecoder, RawRgbaDecoder};
use texture_streaming::imp::{Backend, SoftwareBackend, SoftwareEvent};
use texture_streaming::pixel_formats::Float4;
use texture_streaming::staging::StagingBufferManager;
use texture_streaming::{
    AllocationError, CancellationToken, DecodeError, TextureUploader, UploadConfig, UploadError,
};

const WHITE: Float4 = Float4 {
    r: 1.0,
    g: 1.0,
    b: 1.0,
    a: 1.0,
};

fn small_config() -> UploadConfig {
    UploadConfig {
        time_budget: Duration::ZERO,
        chunk_bytes: 64,
        min_staging_elements: 16,
        debug_name: "upload_pipeline".to_string(),
        ..UploadConfig::default()
    }
}

fn uploader() -> TextureUploader<SoftwareBackend> {
    TextureUploader::new(Arc::new(SoftwareBackend::new()), Arc::new(Relaxed), small_config())
}

fn white(width: u32, height: u32) -> Arc<[u8]> {
    vec![0xFF; (width * height * 4) as usize].into()
}

/// Runs jobs inline but pretends to be elsewhere, and cancels `token` after `after` jobs.
struct CancelAfter {
    jobs: AtomicUsize,
    after: usize,
    token: CancellationToken,
}

impl MainContext for CancelAfter {
    fn submit(&self, job: Job) {
        job();
        if self.jobs.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
    }

    fn is_current(&self) -> bool {
        false
    }
}

#[test]
fn write_count_depends_only_on_length_and_chunk() {
    let backend = Arc::new(SoftwareBackend::new());
    let token = CancellationToken::new();
    for len in [0usize, 1, 4, 63, 64, 65, 1000, 4099] {
        for chunk in [4usize, 64, 1024] {
            for budget in [Duration::ZERO, Duration::from_secs(60)] {
                let buffer = backend.create_buffer(len.div_ceil(4), "staging").unwrap();
                let copier = ChunkedUploader::with_budget(
                    backend.clone(),
                    Arc::new(Relaxed),
                    budget,
                    chunk,
                    Duration::ZERO,
                );
                let source: Arc<[u8]> = vec![7; len].into();
                let report = test_executors::sleep_on(copier.copy(&buffer, source, &token)).unwrap();
                assert_eq!(report.writes, len.div_ceil(chunk), "len {len} chunk {chunk}");
                assert_eq!(report.bytes, len);
            }
        }
    }
}

#[test]
fn staging_capacity_never_shrinks() {
    let backend = Arc::new(SoftwareBackend::new());
    let mut staging = StagingBufferManager::new(backend, Arc::new(Relaxed), 256, "growth");
    let requests = [3usize, 700, 12, 256, 257, 100_000, 5, 65_536];
    test_executors::sleep_on(async {
        let mut previous = 0;
        for r in requests {
            staging.ensure(r).await.unwrap();
            assert!(staging.capacity() >= previous);
            assert!(staging.capacity() >= r.next_power_of_two().max(256));
            previous = staging.capacity();
        }
    });
    assert_eq!(staging.capacity(), 131_072);
}

#[test]
fn oversized_prewarm_is_an_allocation_error() {
    let uploader = uploader();
    let result = test_executors::sleep_on(uploader.prewarm(u32::MAX, 1 << 31));
    assert!(
        matches!(
            result,
            Err(UploadError::Allocation(AllocationError::TooLarge { .. }))
        ),
        "{result:?}"
    );
    let stats = uploader.backend().stats();
    assert_eq!(stats.buffers_created, 0);
    assert_eq!(stats.textures_created, 0);
    assert_eq!(uploader.pooled_textures(), 0);

    //the gate was released on the way out
    let token = CancellationToken::new();
    let texture = test_executors::sleep_on(uploader.acquire_texture(4, 4, 1, false, &token)).unwrap();
    test_executors::sleep_on(uploader.upload_region(&texture, 0, 0, 4, 4, 0, white(4, 4), &token))
        .unwrap();
}

#[test]
fn out_of_bounds_region_panics_before_any_gpu_call() {
    let uploader = uploader();
    let token = CancellationToken::new();
    let texture =
        test_executors::sleep_on(uploader.acquire_texture(100, 10, 1, false, &token)).unwrap();
    let before = uploader.backend().stats();

    let result = catch_unwind(AssertUnwindSafe(|| {
        test_executors::sleep_on(uploader.upload_region(
            &texture,
            60,
            0,
            50,
            1,
            0,
            white(50, 1),
            &token,
        ))
    }));
    let panic = result.unwrap_err();
    let message = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .unwrap_or_default();
    assert!(message.contains("exceeds texture width"), "{message}");
    assert_eq!(uploader.backend().stats(), before);
    assert_eq!(before.gpu_calls(), 1);

    //the gate was never taken, so the uploader still works
    test_executors::sleep_on(uploader.upload_region(&texture, 50, 0, 50, 1, 0, white(50, 1), &token))
        .unwrap();
}

#[test]
fn white_image_lands_on_the_bottom_row() {
    let uploader = uploader();
    let token = CancellationToken::new();
    let decoder = RawRgbaDecoder {
        width: 4,
        height: 4,
    };
    let texture =
        test_executors::sleep_on(uploader.load_texture(white(4, 4), &decoder, 1, &token)).unwrap();
    assert_eq!((texture.width(), texture.height()), (4, 4));
    assert_eq!(texture.backend_texture().read_texel(0, 0, 3), WHITE);
    assert!(texture.backend_texture().read_level(0).iter().all(|t| *t == WHITE));
}

#[test]
fn png_rows_are_flipped() {
    //2x2: top row red, bottom row blue
    let mut png_bytes = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut png_bytes, 2, 2);
        encoder.set_color(png::ColorType::Rgb);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().unwrap();
        writer
            .write_image_data(&[255, 0, 0, 255, 0, 0, 0, 0, 255, 0, 0, 255])
            .unwrap();
    }
    let uploader = uploader();
    let token = CancellationToken::new();
    let texture = test_executors::sleep_on(uploader.load_texture(
        png_bytes.into(),
        &PngDecoder,
        1,
        &token,
    ))
    .unwrap();
    let red = Float4 {
        r: 1.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };
    let blue = Float4 {
        r: 0.0,
        g: 0.0,
        b: 1.0,
        a: 1.0,
    };
    let t = texture.backend_texture();
    assert_eq!(t.read_texel(0, 0, 1), red);
    assert_eq!(t.read_texel(0, 1, 1), red);
    assert_eq!(t.read_texel(0, 0, 0), blue);
}

#[test]
fn prewarmed_upload_does_not_reallocate() {
    let uploader = uploader();
    let token = CancellationToken::new();
    test_executors::sleep_on(async {
        uploader.prewarm(64, 64).await.unwrap();
        assert_eq!(uploader.pooled_textures(), 1);
        let created = uploader.backend().stats().textures_created;

        let texture = uploader.acquire_texture(64, 64, 1, true, &token).await.unwrap();
        assert_eq!(uploader.backend().stats().textures_created, created);
        assert_eq!(uploader.pooled_textures(), 0);

        let report = uploader
            .upload_region(&texture, 0, 0, 32, 48, 0, white(32, 48), &token)
            .await
            .unwrap();
        assert!(!report.reallocated);
        let report = uploader
            .upload_region(&texture, 0, 0, 64, 64, 0, white(64, 64), &token)
            .await
            .unwrap();
        assert!(!report.reallocated);
        assert_eq!(report.copy.bytes, 64 * 64 * 4);

        uploader.release_texture(texture).await;
        assert_eq!(uploader.pooled_textures(), 1);
    });
    assert_eq!(uploader.backend().stats().buffers_created, 1);
}

#[test]
fn cancellation_mid_copy_releases_the_gate() {
    let token = CancellationToken::new();
    //job 1 creates the texture, job 2 the staging buffer, job 3 writes the first chunk
    let context = Arc::new(CancelAfter {
        jobs: AtomicUsize::new(0),
        after: 3,
        token: token.clone(),
    });
    let uploader = TextureUploader::new(Arc::new(SoftwareBackend::new()), context, small_config());
    let texture =
        test_executors::sleep_on(uploader.acquire_texture(8, 8, 1, false, &token)).unwrap();
    let result = test_executors::sleep_on(uploader.upload_region(
        &texture,
        0,
        0,
        8,
        8,
        0,
        white(8, 8),
        &token,
    ));
    let err = result.unwrap_err();
    assert!(err.is_cancelled(), "{err:?}");
    let stats = uploader.backend().stats();
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.dispatches, 0);

    //the staging buffer is free again
    let report = test_executors::sleep_on(uploader.upload_region(
        &texture,
        0,
        0,
        8,
        8,
        0,
        white(8, 8),
        &CancellationToken::new(),
    ))
    .unwrap();
    assert_eq!(report.copy.writes, 4);
    assert!(!report.reallocated);
    assert_eq!(uploader.backend().stats().dispatches, 1);
}

#[test]
fn cancelled_before_grant() {
    let uploader = uploader();
    let live = CancellationToken::new();
    let texture = test_executors::sleep_on(uploader.acquire_texture(4, 4, 1, false, &live)).unwrap();
    let dead = CancellationToken::new();
    dead.cancel();
    let result =
        test_executors::sleep_on(uploader.upload_region(&texture, 0, 0, 4, 4, 0, white(4, 4), &dead));
    assert_eq!(result, Err(UploadError::Cancelled));
    assert_eq!(uploader.backend().stats().writes, 0);
    test_executors::sleep_on(uploader.upload_region(&texture, 0, 0, 4, 4, 0, white(4, 4), &live))
        .unwrap();
}

#[test]
fn decode_failure_produces_no_texture() {
    let uploader = uploader();
    let result = test_executors::sleep_on(uploader.load_texture(
        vec![0, 1, 2, 3, 4, 5].into(),
        &PngDecoder,
        1,
        &CancellationToken::new(),
    ));
    assert!(matches!(result, Err(UploadError::Decode(DecodeError::Malformed(_)))));
    assert_eq!(uploader.backend().stats().textures_created, 0);
}

#[test]
fn empty_decoded_image_is_a_decode_error() {
    let uploader = uploader();
    let decoder = RawRgbaDecoder {
        width: 0,
        height: 5,
    };
    let result = test_executors::sleep_on(uploader.load_texture(
        Vec::<u8>::new().into(),
        &decoder,
        1,
        &CancellationToken::new(),
    ));
    assert!(matches!(result, Err(UploadError::Decode(DecodeError::Malformed(_)))));
    assert_eq!(uploader.backend().stats().textures_created, 0);
}

#[test]
fn failed_load_disposes_its_texture() {
    let token = CancellationToken::new();
    //texture, staging buffer, first chunk; then the load is cancelled
    let context = Arc::new(CancelAfter {
        jobs: AtomicUsize::new(0),
        after: 3,
        token: token.clone(),
    });
    let uploader = TextureUploader::new(Arc::new(SoftwareBackend::new()), context, small_config());
    let decoder = RawRgbaDecoder {
        width: 8,
        height: 8,
    };
    let result = test_executors::sleep_on(uploader.load_texture(white(8, 8), &decoder, 1, &token));
    assert_eq!(result.unwrap_err(), UploadError::Cancelled);
    let stats = uploader.backend().stats();
    assert_eq!(stats.textures_created, 1);
    assert_eq!(stats.textures_disposed, 1);
}

#[test]
fn allocation_failure_is_distinct_and_releases_the_gate() {
    let uploader = uploader();
    let token = CancellationToken::new();
    let texture = test_executors::sleep_on(uploader.acquire_texture(64, 64, 1, false, &token)).unwrap();
    uploader.backend().set_allocation_limit(Some(1024));
    let result = test_executors::sleep_on(uploader.upload_region(
        &texture,
        0,
        0,
        64,
        64,
        0,
        white(64, 64),
        &token,
    ));
    let err = result.unwrap_err();
    assert!(!err.is_cancelled());
    assert_eq!(
        err,
        UploadError::Allocation(AllocationError::OutOfMemory {
            what: "staging buffer",
            bytes: 64 * 64 * 4
        })
    );
    uploader.backend().set_allocation_limit(None);
    let report = test_executors::sleep_on(uploader.upload_region(
        &texture,
        0,
        0,
        64,
        64,
        0,
        white(64, 64),
        &token,
    ))
    .unwrap();
    assert!(report.reallocated);
}

#[test]
fn concurrent_uploads_never_interleave_staging_writes() {
    const UPLOADS: usize = 5;
    let uploader = uploader();
    let token = CancellationToken::new();
    test_executors::sleep_on(async {
        let mut textures = Vec::new();
        for _ in 0..UPLOADS {
            textures.push(uploader.acquire_texture(8, 8, 1, false, &token).await.unwrap());
        }
        let uploads = textures
            .iter()
            .map(|t| uploader.upload_region(t, 0, 0, 8, 8, 0, white(8, 8), &token));
        for result in futures::future::join_all(uploads).await {
            assert_eq!(result.unwrap().copy.writes, 4);
        }
    });
    //every dispatch is preceded by its own four writes, back to back
    let mut writes_since_dispatch = 0;
    let mut dispatches = 0;
    for event in uploader.backend().events() {
        match event {
            SoftwareEvent::Write { .. } => writes_since_dispatch += 1,
            SoftwareEvent::Dispatch { .. } => {
                assert_eq!(writes_since_dispatch, 4);
                writes_since_dispatch = 0;
                dispatches += 1;
            }
            _ => {}
        }
    }
    assert_eq!(dispatches, UPLOADS);
}

#[test]
fn mips_regenerate_after_level_zero_only() {
    let uploader = uploader();
    let token = CancellationToken::new();
    test_executors::sleep_on(async {
        let texture = uploader.acquire_texture(4, 4, 3, false, &token).await.unwrap();
        uploader
            .upload_region(&texture, 0, 0, 4, 4, 0, white(4, 4), &token)
            .await
            .unwrap();
        assert_eq!(uploader.backend().stats().mip_generations, 1);
        assert_eq!(texture.backend_texture().read_texel(2, 0, 0), WHITE);

        //a direct write to level 1 leaves the chain alone
        uploader
            .upload_region(&texture, 0, 0, 2, 2, 1, vec![0; 16].into(), &token)
            .await
            .unwrap();
        assert_eq!(uploader.backend().stats().mip_generations, 1);
        assert_eq!(texture.backend_texture().read_texel(2, 0, 0), WHITE);
        assert_eq!(texture.backend_texture().read_texel(1, 1, 1), Float4::default());
    });
}

#[test]
fn dedicated_context_round_trip() {
    let context = Arc::new(DedicatedThread::spawn("gpu").unwrap());
    let uploader = TextureUploader::new(Arc::new(SoftwareBackend::new()), context, small_config());
    let token = CancellationToken::new();
    let texture = std::thread::scope(|s| {
        //callers may be on any thread
        s.spawn(|| {
            test_executors::sleep_on(async {
                let texture = uploader.acquire_texture(16, 16, 1, false, &token).await.unwrap();
                uploader
                    .upload_region(&texture, 0, 0, 16, 16, 0, white(16, 16), &token)
                    .await
                    .unwrap();
                texture
            })
        })
        .join()
        .unwrap()
    });
    assert_eq!(texture.backend_texture().read_texel(0, 15, 15), WHITE);
    test_executors::sleep_on(uploader.dispose());
    let stats = uploader.backend().stats();
    assert_eq!(stats.buffers_created, stats.buffers_disposed);
}

#[test]
#[should_panic(expected = "compute")]
fn backend_without_compute_is_rejected() {
    TextureUploader::new(
        Arc::new(SoftwareBackend::without_conversion()),
        Arc::new(Relaxed),
        small_config(),
    );
}
