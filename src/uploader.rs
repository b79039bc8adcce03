// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The public upload pipeline.

[TextureUploader] is a resource pool: one staging buffer behind an [AsyncGate], one conversion
kernel, and a pool of reusable temporary textures.  Construct one per device and share it by
reference; it is `Send + Sync` and every operation may run concurrently from any thread.
*/

use crate::chunked::{ChunkedUploader, CopyReport};
use crate::config::{BYTES_PER_ELEMENT, UploadConfig};
use crate::context::{MainContext, smuggle};
use crate::decode::Decoder;
use crate::dispatch::{ConversionParams, TextureDispatcher};
use crate::error::{AllocationError, UploadError};
use crate::gate::AsyncGate;
use crate::imp::Backend;
use crate::staging::StagingBufferManager;
use crate::texture::{TextureDescriptor, TextureHandle};
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Where an upload is.  Transitions are traced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    Idle,
    Decoding,
    AwaitingBuffer,
    Copying,
    Dispatching,
    GeneratingMips,
    Done,
    Cancelled,
    /// Stopped on a decode or allocation error.
    ///
    /// Precondition violations (a region outside the texture, a missing mip level) panic before
    /// the pipeline starts and never reach this state.
    Failed,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UploadState::Done | UploadState::Cancelled | UploadState::Failed
        )
    }

    /// Whether the pipeline may move from `self` to `next`.
    pub fn can_advance_to(self, next: UploadState) -> bool {
        use UploadState::*;
        match (self, next) {
            (from, Cancelled | Failed) => !from.is_terminal(),
            (Idle, Decoding | AwaitingBuffer) => true,
            (Decoding, AwaitingBuffer) => true,
            (AwaitingBuffer, Copying) => true,
            (Copying, Dispatching) => true,
            (Dispatching, GeneratingMips) => true,
            (GeneratingMips, Done) => true,
            _ => false,
        }
    }
}

//traces one pipeline run
struct Progress {
    id: u64,
    state: UploadState,
}

impl Progress {
    fn enter(&mut self, next: UploadState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid upload transition {:?} -> {:?}",
            self.state,
            next
        );
        logwise::trace_sync!(
            "upload {id}: {from} -> {to}",
            id = self.id,
            from = logwise::privacy::LogIt(&self.state),
            to = logwise::privacy::LogIt(&next)
        );
        self.state = next;
    }

    fn finish<T>(&mut self, result: Result<T, UploadError>) -> Result<T, UploadError> {
        match &result {
            Ok(_) => {}
            Err(e) if e.is_cancelled() => self.enter(UploadState::Cancelled),
            Err(e) => {
                logwise::warn_sync!(
                    "upload {id} failed: {err}",
                    id = self.id,
                    err = logwise::privacy::LogIt(e)
                );
                self.enter(UploadState::Failed)
            }
        }
        result
    }
}

/// What [TextureUploader::upload_region] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReport {
    pub copy: CopyReport,
    /// Whether the staging buffer had to grow for this upload.
    pub reallocated: bool,
}

/// Streams pixel data into textures.  See the [crate documentation](crate).
pub struct TextureUploader<B: Backend> {
    backend: Arc<B>,
    context: Arc<dyn MainContext>,
    config: UploadConfig,
    staging: AsyncGate<StagingBufferManager<B>>,
    copier: ChunkedUploader<B>,
    dispatcher: TextureDispatcher<B>,
    pool: Mutex<Vec<TextureHandle<B>>>,
    next_upload: AtomicU64,
}

impl<B: Backend> TextureUploader<B> {
    /// # Panics
    /// If the backend cannot run the conversion kernel, or `config` fails validation.
    pub fn new(backend: Arc<B>, context: Arc<dyn MainContext>, config: UploadConfig) -> Self {
        assert!(
            backend.supports_conversion(),
            "backend does not support the compute conversion kernel"
        );
        config.validate();
        let staging = StagingBufferManager::new(
            backend.clone(),
            context.clone(),
            config.min_staging_elements,
            config.debug_name.clone(),
        );
        let copier = ChunkedUploader::new(backend.clone(), context.clone(), &config);
        let dispatcher = TextureDispatcher::new(backend.clone(), context.clone(), config.yield_sleep);
        logwise::info_sync!(
            "texture uploader {name} ready",
            name = logwise::privacy::LogIt(&config.debug_name)
        );
        TextureUploader {
            backend,
            context,
            config,
            staging: AsyncGate::new(staging),
            copier,
            dispatcher,
            pool: Mutex::new(Vec::new()),
            next_upload: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Number of temporary textures waiting for reuse.
    pub fn pooled_textures(&self) -> usize {
        self.lock_pool().len()
    }

    fn lock_pool(&self) -> MutexGuard<'_, Vec<TextureHandle<B>>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn progress(&self) -> Progress {
        Progress {
            id: self.next_upload.fetch_add(1, Ordering::Relaxed),
            state: UploadState::Idle,
        }
    }

    /**
    Creates a `width`×`height` texture with `mip_count` levels.

    With `temporary`, a pooled texture of the same shape is reused when one is available.

    # Panics
    If the size is zero or `mip_count` is outside `1..=full chain length`.
    */
    pub async fn acquire_texture(
        &self,
        width: u32,
        height: u32,
        mip_count: u32,
        temporary: bool,
        token: &CancellationToken,
    ) -> Result<TextureHandle<B>, UploadError> {
        let descriptor = TextureDescriptor {
            width,
            height,
            mip_count,
            temporary,
            debug_name: format!("{} texture", self.config.debug_name),
        };
        descriptor.assert_valid();
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        if temporary {
            let mut pool = self.lock_pool();
            if let Some(pos) = pool.iter().position(|t| {
                (t.width(), t.height(), t.mip_count()) == (width, height, mip_count)
            }) {
                logwise::trace_sync!("reusing pooled {w}x{h} texture", w = width, h = height);
                return Ok(pool.swap_remove(pos));
            }
        }
        let backend = self.backend.clone();
        let create_descriptor = descriptor.clone();
        let inner = smuggle(&*self.context, "create texture", move || {
            backend.create_texture(&create_descriptor)
        })
        .await?;
        logwise::info_sync!(
            "created {w}x{h} texture with {mips} levels",
            w = width,
            h = height,
            mips = mip_count
        );
        Ok(TextureHandle { inner, descriptor })
    }

    /// Returns a temporary texture to the pool, or disposes a permanent one.
    pub async fn release_texture(&self, texture: TextureHandle<B>) {
        if texture.is_temporary() {
            self.lock_pool().push(texture);
        } else {
            let backend = self.backend.clone();
            smuggle(&*self.context, "dispose texture", move || {
                backend.dispose_texture(texture.inner)
            })
            .await;
        }
    }

    /**
    Writes `bytes`, a `width`×`height` RGBA image with rows top to bottom, into `texture` at
    (`x`, `y`) of `mip_level`.

    Waits for the staging buffer, copies in time-sliced chunks, converts on the GPU and, for
    level-0 uploads into textures with mips, regenerates the lower levels once the conversion
    has completed.  The staging buffer is released on every path.

    Uploads to different regions of one texture are not ordered relative to each other; serialize
    them yourself if that matters.

    # Panics
    Before touching the GPU, if the region is empty or leaves the level, `mip_level` does not
    exist, or `bytes` is not exactly `width * height * 4` long.
    */
    #[allow(clippy::too_many_arguments)]
    pub async fn upload_region(
        &self,
        texture: &TextureHandle<B>,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        mip_level: u32,
        bytes: Arc<[u8]>,
        token: &CancellationToken,
    ) -> Result<UploadReport, UploadError> {
        let mut progress = self.progress();
        let result = self
            .upload(&mut progress, texture, x, y, width, height, mip_level, bytes, token)
            .await;
        progress.finish(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload(
        &self,
        progress: &mut Progress,
        texture: &TextureHandle<B>,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        mip_level: u32,
        bytes: Arc<[u8]>,
        token: &CancellationToken,
    ) -> Result<UploadReport, UploadError> {
        assert_region(texture.descriptor(), x, y, width, height, mip_level, bytes.len());
        let params = ConversionParams::for_region(texture.descriptor(), x, y, width, height, mip_level);

        progress.enter(UploadState::AwaitingBuffer);
        let mut staging = self.staging.acquire(token).await?;
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let before = staging.reallocations();
        let buffer = staging
            .ensure(region_elements(width, height)?)
            .await?
            .clone();
        let reallocated = staging.reallocations() != before;

        progress.enter(UploadState::Copying);
        let copy = self.copier.copy(&buffer, bytes, token).await?;

        progress.enter(UploadState::Dispatching);
        self.dispatcher.convert(&buffer, texture, params).await;
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.dispatcher.settle().await;
        //the kernel has consumed the staging buffer
        drop(staging);

        progress.enter(UploadState::GeneratingMips);
        self.dispatcher.regenerate_mips(texture, mip_level).await;
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        progress.enter(UploadState::Done);
        Ok(UploadReport { copy, reallocated })
    }

    /**
    Decodes `bytes` with `decoder` and uploads the result into a fresh texture.

    No texture survives a failure: if the upload does not complete, the texture is disposed.
    */
    pub async fn load_texture<D: Decoder>(
        &self,
        bytes: Arc<[u8]>,
        decoder: &D,
        mip_count: u32,
        token: &CancellationToken,
    ) -> Result<TextureHandle<B>, UploadError> {
        let mut progress = self.progress();
        let result = self.load(&mut progress, bytes, decoder, mip_count, token).await;
        progress.finish(result)
    }

    async fn load<D: Decoder>(
        &self,
        progress: &mut Progress,
        bytes: Arc<[u8]>,
        decoder: &D,
        mip_count: u32,
        token: &CancellationToken,
    ) -> Result<TextureHandle<B>, UploadError> {
        progress.enter(UploadState::Decoding);
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let image = decoder.decode(bytes, token).await?;
        let (width, height) = (image.width(), image.height());
        let texture = self
            .acquire_texture(width, height, mip_count, false, token)
            .await?;
        let uploaded = self
            .upload(
                progress,
                &texture,
                0,
                0,
                width,
                height,
                0,
                image.into_pixels(),
                token,
            )
            .await;
        match uploaded {
            Ok(_) => Ok(texture),
            Err(e) => {
                self.release_texture(texture).await;
                Err(e)
            }
        }
    }

    /**
    Allocates ahead of time so the first `width`×`height` upload pays no setup cost.

    Grows the staging buffer, readies the kernel, and leaves one `width`×`height` temporary
    texture in the pool.
    */
    pub async fn prewarm(&self, width: u32, height: u32) -> Result<(), UploadError> {
        let token = CancellationToken::new();
        {
            let mut staging = self.staging.acquire(&token).await?;
            staging.ensure(region_elements(width, height)?).await?;
        }
        self.dispatcher.prepare().await;
        let texture = self.acquire_texture(width, height, 1, true, &token).await?;
        self.release_texture(texture).await;
        logwise::info_sync!("prewarmed for {w}x{h}", w = width, h = height);
        Ok(())
    }

    /// Releases the staging buffer and every pooled texture.
    ///
    /// Waits for in-flight uploads to leave the staging buffer.  The uploader stays usable and
    /// will allocate again on demand.
    pub async fn dispose(&self) {
        let token = CancellationToken::new();
        if let Ok(mut staging) = self.staging.acquire(&token).await {
            staging.dispose().await;
        }
        let pooled: Vec<_> = std::mem::take(&mut *self.lock_pool());
        for texture in pooled {
            let backend = self.backend.clone();
            smuggle(&*self.context, "dispose pooled texture", move || {
                backend.dispose_texture(texture.inner)
            })
            .await;
        }
        logwise::info_sync!("texture uploader disposed");
    }
}

fn assert_region(
    descriptor: &TextureDescriptor,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    mip_level: u32,
    byte_len: usize,
) {
    assert!(
        mip_level < descriptor.mip_count,
        "mip level {mip_level} does not exist; texture has {} levels",
        descriptor.mip_count
    );
    assert!(width > 0 && height > 0, "empty upload region {width}x{height}");
    let (level_width, level_height) = descriptor.level_size(mip_level);
    assert!(
        x.checked_add(width).is_some_and(|end| end <= level_width),
        "region x {x} + width {width} exceeds texture width {level_width}"
    );
    assert!(
        y.checked_add(height).is_some_and(|end| end <= level_height),
        "region y {y} + height {height} exceeds texture height {level_height}"
    );
    let expected = region_elements(width, height)
        .ok()
        .and_then(|elements| elements.checked_mul(BYTES_PER_ELEMENT));
    assert!(
        expected == Some(byte_len),
        "a {width}x{height} region needs {} bytes, got {byte_len}",
        expected.map_or_else(|| "more than usize::MAX".to_string(), |e| e.to_string())
    );
}

/// Staging elements for a `width`×`height` region, one per pixel.
fn region_elements(width: u32, height: u32) -> Result<usize, AllocationError> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or(AllocationError::TooLarge {
            what: "staging buffer",
            bytes: (width as u64 * height as u64).saturating_mul(BYTES_PER_ELEMENT as u64),
            limit: usize::MAX as u64,
        })
}

impl<B: Backend> Debug for TextureUploader<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureUploader")
            .field("config", &self.config)
            .field("staging", &self.staging)
            .field("pooled_textures", &self.pooled_textures())
            .finish_non_exhaustive()
    }
}
