// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Turning encoded bytes into RGBA.

The uploader consumes [DecodedImage]s: tightly packed RGBA, 8 bits per channel, rows top to
bottom.  Anything that produces one can implement [Decoder].  [PngDecoder] is bundled.
*/

use crate::config::BYTES_PER_ELEMENT;
use crate::error::DecodeError;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A decoded image, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl DecodedImage {
    /// Fails unless the image has pixels and `pixels` holds exactly `width * height` of them.
    pub fn new(width: u32, height: u32, pixels: Arc<[u8]>) -> Result<Self, DecodeError> {
        if width == 0 || height == 0 {
            return Err(DecodeError::Malformed(format!(
                "{width}x{height} image has no pixels"
            )));
        }
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(BYTES_PER_ELEMENT));
        if expected != Some(pixels.len()) {
            return Err(DecodeError::Malformed(format!(
                "{width}x{height} RGBA image has the wrong size, got {} bytes",
                pixels.len()
            )));
        }
        Ok(DecodedImage {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &Arc<[u8]> {
        &self.pixels
    }

    pub fn into_pixels(self) -> Arc<[u8]> {
        self.pixels
    }
}

/// Produces a [DecodedImage] from encoded bytes.
///
/// Implementations should check `token` where it is cheap and return [DecodeError::Cancelled].
pub trait Decoder: Send + Sync {
    fn decode(
        &self,
        bytes: Arc<[u8]>,
        token: &CancellationToken,
    ) -> impl Future<Output = Result<DecodedImage, DecodeError>> + Send;
}

/// Bytes that are already RGBA of a known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRgbaDecoder {
    pub width: u32,
    pub height: u32,
}

impl Decoder for RawRgbaDecoder {
    async fn decode(
        &self,
        bytes: Arc<[u8]>,
        token: &CancellationToken,
    ) -> Result<DecodedImage, DecodeError> {
        if token.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }
        DecodedImage::new(self.width, self.height, bytes)
    }
}

/// Decodes PNG on a worker thread, expanding every layout to 8-bit RGBA.
#[derive(Debug, Clone, Copy, Default)]
pub struct PngDecoder;

//sends an error if the worker never runs
struct Reply(Option<r#continue::Sender<Result<DecodedImage, DecodeError>>>);

impl Reply {
    fn send(mut self, result: Result<DecodedImage, DecodeError>) {
        if let Some(s) = self.0.take() {
            s.send(result);
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(s) = self.0.take() {
            s.send(Err(DecodeError::Malformed("decode worker did not run".into())));
        }
    }
}

impl Decoder for PngDecoder {
    async fn decode(
        &self,
        bytes: Arc<[u8]>,
        token: &CancellationToken,
    ) -> Result<DecodedImage, DecodeError> {
        if token.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }
        let (s, r) = r#continue::continuation();
        let reply = Reply(Some(s));
        let worker_bytes = bytes.clone();
        let spawned = std::thread::Builder::new()
            .name("png decode".to_string())
            .spawn(move || reply.send(decode_png(&worker_bytes)));
        let result = r.await;
        let result = match spawned {
            Ok(_) => result,
            Err(e) => {
                logwise::warn_sync!(
                    "no decode thread ({err}); decoding inline",
                    err = logwise::privacy::LogIt(&e)
                );
                decode_png(&bytes)
            }
        };
        if token.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }
        result
    }
}

fn decode_png(bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
    let mut decoder = png::Decoder::new(std::io::Cursor::new(bytes));
    decoder.set_transformations(png::Transformations::normalize_to_color8());
    let mut reader = decoder
        .read_info()
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let (color_type, bit_depth) = reader.output_color_type();
    if bit_depth != png::BitDepth::Eight {
        return Err(DecodeError::UnsupportedLayout(format!(
            "{bit_depth:?} after normalization"
        )));
    }
    let (width, height) = {
        let info = reader.info();
        (info.width, info.height)
    };
    let samples = color_type.samples();
    let mut buf = vec![0u8; width as usize * height as usize * samples];
    let frame = reader
        .next_frame(&mut buf)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    buf.truncate(frame.buffer_size());

    let rgba: Vec<u8> = match color_type {
        png::ColorType::Rgba => buf,
        png::ColorType::Rgb => buf
            .chunks_exact(3)
            .flat_map(|p| [p[0], p[1], p[2], 255])
            .collect(),
        png::ColorType::GrayscaleAlpha => buf
            .chunks_exact(2)
            .flat_map(|p| [p[0], p[0], p[0], p[1]])
            .collect(),
        png::ColorType::Grayscale => buf.iter().flat_map(|&g| [g, g, g, 255]).collect(),
        other => {
            return Err(DecodeError::UnsupportedLayout(format!("{other:?}")));
        }
    };
    logwise::trace_sync!(
        "decoded png {width}x{height}",
        width = width,
        height = height
    );
    DecodedImage::new(width, height, rgba.into())
}
