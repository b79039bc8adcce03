// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Destination textures.

use crate::imp::Backend;
use std::fmt::{Debug, Formatter};

/// Shape of a texture the uploader can target.
///
/// Textures are always RGBA32Float, writable from the conversion kernel, and sampleable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    /// Number of mip levels, including level 0.  At least 1.
    pub mip_count: u32,
    /// Temporary textures are returned to a reuse pool rather than disposed.
    pub temporary: bool,
    pub debug_name: String,
}

impl TextureDescriptor {
    /// Size of `level`, halving per level and never reaching zero.
    ///
    /// ```
    /// # use texture_streaming::TextureDescriptor;
    /// let d = TextureDescriptor { width: 100, height: 6, mip_count: 4, temporary: false, debug_name: "d".into() };
    /// assert_eq!(d.level_size(0), (100, 6));
    /// assert_eq!(d.level_size(3), (12, 1));
    /// ```
    pub fn level_size(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// Number of levels in a complete chain for a `width`×`height` texture.
    pub fn full_mip_count(width: u32, height: u32) -> u32 {
        32 - width.max(height).max(1).leading_zeros()
    }

    pub(crate) fn assert_valid(&self) {
        assert!(
            self.width > 0 && self.height > 0,
            "texture {}x{} has no pixels",
            self.width,
            self.height
        );
        assert!(
            self.mip_count >= 1 && self.mip_count <= Self::full_mip_count(self.width, self.height),
            "mip_count {} is out of range for a {}x{} texture",
            self.mip_count,
            self.width,
            self.height
        );
    }
}

/// A texture produced by [crate::TextureUploader::acquire_texture].
///
/// Cloning the handle does not clone the texture.
pub struct TextureHandle<B: Backend> {
    pub(crate) inner: B::Texture,
    pub(crate) descriptor: TextureDescriptor,
}

impl<B: Backend> TextureHandle<B> {
    pub fn width(&self) -> u32 {
        self.descriptor.width
    }

    pub fn height(&self) -> u32 {
        self.descriptor.height
    }

    pub fn mip_count(&self) -> u32 {
        self.descriptor.mip_count
    }

    pub fn is_temporary(&self) -> bool {
        self.descriptor.temporary
    }

    pub fn descriptor(&self) -> &TextureDescriptor {
        &self.descriptor
    }

    /// The backend's texture, for binding in your own passes.
    pub fn backend_texture(&self) -> &B::Texture {
        &self.inner
    }
}

impl<B: Backend> Clone for TextureHandle<B> {
    fn clone(&self) -> Self {
        TextureHandle {
            inner: self.inner.clone(),
            descriptor: self.descriptor.clone(),
        }
    }
}

impl<B: Backend> Debug for TextureHandle<B> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextureHandle")
            .field("inner", &self.inner)
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_chain_lengths() {
        assert_eq!(TextureDescriptor::full_mip_count(1, 1), 1);
        assert_eq!(TextureDescriptor::full_mip_count(4, 4), 3);
        assert_eq!(TextureDescriptor::full_mip_count(4096, 17), 13);
        assert_eq!(TextureDescriptor::full_mip_count(5, 3), 3);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn too_many_mips() {
        TextureDescriptor {
            width: 4,
            height: 4,
            mip_count: 4,
            temporary: false,
            debug_name: "t".into(),
        }
        .assert_valid();
    }
}
