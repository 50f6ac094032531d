//! Rotating ring of conversion-target textures for decode output.
//!
//! A decoder that hands converted frames to a consumer must not overwrite
//! a texture the consumer is still reading. The ring keeps a small fixed
//! set of targets and rotates through them: `advance()` selects the next
//! slot before each conversion write, so the previously delivered texture
//! stays intact for at least `len - 1` further frames.
//!
//! `ensure()` is idempotent. The geometry of the current allocation is
//! cached; a call with matching geometry touches nothing, and a mid-stream
//! resolution change reallocates the whole ring exactly once.

use crate::error::{Error, Result};
use crate::format::PixelFormat;

/// Smallest allowed ring: double buffering.
///
/// [`advance`](OutputRing::advance) runs before each conversion write, so
/// the texture most recently handed to a callback needs its own slot;
/// with a single slot the write would land in the buffer the consumer
/// just received.
pub const MIN_RING: usize = 2;
/// Upper bound on ring depth.
pub const MAX_RING: usize = 8;

/// Geometry of the ring's allocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDescriptor {
    /// Texture width in pixels.
    pub width: u32,
    /// Texture height in pixels.
    pub height: u32,
    /// Texture pixel format.
    pub format: PixelFormat,
}

/// Rotating set of backend textures, generic over the backend's texture type.
#[derive(Debug)]
pub struct OutputRing<T> {
    textures: Vec<T>,
    descriptor: Option<TextureDescriptor>,
    index: usize,
    depth: usize,
}

impl<T> OutputRing<T> {
    /// Create an empty ring of the given depth. Nothing is allocated
    /// until the first [`ensure_with`](Self::ensure_with).
    pub fn new(depth: usize) -> Result<Self> {
        if !(MIN_RING..=MAX_RING).contains(&depth) {
            return Err(Error::InvalidParameter(format!(
                "ring depth {depth} outside {MIN_RING}..={MAX_RING}"
            )));
        }
        Ok(Self {
            textures: Vec::new(),
            descriptor: None,
            index: 0,
            depth,
        })
    }

    /// Ensure the ring holds `depth` textures matching `desc`.
    ///
    /// `alloc` is invoked once per slot only when the cached descriptor
    /// differs (first use or resolution change); on a reallocation the old
    /// textures are dropped first and the rotation index resets. Returns
    /// whether a reallocation happened.
    pub fn ensure_with<F>(&mut self, desc: TextureDescriptor, mut alloc: F) -> Result<bool>
    where
        F: FnMut(&TextureDescriptor) -> Result<T>,
    {
        if self.descriptor == Some(desc) {
            return Ok(false);
        }
        self.textures.clear();
        self.descriptor = None;
        self.index = 0;
        for _ in 0..self.depth {
            self.textures.push(alloc(&desc)?);
        }
        self.descriptor = Some(desc);
        Ok(true)
    }

    /// Rotate to the next slot. Call exactly once per produced frame,
    /// before the conversion write into [`current_mut`](Self::current_mut).
    pub fn advance(&mut self) {
        if !self.textures.is_empty() {
            self.index = (self.index + 1) % self.textures.len();
        }
    }

    /// The active texture, if allocated.
    pub fn current(&self) -> Option<&T> {
        self.textures.get(self.index)
    }

    /// Mutable access to the active texture for the conversion write.
    pub fn current_mut(&mut self) -> Option<&mut T> {
        self.textures.get_mut(self.index)
    }

    /// Index of the active slot.
    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Cached geometry of the current allocation.
    pub fn descriptor(&self) -> Option<TextureDescriptor> {
        self.descriptor
    }

    /// Configured ring depth.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(width: u32, height: u32) -> TextureDescriptor {
        TextureDescriptor {
            width,
            height,
            format: PixelFormat::Bgra,
        }
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut ring: OutputRing<Vec<u8>> = OutputRing::new(4).unwrap();
        let mut allocs = 0;
        let alloc = |d: &TextureDescriptor| {
            Ok(vec![0u8; d.format.buffer_size(d.width, d.height)])
        };

        assert!(ring
            .ensure_with(desc(64, 64), |d| {
                allocs += 1;
                alloc(d)
            })
            .unwrap());
        assert_eq!(allocs, 4);

        // Same geometry: no reallocation.
        assert!(!ring
            .ensure_with(desc(64, 64), |d| {
                allocs += 1;
                alloc(d)
            })
            .unwrap());
        assert_eq!(allocs, 4);
    }

    #[test]
    fn resolution_change_reallocates_whole_ring_once() {
        let mut ring: OutputRing<Vec<u8>> = OutputRing::new(3).unwrap();
        let mut allocs = 0;
        ring.ensure_with(desc(64, 64), |d| {
            allocs += 1;
            Ok(vec![0u8; d.format.buffer_size(d.width, d.height)])
        })
        .unwrap();
        ring.advance();
        assert_eq!(ring.current_index(), 1);

        assert!(ring
            .ensure_with(desc(128, 128), |d| {
                allocs += 1;
                Ok(vec![0u8; d.format.buffer_size(d.width, d.height)])
            })
            .unwrap());
        assert_eq!(allocs, 6);
        // Rotation restarts after reallocation.
        assert_eq!(ring.current_index(), 0);
        assert_eq!(ring.current().unwrap().len(), 128 * 128 * 4);
    }

    #[test]
    fn rotation_wraps() {
        let mut ring: OutputRing<u32> = OutputRing::new(2).unwrap();
        ring.ensure_with(desc(2, 2), |_| Ok(0u32)).unwrap();
        assert_eq!(ring.current_index(), 0);
        ring.advance();
        assert_eq!(ring.current_index(), 1);
        ring.advance();
        assert_eq!(ring.current_index(), 0);
    }

    #[test]
    fn depth_bounds() {
        assert!(OutputRing::<u32>::new(1).is_err());
        assert!(OutputRing::<u32>::new(9).is_err());
        assert!(OutputRing::<u32>::new(2).is_ok());
        assert!(OutputRing::<u32>::new(8).is_ok());
    }

    #[test]
    fn failed_alloc_leaves_ring_empty() {
        let mut ring: OutputRing<u32> = OutputRing::new(2).unwrap();
        let err = ring.ensure_with(desc(2, 2), |_| {
            Err(Error::Unsupported("no memory type".into()))
        });
        assert!(err.is_err());
        assert!(ring.descriptor().is_none());
        assert!(ring.current().is_none());
    }
}
