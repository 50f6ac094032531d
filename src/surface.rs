//! Fixed-capacity surface pool for in-flight device frames.
//!
//! The pool is sized once from the backend's post-negotiation suggested
//! surface count and never grows. Acquisition is a linear scan for the
//! first slot not in flight; when every slot is busy the caller gets
//! [`Error::PoolExhausted`] immediately rather than blocking, since a
//! full pool means the consumer is not releasing frames and waiting
//! would deadlock the submission thread.

use crate::error::{Error, Result};
use crate::format::PixelFormat;

/// Descriptor of one pooled surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    /// Slot index within the pool.
    pub index: usize,
    /// Surface width in pixels.
    pub width: u32,
    /// Surface height in pixels.
    pub height: u32,
    /// Pixel format of the device allocation.
    pub format: PixelFormat,
}

#[derive(Debug)]
struct Slot {
    surface: Surface,
    in_use: bool,
}

/// Fixed pool of device surfaces, one slot per possible in-flight frame.
#[derive(Debug)]
pub struct SurfacePool {
    slots: Vec<Slot>,
    /// Monotonic identity; survives reconfiguration resets so tests and
    /// callers can assert the pool was preserved.
    generation: u64,
}

impl SurfacePool {
    /// Create a pool of `capacity` surfaces with identical geometry.
    pub fn new(capacity: usize, width: u32, height: u32, format: PixelFormat) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidParameter(
                "surface pool capacity must be non-zero".into(),
            ));
        }
        let slots = (0..capacity)
            .map(|index| Slot {
                surface: Surface {
                    index,
                    width,
                    height,
                    format,
                },
                in_use: false,
            })
            .collect();
        Ok(Self {
            slots,
            generation: next_generation(),
        })
    }

    /// Acquire the first free slot, marking it in flight.
    pub fn acquire(&mut self) -> Result<Surface> {
        for slot in &mut self.slots {
            if !slot.in_use {
                slot.in_use = true;
                return Ok(slot.surface);
            }
        }
        crate::observability::record_pool_exhausted();
        Err(Error::PoolExhausted)
    }

    /// Return a slot to the free set. Out-of-range indices are ignored.
    pub fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.in_use = false;
        }
    }

    /// Release every slot (stream reset, IDR).
    pub fn release_all(&mut self) {
        for slot in &mut self.slots {
            slot.in_use = false;
        }
    }

    /// Total slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently in flight.
    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// Pool identity, unchanged across reconfiguration.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

fn next_generation() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: usize) -> SurfacePool {
        SurfacePool::new(capacity, 640, 480, PixelFormat::Nv12).unwrap()
    }

    #[test]
    fn acquire_returns_lowest_free_index() {
        let mut p = pool(3);
        assert_eq!(p.acquire().unwrap().index, 0);
        assert_eq!(p.acquire().unwrap().index, 1);
        p.release(0);
        assert_eq!(p.acquire().unwrap().index, 0);
    }

    #[test]
    fn exhaustion_is_immediate() {
        let mut p = pool(2);
        p.acquire().unwrap();
        p.acquire().unwrap();
        let start = std::time::Instant::now();
        assert!(matches!(p.acquire(), Err(Error::PoolExhausted)));
        // No blocking: the failed acquire must not have slept.
        assert!(start.elapsed() < std::time::Duration::from_millis(10));
        assert_eq!(p.in_flight(), 2);
    }

    #[test]
    fn failed_acquire_retires_nothing() {
        let mut p = pool(1);
        p.acquire().unwrap();
        let _ = p.acquire();
        p.release(0);
        assert_eq!(p.in_flight(), 0);
        assert!(p.acquire().is_ok());
    }

    #[test]
    fn release_all_clears() {
        let mut p = pool(4);
        for _ in 0..4 {
            p.acquire().unwrap();
        }
        p.release_all();
        assert_eq!(p.in_flight(), 0);
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(SurfacePool::new(0, 640, 480, PixelFormat::Nv12).is_err());
    }

    #[test]
    fn generations_are_unique() {
        let a = pool(1);
        let b = pool(1);
        assert_ne!(a.generation(), b.generation());
    }
}
