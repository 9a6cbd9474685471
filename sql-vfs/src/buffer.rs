//! Buffer proxies over the execution environment's shared memory.
//!
//! The host may relocate its memory when it grows, invalidating any slice
//! previously handed out. A [ByteView] therefore never caches a slice: every
//! access re-resolves the backing region through the [Region] capability.
//! [ScalarView] restricts a view to one little-endian `i32`/`i64` field and
//! checks the requested endianness on every access.

use std::sync::{Arc, Mutex};

use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum Fault {
    #[snafu(display("big-endian access rejected"))]
    BigEndian,

    #[snafu(display("view [{offset}, +{len}) escapes region of {size} bytes"))]
    OutOfRegion {
        offset: usize,
        len: usize,
        size: usize,
    },

    #[snafu(display("scalar view of {len} bytes, expected {expected}"))]
    ScalarSize {
        len: usize,
        expected: usize,
    },
}

/// Capability to reach the host memory backing a view. `with` must resolve
/// the current location of the memory on every call.
pub trait Region: Send + Sync {
    fn with(&self, f: &mut dyn FnMut(&mut [u8]));
}

/// A byte-array view into a [Region] at a fixed offset.
#[derive(Clone)]
pub struct ByteView {
    region: Arc<dyn Region>,
    offset: usize,
    len: usize,
}

impl ByteView {
    pub fn new(region: Arc<dyn Region>, offset: usize, len: usize) -> Self {
        ByteView {
            region,
            offset,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn access<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R, Fault> {
        let mut f = Some(f);
        let mut out = None;
        let mut fault = None;
        self.region.with(&mut |bytes| {
            let end = self.offset.checked_add(self.len);
            match end {
                Some(end) if end <= bytes.len() => {
                    let f = f.take().expect("region resolved twice in one access");
                    out = Some(f(&mut bytes[self.offset..end]));
                }
                _ => {
                    fault = Some(Fault::OutOfRegion {
                        offset: self.offset,
                        len: self.len,
                        size: bytes.len(),
                    });
                }
            }
        });
        match (out, fault) {
            (Some(r), _) => Ok(r),
            (None, Some(f)) => Err(f),
            (None, None) => unreachable!("region did not invoke the access callback"),
        }
    }

    /// Copy the view's current contents into `out` (sized like the view).
    pub fn copy_to(&self, out: &mut [u8]) -> Result<(), Fault> {
        debug_assert_eq!(out.len(), self.len);
        self.access(|bytes| out.copy_from_slice(bytes))
    }

    /// Overwrite the view with `src` (sized like the view).
    pub fn copy_from(&self, src: &[u8]) -> Result<(), Fault> {
        debug_assert_eq!(src.len(), self.len);
        self.access(|bytes| bytes.copy_from_slice(src))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, Fault> {
        self.access(|bytes| bytes.to_vec())
    }

    /// Fill the tail of the view starting at `from` with `byte`.
    pub fn fill_from(&self, from: usize, byte: u8) -> Result<(), Fault> {
        self.access(|bytes| {
            if from < bytes.len() {
                bytes[from..].fill(byte);
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    I32,
    I64,
}

impl Width {
    fn bytes(self) -> usize {
        match self {
            Width::I32 => 4,
            Width::I64 => 8,
        }
    }
}

/// A two-field view restricted to one `{i32, i64}` little-endian value.
#[derive(Clone)]
pub struct ScalarView {
    view: ByteView,
    width: Width,
    endian: Endian,
}

impl ScalarView {
    pub fn new(view: ByteView, width: Width, endian: Endian) -> Self {
        ScalarView {
            view,
            width,
            endian,
        }
    }

    pub fn i32(region: Arc<dyn Region>, offset: usize) -> Self {
        Self::new(ByteView::new(region, offset, 4), Width::I32, Endian::Little)
    }

    pub fn i64(region: Arc<dyn Region>, offset: usize) -> Self {
        Self::new(ByteView::new(region, offset, 8), Width::I64, Endian::Little)
    }

    fn check(&self) -> Result<(), Fault> {
        if self.endian == Endian::Big {
            return Err(Fault::BigEndian);
        }
        let expected = self.width.bytes();
        if self.view.len() != expected {
            return Err(Fault::ScalarSize {
                len: self.view.len(),
                expected,
            });
        }
        Ok(())
    }

    pub fn get(&self) -> Result<i64, Fault> {
        self.check()?;
        let bytes = self.view.to_vec()?;
        Ok(match self.width {
            Width::I32 => i32::from_le_bytes(bytes.try_into().expect("checked width")) as i64,
            Width::I64 => i64::from_le_bytes(bytes.try_into().expect("checked width")),
        })
    }

    pub fn set(&self, value: i64) -> Result<(), Fault> {
        self.check()?;
        match self.width {
            Width::I32 => self.view.copy_from(&(value as i32).to_le_bytes()),
            Width::I64 => self.view.copy_from(&value.to_le_bytes()),
        }
    }
}

/// An owned, growable region for embedders and tests. Growing relocates the
/// backing allocation, which existing views survive because they re-resolve.
pub struct GrowableRegion {
    bytes: Mutex<Vec<u8>>,
}

impl GrowableRegion {
    pub fn with_len(len: usize) -> Arc<Self> {
        Arc::new(GrowableRegion {
            bytes: Mutex::new(vec![0; len]),
        })
    }

    pub fn from_vec(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(GrowableRegion {
            bytes: Mutex::new(bytes),
        })
    }

    pub fn grow_to(&self, len: usize) {
        let mut bytes = self.bytes.lock().unwrap();
        if bytes.len() < len {
            bytes.resize(len, 0);
        }
    }
}

impl Region for GrowableRegion {
    fn with(&self, f: &mut dyn FnMut(&mut [u8])) {
        f(&mut self.bytes.lock().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_survives_relocation() {
        let region = GrowableRegion::with_len(8);
        let view = ByteView::new(region.clone(), 4, 4);
        view.copy_from(&[1, 2, 3, 4]).unwrap();

        // Force a reallocation; the view must still resolve.
        region.grow_to(1 << 16);
        assert_eq!(view.to_vec().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn view_out_of_region() {
        let region = GrowableRegion::with_len(8);
        let view = ByteView::new(region, 6, 4);
        assert!(matches!(
            view.to_vec(),
            Err(Fault::OutOfRegion { offset: 6, len: 4, size: 8 })
        ));
    }

    #[test]
    fn scalar_round_trip() {
        let region = GrowableRegion::with_len(16);
        let out = ScalarView::i64(region.clone(), 0);
        out.set(0x1122_3344_5566).unwrap();
        assert_eq!(out.get().unwrap(), 0x1122_3344_5566);

        let narrow = ScalarView::i32(region, 8);
        narrow.set(-7).unwrap();
        assert_eq!(narrow.get().unwrap(), -7);
    }

    #[test]
    fn big_endian_rejected() {
        let region = GrowableRegion::with_len(8);
        let view = ScalarView::new(
            ByteView::new(region, 0, 4),
            Width::I32,
            Endian::Big,
        );
        assert!(matches!(view.get(), Err(Fault::BigEndian)));
        assert!(matches!(view.set(1), Err(Fault::BigEndian)));
    }

    #[test]
    fn fill_tail() {
        let region = GrowableRegion::from_vec(vec![9; 8]);
        let view = ByteView::new(region, 0, 8);
        view.fill_from(5, 0).unwrap();
        assert_eq!(view.to_vec().unwrap(), vec![9, 9, 9, 9, 9, 0, 0, 0]);
    }
}
