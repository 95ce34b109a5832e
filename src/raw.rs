//! Access generic storage as a raw image.
//!
//! A raw image has no translation work: virtual offsets are storage
//! offsets, and the virtual size is the storage size at open time.

use crate::error::Result;
use crate::format::{Extent, Image, ImageFormat};
use crate::storage::{FileStorage, Storage};
use std::fmt::{self, Display, Formatter};
use std::path::Path;

/// Wraps a storage object without any translation.
#[derive(Debug)]
pub struct Raw {
    /// Wrapped storage object.
    storage: Box<dyn Storage>,

    /// Disk size, which is the storage size when this object was created.
    size: u64,
}

impl Raw {
    /// Wrap `storage`, allowing it to be used as a disk image in raw
    /// format.
    pub fn open_image(storage: Box<dyn Storage>) -> Result<Self> {
        let size = storage.size()?;
        Ok(Raw { storage, size })
    }

    /// Open the file at the given path as a raw image.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = FileStorage::open(path)?;
        Self::open_image(Box::new(storage))
    }
}

impl Image for Raw {
    fn format(&self) -> ImageFormat {
        ImageFormat::Raw
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn readable(&self) -> Result<()> {
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let Some(remaining) = self.size.checked_sub(offset) else {
            return Ok(0);
        };
        let len = std::cmp::min(buf.len() as u64, remaining) as usize;
        self.storage.read_exact_at(&mut buf[..len], offset)?;
        Ok(len)
    }

    fn extent(&self, start: u64, length: u64) -> Result<Extent> {
        if start.checked_add(length).map_or(true, |end| end > self.size) {
            return Err(crate::Error::Malformed(format!(
                "extent query [{start}, +{length}) out of bounds (size {})",
                self.size
            )));
        }
        // No hole detection on the underlying storage; report one
        // allocated run.
        Ok(Extent {
            start,
            length,
            allocated: true,
            zero: false,
            compressed: false,
        })
    }
}

impl Display for Raw {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "raw[{}]", self.storage)
    }
}
