//! Stubs for recognized but unimplemented formats.

use crate::error::{Error, Result};
use crate::format::{Extent, Image, ImageFormat};
use std::fmt::{self, Display, Formatter};

/// A disk image whose container format was recognized, but for which no
/// reader is implemented.
///
/// Every data access returns [`Error::UnsupportedFeature`]; the stub
/// exists so that probing can distinguish a foreign image from garbage.
#[derive(Debug)]
pub struct Stub {
    /// Recognized format.
    format: ImageFormat,
}

impl Stub {
    /// Create a stub for the given format.
    pub fn new(format: ImageFormat) -> Self {
        Stub { format }
    }

    /// The error every data access returns.
    fn unsupported(&self) -> Error {
        Error::UnsupportedFeature(format!("unimplemented image format: {}", self.format))
    }
}

impl Image for Stub {
    fn format(&self) -> ImageFormat {
        self.format
    }

    /// Stubs do not parse their header; the virtual size is unknown.
    fn size(&self) -> u64 {
        0
    }

    fn readable(&self) -> Result<()> {
        Err(self.unsupported())
    }

    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize> {
        Err(self.unsupported())
    }

    fn extent(&self, _start: u64, _length: u64) -> Result<Extent> {
        Err(self.unsupported())
    }
}

impl Display for Stub {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "stub[{}]", self.format)
    }
}
