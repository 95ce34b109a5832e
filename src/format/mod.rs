//! Image format interface.
//!
//! Every supported container format implements [`Image`]: a synchronous,
//! read-only view of the image's virtual address space, plus an extent map
//! describing allocation status.  Concrete variants are
//! [`Qcow2`](crate::Qcow2), [`Raw`](crate::Raw), and
//! [`Stub`](crate::Stub) for formats that are recognized but not
//! implemented.

pub mod probe;

use crate::Result;
use std::fmt::{Debug, Display};

/// Disk image container formats known to this crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum ImageFormat {
    Qcow2,
    Raw,
    Vmdk,
    Vhdx,
    Vdi,
    Vpc,
    Parallels,
    Asif,
}

impl ImageFormat {
    /// The canonical format name, as used in qcow2 backing file format
    /// header extensions.
    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Raw => "raw",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Vdi => "vdi",
            ImageFormat::Vpc => "vpc",
            ImageFormat::Parallels => "parallels",
            ImageFormat::Asif => "asif",
        }
    }

    /// Parse a format name.  "file" is accepted as an alias for raw.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "qcow2" => Some(ImageFormat::Qcow2),
            "raw" | "file" => Some(ImageFormat::Raw),
            "vmdk" => Some(ImageFormat::Vmdk),
            "vhdx" => Some(ImageFormat::Vhdx),
            "vdi" => Some(ImageFormat::Vdi),
            "vpc" => Some(ImageFormat::Vpc),
            "parallels" => Some(ImageFormat::Parallels),
            "asif" => Some(ImageFormat::Asif),
            _ => None,
        }
    }
}

impl Display for ImageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A contiguous run of virtual bytes sharing allocation status.
///
/// Extents are aligned to the image's cluster size, except that the first
/// and last extent of a query may be clipped to the queried window.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Extent {
    /// Offset from the start of the image in bytes.
    pub start: u64,

    /// Length of this extent in bytes.
    pub length: u64,

    /// Whether bytes are present in this image (not its backing chain).
    pub allocated: bool,

    /// Whether the range reads as zeros.  True both for unallocated holes
    /// and for explicit all-zero clusters.
    pub zero: bool,

    /// Whether the range is stored compressed.  Implies `allocated`.
    pub compressed: bool,
}

impl Extent {
    /// Whether two extents have the same status and may be merged.
    pub(crate) fn same_status(&self, other: &Extent) -> bool {
        self.allocated == other.allocated
            && self.zero == other.zero
            && self.compressed == other.compressed
    }
}

/// Read access to a disk image.
///
/// Implementations are safe for concurrent use by multiple threads.  An
/// image owns its storage and its backing image chain; dropping it
/// releases both.
pub trait Image: Debug + Display + Send + Sync {
    /// The image's container format.
    fn format(&self) -> ImageFormat;

    /// Size of the virtual disk in bytes.
    fn size(&self) -> u64;

    /// Whether this image is supported by this reader.
    ///
    /// Reports, without reading payload data, the error that every data
    /// access would return.  Readability is determined when the image is
    /// opened and cached.
    fn readable(&self) -> Result<()>;

    /// Read bytes at virtual offset `offset` into `buf`.
    ///
    /// Returns the number of bytes read.  The count is short (possibly 0)
    /// exactly when the read reaches the end of the virtual disk; short
    /// reads within bounds are re-driven internally.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Return the next extent starting at `start`.
    ///
    /// An extent describes one or more clusters having the same status.
    /// The maximum length of the returned extent is limited by `length`;
    /// fails if `start + length` exceeds the virtual disk size.
    fn extent(&self, start: u64, length: u64) -> Result<Extent>;
}
