#![warn(missing_docs)]

//! Provides random read access to QCOW2 disk images.
//!
//! A qcow2 image is opened as a byte-addressable view of its virtual (guest)
//! address space: reads at arbitrary offsets are translated through the
//! image's two-level cluster tables, compressed clusters are inflated on
//! demand, and regions not allocated in the image fall through to its
//! backing file chain (if any).  Raw images are supported as a passthrough,
//! and a handful of foreign container formats (VMDK, VHDX, VDI, VPC,
//! Parallels, ASIF) are recognized as stubs so that probing can tell them
//! apart from garbage.
//!
//! Simple example:
//! ```no_run
//! # fn main() -> qcow2_reader::Result<()> {
//! use qcow2_reader::Image;
//!
//! let image = qcow2_reader::open("disk.qcow2")?;
//!
//! let mut buf = vec![0u8; 512];
//! image.read_at(&mut buf, 0)?;
//!
//! let extent = image.extent(0, image.size())?;
//! println!("first extent: {extent:?}");
//! # Ok(())
//! # }
//! ```
//!
//! Writing images is out of scope; all access is read-only.
//!
//! # Sparse conversion
//!
//! [`convert::Converter`] copies a full image out to a flat destination
//! (e.g. a raw file) with multiple worker threads, skipping zero extents
//! and zero buffers so that sparseness is preserved:
//! ```no_run
//! # fn main() -> qcow2_reader::Result<()> {
//! use qcow2_reader::convert::Converter;
//! use qcow2_reader::Image;
//!
//! let image = qcow2_reader::open("disk.qcow2")?;
//! let target = std::fs::File::create("disk.raw").map_err(qcow2_reader::Error::Io)?;
//! target.set_len(image.size()).map_err(qcow2_reader::Error::Io)?;
//!
//! Converter::default().convert(&target, image.as_ref(), image.size(), None)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Logging
//!
//! Warnings (e.g. a set dirty bit, oversized header extensions) and debug
//! output are emitted through [`tracing`]; install a subscriber to receive
//! them.

pub mod convert;
mod error;
pub mod format;
mod lru_cache;
pub mod qcow2;
pub mod raw;
pub mod storage;
pub mod stub;

pub use error::{Error, Result};
pub use format::probe::{open, open_image, open_with_format};
pub use format::{Extent, Image, ImageFormat};
pub use qcow2::compressed::{set_decompressor, CompressionType, Decompressor};
pub use qcow2::Qcow2;
pub use raw::Raw;
pub use storage::{FileStorage, MemStorage, Storage};
pub use stub::Stub;
