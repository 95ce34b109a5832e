//! Format probing and the front door for opening images.
//!
//! Probing looks at the first sector only: qcow2 is dispatched to the real
//! implementation, a handful of foreign container formats are recognized
//! by magic and opened as stubs, and anything else is treated as a raw
//! image.

use crate::error::{Error, Result};
use crate::format::{Image, ImageFormat};
use crate::qcow2::Qcow2;
use crate::raw::Raw;
use crate::storage::{FileStorage, Storage};
use crate::stub::Stub;
use std::path::Path;

/// Probed prefix length.  Large enough for every magic we look at.
const PROBE_LEN: usize = 512;

/// Open the image file at `path`, probing its format.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Box<dyn Image>> {
    let storage = FileStorage::open(path)?;
    open_image(Box::new(storage))
}

/// Open an image over the given storage object, probing its format.
pub fn open_image(storage: Box<dyn Storage>) -> Result<Box<dyn Image>> {
    open_image_at_depth(storage, 0)
}

/// Open an image over the given storage object as the given format.
///
/// Returns [`Error::WrongFormat`] when the storage does not hold an image
/// of that format.  This is also the opener used for backing files whose
/// format is recorded in the image header.
pub fn open_with_format(storage: Box<dyn Storage>, format: ImageFormat) -> Result<Box<dyn Image>> {
    open_with_format_at_depth(storage, format, 0)
}

/// [`open_image`] with the current backing chain depth.
pub(crate) fn open_image_at_depth(
    storage: Box<dyn Storage>,
    depth: u32,
) -> Result<Box<dyn Image>> {
    let sector = read_probe_sector(storage.as_ref())?;

    if sector.starts_with(&crate::qcow2::metadata::MAGIC_BYTES) {
        return Ok(Box::new(Qcow2::open_image_at_depth(storage, depth)?));
    }

    if let Some(format) = probe_foreign_format(&sector) {
        return Ok(Box::new(Stub::new(format)));
    }

    Ok(Box::new(Raw::open_image(storage)?))
}

/// [`open_with_format`] with the current backing chain depth.
pub(crate) fn open_with_format_at_depth(
    storage: Box<dyn Storage>,
    format: ImageFormat,
    depth: u32,
) -> Result<Box<dyn Image>> {
    match format {
        ImageFormat::Qcow2 => Ok(Box::new(Qcow2::open_image_at_depth(storage, depth)?)),
        ImageFormat::Raw => Ok(Box::new(Raw::open_image(storage)?)),
        foreign => {
            let sector = read_probe_sector(storage.as_ref())?;
            if probe_foreign_format(&sector) == Some(foreign) {
                Ok(Box::new(Stub::new(foreign)))
            } else {
                Err(Error::WrongFormat(format!("image is not {foreign}")))
            }
        }
    }
}

/// Read the first sector, tolerating files shorter than one sector.
fn read_probe_sector(storage: &dyn Storage) -> Result<[u8; PROBE_LEN]> {
    let mut sector = [0u8; PROBE_LEN];
    let mut filled = 0;
    while filled < sector.len() {
        let n = storage.read_at(&mut sector[filled..], filled as u64)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(sector)
}

/// Recognize foreign container formats by their magic.
fn probe_foreign_format(sector: &[u8]) -> Option<ImageFormat> {
    // VMDK comes in three flavors: a plain-text descriptor file, the
    // sparse "KDMV" variant (vmdk4), and the older "COWD" one (vmdk3).
    if sector.starts_with(b"# Disk DescriptorFile")
        || sector.starts_with(b"KDMV")
        || sector.starts_with(b"COWD")
    {
        return Some(ImageFormat::Vmdk);
    }
    if sector.starts_with(b"vhdxfile") {
        return Some(ImageFormat::Vhdx);
    }
    // VDI: little-endian signature at offset 64, after the text preamble.
    if sector.len() >= 68 {
        let signature = u32::from_le_bytes(sector[64..68].try_into().unwrap());
        if signature == 0xbeda_107f {
            return Some(ImageFormat::Vdi);
        }
    }
    if sector.starts_with(b"conectix") {
        return Some(ImageFormat::Vpc);
    }
    if sector.starts_with(b"WithoutFreeSpace") {
        return Some(ImageFormat::Parallels);
    }
    if sector.starts_with(b"shdw") {
        return Some(ImageFormat::Asif);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_foreign_magic() {
        let mut sector = [0u8; PROBE_LEN];

        sector[..4].copy_from_slice(b"KDMV");
        assert_eq!(probe_foreign_format(&sector), Some(ImageFormat::Vmdk));

        sector[..8].copy_from_slice(b"vhdxfile");
        assert_eq!(probe_foreign_format(&sector), Some(ImageFormat::Vhdx));

        sector[..8].copy_from_slice(b"conectix");
        assert_eq!(probe_foreign_format(&sector), Some(ImageFormat::Vpc));

        let mut sector = [0u8; PROBE_LEN];
        sector[64..68].copy_from_slice(&0xbeda_107fu32.to_le_bytes());
        assert_eq!(probe_foreign_format(&sector), Some(ImageFormat::Vdi));

        let sector = [0u8; PROBE_LEN];
        assert_eq!(probe_foreign_format(&sector), None);
    }
}
