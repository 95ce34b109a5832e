//! Functionality for working with qcow2 metadata.
//!
//! Covers the fixed v2/v3 header blocks, the additional-fields block, and
//! the variable header extension area.

use crate::error::{Error, Result};
use crate::qcow2::compressed::{self, CompressionType};
use crate::storage::Storage;
use bincode::Options;
use serde::Deserialize;
use std::io;
use tracing::warn;

/// Qcow magic ("QFI\xfb").
pub(crate) const MAGIC: u32 = 0x51_46_49_fb;

/// Qcow magic as on-disk bytes, for probing.
pub(crate) const MAGIC_BYTES: [u8; 4] = *b"QFI\xfb";

/// Minimum cluster bits.
///
/// Defined by the specification.
const MIN_CLUSTER_BITS: u32 = 9;

/// Maximum cluster bits (2 MiB clusters).
///
/// This is QEMU's limit, so we can apply it, too.
const MAX_CLUSTER_BITS: u32 = 21;

/// Maximum length of a backing file name.
const MAX_BACKING_NAME_LEN: u32 = 1023;

/// Longest header extension body we accept.
const MAX_EXTENSION_LEN: u32 = 4096;

/// Most header extension records we accept.
const MAX_EXTENSIONS: usize = 256;

/// Incompatible feature bits, with their feature-name-table names.
const INCOMPATIBLE_DIRTY_BIT: u32 = 0;
const INCOMPATIBLE_CORRUPT_BIT: u32 = 1;
const INCOMPATIBLE_EXTERNAL_DATA_FILE_BIT: u32 = 2;
const INCOMPATIBLE_COMPRESSION_TYPE_BIT: u32 = 3;
const INCOMPATIBLE_EXTENDED_L2_BIT: u32 = 4;

const INCOMPATIBLE_FEATURE_NAMES: [&str; 5] = [
    "dirty bit",
    "corrupt bit",
    "external data file",
    "compression type",
    "extended L2 entries",
];

/// Human-readable name of an incompatible feature bit.
fn incompatible_feature_name(bit: u32) -> String {
    INCOMPATIBLE_FEATURE_NAMES
        .get(bit as usize)
        .map(|name| (*name).to_string())
        .unwrap_or_else(|| format!("unknown-{bit}"))
}

/// Human-readable name of a crypt method.
fn crypt_method_name(method: u32) -> String {
    match method {
        1 => "aes".to_string(),
        2 => "luks".to_string(),
        n => format!("unknown-{n}"),
    }
}

/// Big-endian fixed-width integer encoding, as used by all qcow2
/// metadata.
fn bincode_opts() -> impl Options + Copy {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
}

/// Qcow2 v2 header (always present).
#[derive(Debug, Deserialize)]
pub(super) struct V2Header {
    /// Qcow magic string ("QFI\xfb").
    pub magic: u32,

    /// Version number (valid values are 2 and 3).
    pub version: u32,

    /// Offset into the image file at which the backing file name is
    /// stored (not null terminated).  0 if the image doesn't have a
    /// backing file.
    pub backing_file_offset: u64,

    /// Length of the backing file name in bytes.  Must not be longer than
    /// 1023 bytes.
    pub backing_file_size: u32,

    /// `1 << cluster_bits` is the cluster size.  Must not be less than 9.
    pub cluster_bits: u32,

    /// Virtual disk size in bytes.
    pub size: u64,

    /// Encryption method: 0 none, 1 AES, 2 LUKS.
    pub crypt_method: u32,

    /// Number of entries in the active L1 table.
    pub l1_size: u32,

    /// Offset into the image file at which the active L1 table starts.
    pub l1_table_offset: u64,

    /// Offset of the refcount table (parsed, not enforced).
    pub refcount_table_offset: u64,

    /// Number of clusters the refcount table occupies (parsed, not
    /// enforced).
    pub refcount_table_clusters: u32,

    /// Number of snapshots contained in the image (parsed, not
    /// traversed).
    pub nb_snapshots: u32,

    /// Offset of the snapshot table (parsed, not traversed).
    pub snapshots_offset: u64,
}

impl V2Header {
    /// Raw v2 header length.
    pub const RAW_SIZE: usize = 72;
}

/// Qcow2 v3 header block (present iff version >= 3).
#[derive(Debug, Deserialize)]
pub(super) struct V3Header {
    /// Bitmask of incompatible features.  An implementation must refuse
    /// to read an image with unknown bits set.
    pub incompatible_features: u64,

    /// Bitmask of compatible features; unknown bits can be ignored.
    pub compatible_features: u64,

    /// Bitmask of auto-clear features; read-only access can ignore them.
    pub autoclear_features: u64,

    /// Width of a refcount block entry: `refcount_bits = 1 <<
    /// refcount_order`.
    pub refcount_order: u32,

    /// Length of the header structure in bytes.  For version 2 images,
    /// the length is always assumed to be 72 bytes.
    pub header_length: u32,
}

impl V3Header {
    /// Raw v3 block length beyond the v2 header.
    pub const RAW_SIZE: usize = 104 - V2Header::RAW_SIZE;
}

/// Additional header fields past offset 104 (present iff `header_length >
/// 104`).
#[derive(Debug, Deserialize)]
pub(super) struct HeaderAdditional {
    /// Compression type used for compressed clusters.
    pub compression_type: u8,

    /// Padding up to the next multiple of 8 bytes.
    #[allow(dead_code)]
    pub padding: [u8; 7],
}

impl HeaderAdditional {
    /// Raw additional block length.
    pub const RAW_SIZE: usize = 8;
}

/// Integrated header representation.
///
/// The v3 and additional blocks are optional by design: a `None` arm
/// means the block is absent from the image, and v2 defaults apply.
#[derive(Debug)]
pub(super) struct Header {
    /// v2 part of the header.
    v2: V2Header,

    /// v3 block, for version >= 3 images.
    v3: Option<V3Header>,

    /// Additional fields block.
    additional: Option<HeaderAdditional>,
}

impl Header {
    /// Load the qcow2 header from `storage`.
    ///
    /// A magic or version mismatch, and any short read on the fixed
    /// header blocks, is reported as [`Error::WrongFormat`] so that
    /// probing can fall through to the next container type.
    pub fn load(storage: &dyn Storage) -> Result<Self> {
        let bincode = bincode_opts();

        let mut v2_buf = [0u8; V2Header::RAW_SIZE];
        read_fixed_block(storage, &mut v2_buf, 0)?;
        let v2: V2Header = bincode
            .deserialize(&v2_buf)
            .map_err(|e| Error::WrongFormat(format!("cannot parse header: {e}")))?;

        if v2.magic != MAGIC {
            return Err(Error::WrongFormat(format!(
                "the image lacks the qcow magic (got {:#010x})",
                v2.magic
            )));
        }
        if v2.version < 2 {
            return Err(Error::WrongFormat(format!(
                "expected version >= 2, got {}",
                v2.version
            )));
        }

        let v3 = if v2.version >= 3 {
            let mut v3_buf = [0u8; V3Header::RAW_SIZE];
            read_fixed_block(storage, &mut v3_buf, V2Header::RAW_SIZE as u64)?;
            let v3: V3Header = bincode
                .deserialize(&v3_buf)
                .map_err(|e| Error::WrongFormat(format!("cannot parse v3 header: {e}")))?;
            Some(v3)
        } else {
            None
        };

        let additional = match &v3 {
            Some(v3) if v3.header_length > 104 => {
                let mut add_buf = [0u8; HeaderAdditional::RAW_SIZE];
                read_fixed_block(storage, &mut add_buf, 104)?;
                let additional: HeaderAdditional = bincode
                    .deserialize(&add_buf)
                    .map_err(|e| Error::WrongFormat(format!("cannot parse additional fields: {e}")))?;
                Some(additional)
            }
            _ => None,
        };

        Ok(Header { v2, v3, additional })
    }

    /// Check whether the image described by this header is readable by
    /// this implementation.
    ///
    /// The result is determined once when opening and cached on the
    /// image; pure over the header and the decompressor registry.
    pub fn readable(&self) -> Result<()> {
        if self.v2.magic != MAGIC || self.v2.version < 2 {
            return Err(Error::WrongFormat("image is not qcow2".to_string()));
        }
        if self.v2.cluster_bits < MIN_CLUSTER_BITS || self.v2.cluster_bits > MAX_CLUSTER_BITS {
            return Err(Error::Malformed(format!(
                "expected cluster bits in [{MIN_CLUSTER_BITS}, {MAX_CLUSTER_BITS}], got {}",
                self.v2.cluster_bits
            )));
        }
        if self.v2.crypt_method != 0 {
            return Err(Error::UnsupportedEncryption(crypt_method_name(
                self.v2.crypt_method,
            )));
        }
        if let Some(v3) = &self.v3 {
            for bit in 0..64 {
                if (v3.incompatible_features >> bit) & 1 == 0 {
                    continue;
                }
                match bit {
                    INCOMPATIBLE_DIRTY_BIT | INCOMPATIBLE_CORRUPT_BIT => {
                        warn!(
                            "unexpected incompatible feature bit: {:?}",
                            incompatible_feature_name(bit)
                        );
                    }
                    INCOMPATIBLE_EXTENDED_L2_BIT => {
                        warn!(
                            "support for {:?} is experimental",
                            incompatible_feature_name(bit)
                        );
                    }
                    // The compression type bit refers to the additional
                    // compression_type field, which is handled below.
                    INCOMPATIBLE_COMPRESSION_TYPE_BIT => {}
                    INCOMPATIBLE_EXTERNAL_DATA_FILE_BIT => {
                        return Err(Error::UnsupportedFeature(format!(
                            "incompatible feature: {:?}",
                            incompatible_feature_name(bit)
                        )));
                    }
                    _ => {
                        return Err(Error::UnsupportedFeature(format!(
                            "incompatible feature bit {bit}"
                        )));
                    }
                }
            }
        }
        let compression_type = self.compression_type();
        if compressed::decompressor_for(compression_type).is_none() {
            return Err(Error::UnsupportedCompression(format!(
                "no decompressor is registered for compression type {}",
                CompressionType::name(compression_type)
            )));
        }
        Ok(())
    }

    /// Guest disk size in bytes.
    pub fn size(&self) -> u64 {
        self.v2.size
    }

    /// Format version (2 or 3).
    pub fn version(&self) -> u32 {
        self.v2.version
    }

    /// Number of snapshots contained in the image.
    pub fn nb_snapshots(&self) -> u32 {
        self.v2.nb_snapshots
    }

    /// Offset of the snapshot table.
    pub fn snapshots_offset(&self) -> u64 {
        self.v2.snapshots_offset
    }

    /// Offset of the refcount table.
    pub fn refcount_table_offset(&self) -> u64 {
        self.v2.refcount_table_offset
    }

    /// Number of clusters the refcount table occupies.
    pub fn refcount_table_clusters(&self) -> u32 {
        self.v2.refcount_table_clusters
    }

    /// Compatible feature bits (safe to ignore).
    pub fn compatible_features(&self) -> u64 {
        self.v3.as_ref().map_or(0, |v3| v3.compatible_features)
    }

    /// Auto-clear feature bits (read-only access may ignore them).
    pub fn autoclear_features(&self) -> u64 {
        self.v3.as_ref().map_or(0, |v3| v3.autoclear_features)
    }

    /// log2 of the refcount bits (4 for version 2 images).
    pub fn refcount_order(&self) -> u32 {
        self.v3.as_ref().map_or(4, |v3| v3.refcount_order)
    }

    /// log2 of the cluster size.
    pub fn cluster_bits(&self) -> u32 {
        self.v2.cluster_bits
    }

    /// Cluster size in bytes.
    pub fn cluster_size(&self) -> u64 {
        1 << self.v2.cluster_bits
    }

    /// Offset of the backing file name, 0 if there is none.
    pub fn backing_file_offset(&self) -> u64 {
        self.v2.backing_file_offset
    }

    /// Length of the backing file name.
    pub fn backing_file_size(&self) -> u32 {
        self.v2.backing_file_size
    }

    /// Whether the backing file name length is within the format limit.
    pub fn backing_name_len_valid(&self) -> bool {
        self.v2.backing_file_size <= MAX_BACKING_NAME_LEN
    }

    /// Offset of the L1 table.
    pub fn l1_table_offset(&self) -> u64 {
        self.v2.l1_table_offset
    }

    /// Number of entries in the L1 table.
    pub fn l1_entries(&self) -> u32 {
        self.v2.l1_size
    }

    /// Length of the header structure, where the extension area begins.
    pub fn header_length(&self) -> u32 {
        match &self.v3 {
            Some(v3) => v3.header_length,
            None => V2Header::RAW_SIZE as u32,
        }
    }

    /// Whether the image uses extended (128-bit) L2 entries.
    pub fn extended_l2(&self) -> bool {
        self.v3
            .as_ref()
            .map_or(false, |v3| {
                (v3.incompatible_features >> INCOMPATIBLE_EXTENDED_L2_BIT) & 1 != 0
            })
    }

    /// The image's compression type byte (0 when the additional block is
    /// absent).
    pub fn compression_type(&self) -> u8 {
        self.additional
            .as_ref()
            .map_or(0, |additional| additional.compression_type)
    }
}

/// Read a fixed header block, mapping short reads to wrong-format.
fn read_fixed_block(storage: &dyn Storage, buf: &mut [u8], offset: u64) -> Result<()> {
    storage.read_exact_at(buf, offset).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::WrongFormat(format!("short read on the header at offset {offset}"))
        } else {
            Error::Io(e)
        }
    })
}

/// Header extension types recognized by this reader.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum HeaderExtensionType {
    /// End of the header extension area.
    End,

    /// Backing file format name string.
    BackingFileFormat,

    /// Map of feature bits to human-readable names.
    FeatureNameTable,

    /// Bitmaps extension (parsed but ignored).
    Bitmaps,

    /// Full disk encryption header pointer.
    FullDiskEncryption,

    /// External data file filename string.
    ExternalDataFileName,
}

impl HeaderExtensionType {
    /// Every recognized extension type.
    const ALL: [HeaderExtensionType; 6] = [
        HeaderExtensionType::End,
        HeaderExtensionType::BackingFileFormat,
        HeaderExtensionType::FeatureNameTable,
        HeaderExtensionType::Bitmaps,
        HeaderExtensionType::FullDiskEncryption,
        HeaderExtensionType::ExternalDataFileName,
    ];

    /// The type's on-disk code.
    const fn code(self) -> u32 {
        match self {
            HeaderExtensionType::End => 0x0000_0000,
            HeaderExtensionType::BackingFileFormat => 0xe279_2aca,
            HeaderExtensionType::FeatureNameTable => 0x6803_f857,
            HeaderExtensionType::Bitmaps => 0x2385_2875,
            HeaderExtensionType::FullDiskEncryption => 0x0537_be77,
            HeaderExtensionType::ExternalDataFileName => 0x4441_5441,
        }
    }

    /// Decode an on-disk type code; `None` for unrecognized types.
    fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|ext_type| ext_type.code() == code)
    }
}

/// One entry of a feature name table extension.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FeatureNameTableEntry {
    /// Feature class (incompatible / compatible / autoclear).
    pub feature_type: u8,

    /// Bit number within the class's feature bitmask.
    pub bit: u8,

    /// Human-readable feature name.
    pub name: String,
}

/// Header extensions (high-level representation).
///
/// Recognized types are decoded; unknown types are retained with their
/// raw payload.  Exposed read-only via
/// [`Qcow2::header_extensions`](crate::Qcow2::header_extensions).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HeaderExtension {
    /// Backing file format name string.
    BackingFileFormat(String),

    /// Map of feature bits to human-readable names.
    FeatureNameTable(Vec<FeatureNameTableEntry>),

    /// Full disk encryption header pointer.
    FullDiskEncryption {
        /// Offset of the encryption header.
        offset: u64,
        /// Length of the encryption header.
        length: u64,
    },

    /// Bitmaps extension, retained raw and ignored.
    Bitmaps(Vec<u8>),

    /// External data file filename string.
    ExternalDataFileName(String),

    /// Unknown extension, retained raw.
    Unknown {
        /// Type code.
        extension_type: u32,
        /// Data (as read).
        data: Vec<u8>,
    },
}

impl HeaderExtension {
    /// Parse an extension from its type and data.
    fn deserialize(extension_type: u32, data: Vec<u8>) -> Result<Self> {
        let Some(known_type) = HeaderExtensionType::from_code(extension_type) else {
            return Ok(HeaderExtension::Unknown {
                extension_type,
                data,
            });
        };

        let extension = match known_type {
            // Handled by the caller before dispatching here.
            HeaderExtensionType::End => HeaderExtension::Unknown {
                extension_type,
                data,
            },
            HeaderExtensionType::BackingFileFormat => {
                let format = String::from_utf8(data).map_err(|e| {
                    Error::Malformed(format!("invalid backing file format name: {e}"))
                })?;
                HeaderExtension::BackingFileFormat(format)
            }
            HeaderExtensionType::FeatureNameTable => {
                let mut entries = Vec::new();
                for record in data.chunks_exact(48) {
                    // The name is zero-padded but not necessarily
                    // NUL-terminated.
                    let name_bytes = record[2..].split(|b| *b == 0).next().unwrap();
                    entries.push(FeatureNameTableEntry {
                        feature_type: record[0],
                        bit: record[1],
                        name: String::from_utf8_lossy(name_bytes).into_owned(),
                    });
                }
                HeaderExtension::FeatureNameTable(entries)
            }
            HeaderExtensionType::FullDiskEncryption => {
                if data.len() < 16 {
                    return Err(Error::Malformed(format!(
                        "full disk encryption pointer too short ({} bytes)",
                        data.len()
                    )));
                }
                HeaderExtension::FullDiskEncryption {
                    offset: u64::from_be_bytes(data[0..8].try_into().unwrap()),
                    length: u64::from_be_bytes(data[8..16].try_into().unwrap()),
                }
            }
            HeaderExtensionType::Bitmaps => HeaderExtension::Bitmaps(data),
            HeaderExtensionType::ExternalDataFileName => {
                let name = String::from_utf8(data).map_err(|e| {
                    Error::Malformed(format!("invalid external data file name: {e}"))
                })?;
                HeaderExtension::ExternalDataFileName(name)
            }
        };

        Ok(extension)
    }
}

/// Read the header extension area.
///
/// Extensions are `(type, length, data, pad to 8)` records starting at
/// `header_length`, terminated by the end marker.  A single oversized
/// record is skipped with a warning; too many records is an error.
pub(super) fn read_extensions(
    storage: &dyn Storage,
    header: &Header,
) -> Result<Vec<HeaderExtension>> {
    let mut extensions = Vec::new();
    let mut offset = header.header_length() as u64;

    loop {
        let mut record_header = [0u8; 8];
        storage.read_exact_at(&mut record_header, offset)?;
        offset += 8;

        let extension_type = u32::from_be_bytes(record_header[0..4].try_into().unwrap());
        let length = u32::from_be_bytes(record_header[4..8].try_into().unwrap());

        if extension_type == HeaderExtensionType::End.code() {
            break;
        }

        let padded_length = (length as u64).next_multiple_of(8);
        if length > MAX_EXTENSION_LEN {
            warn!(
                "ignoring header extension {extension_type:#010x}: too long \
                 ({length} bytes > {MAX_EXTENSION_LEN} bytes)"
            );
            offset += padded_length;
            continue;
        }

        let mut data = vec![0u8; length as usize];
        storage.read_exact_at(&mut data, offset)?;
        offset += padded_length;

        extensions.push(HeaderExtension::deserialize(extension_type, data)?);
        if extensions.len() > MAX_EXTENSIONS {
            return Err(Error::Malformed(format!(
                "too many header extensions ({} records)",
                extensions.len()
            )));
        }
    }

    Ok(extensions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    /// A minimal valid v3 header.
    fn v3_header_bytes() -> Vec<u8> {
        let mut buf = vec![0u8; 112];
        buf[0..4].copy_from_slice(&MAGIC_BYTES);
        buf[4..8].copy_from_slice(&3u32.to_be_bytes()); // version
        buf[20..24].copy_from_slice(&16u32.to_be_bytes()); // cluster_bits
        buf[24..32].copy_from_slice(&(1u64 << 30).to_be_bytes()); // size
        buf[36..40].copy_from_slice(&1u32.to_be_bytes()); // l1_size
        buf[40..48].copy_from_slice(&65536u64.to_be_bytes()); // l1_table_offset
        buf[100..104].copy_from_slice(&104u32.to_be_bytes()); // header_length
        buf
    }

    #[test]
    fn parses_v3_header() {
        let storage = MemStorage::new(v3_header_bytes());
        let header = Header::load(&storage).unwrap();
        assert_eq!(header.size(), 1 << 30);
        assert_eq!(header.cluster_bits(), 16);
        assert_eq!(header.cluster_size(), 65536);
        assert_eq!(header.header_length(), 104);
        assert!(!header.extended_l2());
        assert_eq!(header.compression_type(), 0);
        header.readable().unwrap();
    }

    #[test]
    fn parses_additional_block() {
        let mut buf = v3_header_bytes();
        buf[100..104].copy_from_slice(&112u32.to_be_bytes()); // header_length
        buf[72..80].copy_from_slice(&(1u64 << 3).to_be_bytes()); // compression type bit
        buf[104] = 1; // zstd
        let storage = MemStorage::new(buf);
        let header = Header::load(&storage).unwrap();
        assert_eq!(header.compression_type(), 1);
    }

    #[test]
    fn garbage_is_wrong_format() {
        let storage = MemStorage::new(vec![0x42u8; 512]);
        let err = Header::load(&storage).unwrap_err();
        assert!(err.is_wrong_format(), "{err}");
    }

    #[test]
    fn short_file_is_wrong_format() {
        let storage = MemStorage::new(b"QFI\xfb\x00\x00\x00\x03".to_vec());
        let err = Header::load(&storage).unwrap_err();
        assert!(err.is_wrong_format(), "{err}");
    }

    #[test]
    fn version_1_is_wrong_format() {
        let mut buf = v3_header_bytes();
        buf[4..8].copy_from_slice(&1u32.to_be_bytes());
        let err = Header::load(&MemStorage::new(buf)).unwrap_err();
        assert!(err.is_wrong_format(), "{err}");
    }

    #[test]
    fn encryption_is_unsupported() {
        let mut buf = v3_header_bytes();
        buf[32..36].copy_from_slice(&1u32.to_be_bytes()); // crypt_method aes
        let header = Header::load(&MemStorage::new(buf)).unwrap();
        assert!(matches!(
            header.readable(),
            Err(Error::UnsupportedEncryption(ref m)) if m == "aes"
        ));
    }

    #[test]
    fn unknown_incompatible_bit_is_unsupported() {
        let mut buf = v3_header_bytes();
        buf[72..80].copy_from_slice(&(1u64 << 9).to_be_bytes());
        let header = Header::load(&MemStorage::new(buf)).unwrap();
        assert!(matches!(
            header.readable(),
            Err(Error::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn external_data_file_is_refused() {
        let mut buf = v3_header_bytes();
        buf[72..80].copy_from_slice(&(1u64 << 2).to_be_bytes());
        let header = Header::load(&MemStorage::new(buf)).unwrap();
        assert!(matches!(
            header.readable(),
            Err(Error::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn unknown_compression_type_is_unsupported() {
        let mut buf = v3_header_bytes();
        buf[100..104].copy_from_slice(&112u32.to_be_bytes());
        buf[72..80].copy_from_slice(&(1u64 << 3).to_be_bytes());
        buf[104] = 7;
        let header = Header::load(&MemStorage::new(buf)).unwrap();
        assert!(matches!(
            header.readable(),
            Err(Error::UnsupportedCompression(_))
        ));
    }

    #[test]
    fn small_cluster_bits_is_malformed() {
        let mut buf = v3_header_bytes();
        buf[20..24].copy_from_slice(&8u32.to_be_bytes());
        let header = Header::load(&MemStorage::new(buf)).unwrap();
        assert!(matches!(header.readable(), Err(Error::Malformed(_))));
    }

    #[test]
    fn parses_extension_records() {
        let mut buf = v3_header_bytes();
        let mut ext = Vec::new();

        // Backing file format.
        ext.extend_from_slice(&0xe279_2acau32.to_be_bytes());
        ext.extend_from_slice(&3u32.to_be_bytes());
        ext.extend_from_slice(b"raw\0\0\0\0\0");

        // Feature name table with one record.
        let mut record = vec![0u8; 48];
        record[0] = 0;
        record[1] = 4;
        record[2..20].copy_from_slice(b"extended l2 tables");
        ext.extend_from_slice(&0x6803_f857u32.to_be_bytes());
        ext.extend_from_slice(&48u32.to_be_bytes());
        ext.extend_from_slice(&record);

        // Unknown extension type with a 5-byte body.
        ext.extend_from_slice(&0x1234_5678u32.to_be_bytes());
        ext.extend_from_slice(&5u32.to_be_bytes());
        ext.extend_from_slice(b"abcde\0\0\0");

        // End marker.
        ext.extend_from_slice(&[0u8; 8]);

        buf.truncate(104);
        buf.extend_from_slice(&ext);
        let storage = MemStorage::new(buf);
        let header = Header::load(&storage).unwrap();
        let extensions = read_extensions(&storage, &header).unwrap();

        assert_eq!(extensions.len(), 3);
        assert_eq!(
            extensions[0],
            HeaderExtension::BackingFileFormat("raw".to_string())
        );
        assert_eq!(
            extensions[1],
            HeaderExtension::FeatureNameTable(vec![FeatureNameTableEntry {
                feature_type: 0,
                bit: 4,
                name: "extended l2 tables".to_string(),
            }])
        );
        assert_eq!(
            extensions[2],
            HeaderExtension::Unknown {
                extension_type: 0x1234_5678,
                data: b"abcde".to_vec(),
            }
        );
    }
}
