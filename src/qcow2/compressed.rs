//! Support for compressed clusters.
//!
//! Each compression type maps to a factory producing a streaming decoder
//! over the compressed region.  Raw DEFLATE (compression type 0, called
//! "zlib" by the format even though there is no zlib wrapper) is always
//! registered; zstd is registered when the `zstd` feature is enabled
//! (the default).  Embedders may install replacements before opening
//! compressed images.

use flate2::read::DeflateDecoder;
use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{OnceLock, RwLock};

/// Compression type byte of a qcow2 image.
///
/// The on-disk field may carry values outside this enum; those are
/// refused at open time unless a decompressor was registered for them.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CompressionType {
    /// Raw DEFLATE, without the zlib header.  The format documentation
    /// calls this "zlib"; that is a misnomer.
    Deflate = 0,

    /// Zstandard.
    Zstd = 1,
}

impl CompressionType {
    /// Human-readable name of a compression type byte.
    pub(crate) fn name(compression_type: u8) -> String {
        match compression_type {
            0 => "deflate".to_string(),
            1 => "zstd".to_string(),
            n => format!("unknown-{n}"),
        }
    }
}

/// Factory producing a streaming decoder over a compressed byte stream.
pub type Decompressor = for<'a> fn(Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>>;

/// Registered decompressors, keyed by compression type byte.
static DECOMPRESSORS: OnceLock<RwLock<HashMap<u8, Decompressor>>> = OnceLock::new();

/// The process-wide decompressor registry, with the built-in codecs
/// registered.
fn registry() -> &'static RwLock<HashMap<u8, Decompressor>> {
    DECOMPRESSORS.get_or_init(|| {
        let mut map: HashMap<u8, Decompressor> = HashMap::new();
        map.insert(CompressionType::Deflate as u8, deflate_decoder);
        #[cfg(feature = "zstd")]
        map.insert(CompressionType::Zstd as u8, zstd_decoder);
        RwLock::new(map)
    })
}

/// Register a custom decompressor for a compression type byte.
///
/// Replaces any existing registration.  Images opened afterwards (and
/// compressed reads on already-open images) use the new decompressor.
pub fn set_decompressor(compression_type: u8, decompressor: Decompressor) {
    registry()
        .write()
        .unwrap()
        .insert(compression_type, decompressor);
}

/// Look up the decompressor for a compression type byte.
pub(crate) fn decompressor_for(compression_type: u8) -> Option<Decompressor> {
    registry().read().unwrap().get(&compression_type).copied()
}

/// Raw DEFLATE decoder (compression type 0).
fn deflate_decoder<'a>(reader: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
    Ok(Box::new(DeflateDecoder::new(reader)))
}

/// Zstandard decoder (compression type 1).
#[cfg(feature = "zstd")]
fn zstd_decoder<'a>(reader: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
    Ok(Box::new(zstd::stream::read::Decoder::new(reader)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builtin_codecs_are_registered() {
        assert!(decompressor_for(CompressionType::Deflate as u8).is_some());
        #[cfg(feature = "zstd")]
        assert!(decompressor_for(CompressionType::Zstd as u8).is_some());
        assert!(decompressor_for(200).is_none());
    }

    #[test]
    fn deflate_round_trip() {
        let payload = b"qcow2 compressed cluster payload".repeat(64);
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&payload).unwrap();
        let compressed = encoder.finish().unwrap();

        let decompress = decompressor_for(0).unwrap();
        let mut decoder = decompress(Box::new(&compressed[..])).unwrap();
        let mut output = Vec::new();
        decoder.read_to_end(&mut output).unwrap();
        assert_eq!(output, payload);
    }

    #[test]
    fn custom_decompressor_can_be_installed() {
        fn passthrough<'a>(reader: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
            Ok(reader)
        }

        set_decompressor(201, passthrough);
        assert!(decompressor_for(201).is_some());
    }
}
