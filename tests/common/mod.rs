//! Shared test fixtures: synthesized qcow2 images.
#![allow(dead_code)]

use qcow2_reader::MemStorage;
use std::io::Write;

/// All fixtures use the common 64 KiB cluster size.
pub const CLUSTER_BITS: u32 = 16;
pub const CLUSTER_SIZE: u64 = 1 << CLUSTER_BITS;

const OFLAG_COPIED: u64 = 1 << 63;
const OFLAG_COMPRESSED: u64 = 1 << 62;
const INCOMPATIBLE_COMPRESSION_TYPE: u64 = 1 << 3;

/// What to place in one virtual cluster.
pub enum Cluster {
    /// Standard cluster holding these bytes (zero-padded to cluster
    /// size).
    Data(Vec<u8>),

    /// Explicit all-zero cluster (standard descriptor bit 0).
    Zero,

    /// Cluster stored deflate-compressed.
    Deflate(Vec<u8>),

    /// Cluster stored zstd-compressed.
    Zstd(Vec<u8>),
}

/// Builds qcow2 v3 images in memory.
pub struct ImageBuilder {
    pub size: u64,
    pub crypt_method: u32,
    pub compression_type: Option<u8>,
    pub backing_file: Option<String>,
    pub backing_format: Option<String>,
    pub clusters: Vec<(u64, Cluster)>,
}

impl Default for ImageBuilder {
    fn default() -> Self {
        ImageBuilder {
            size: 0,
            crypt_method: 0,
            compression_type: None,
            backing_file: None,
            backing_format: None,
            clusters: Vec::new(),
        }
    }
}

pub fn write_be_u32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

pub fn write_be_u64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}

/// Grow `file` as needed and copy `data` to `offset`.
fn put(file: &mut Vec<u8>, offset: u64, data: &[u8]) {
    let end = offset as usize + data.len();
    if file.len() < end {
        file.resize(end, 0);
    }
    file[offset as usize..end].copy_from_slice(data);
}

/// Deterministic test payload.
pub fn pattern(len: usize, seed: u64) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(31).wrapping_add(seed) % 251) as u8)
        .collect()
}

impl ImageBuilder {
    pub fn build(self) -> Vec<u8> {
        let cs = CLUSTER_SIZE;
        let l2_entries = cs / 8;

        let l1_entries = std::cmp::max(1, self.size.div_ceil(cs * l2_entries));
        assert!(l1_entries * 8 <= cs, "fixture needs a multi-cluster L1");

        let has_additional = self.compression_type.is_some();
        let header_length: u32 = if has_additional { 112 } else { 104 };

        let mut incompatible_features = 0u64;
        if self.compression_type.map_or(false, |t| t != 0) {
            incompatible_features |= INCOMPATIBLE_COMPRESSION_TYPE;
        }

        // Cluster 0: header, cluster 1: L1 table, then one L2 table per
        // touched L1 slot, then data clusters.
        let l1_table_offset = cs;
        let mut l1_slots: Vec<u64> = self
            .clusters
            .iter()
            .map(|(index, _)| index / l2_entries)
            .collect();
        l1_slots.sort_unstable();
        l1_slots.dedup();

        let mut next_cluster = 2u64;
        let l2_offsets: Vec<(u64, u64)> = l1_slots
            .iter()
            .map(|slot| {
                let offset = next_cluster * cs;
                next_cluster += 1;
                (*slot, offset)
            })
            .collect();

        let mut file = vec![0u8; (next_cluster * cs) as usize];

        // Header.
        let mut header = vec![0u8; header_length as usize];
        header[0..4].copy_from_slice(b"QFI\xfb");
        write_be_u32(&mut header, 4, 3); // version
        write_be_u32(&mut header, 20, CLUSTER_BITS);
        write_be_u64(&mut header, 24, self.size);
        write_be_u32(&mut header, 32, self.crypt_method);
        write_be_u32(&mut header, 36, l1_entries as u32);
        write_be_u64(&mut header, 40, l1_table_offset);
        write_be_u64(&mut header, 48, cs); // refcount table offset (unused)
        write_be_u32(&mut header, 56, 1); // refcount_table_clusters
        write_be_u64(&mut header, 72, incompatible_features);
        write_be_u32(&mut header, 96, 4); // refcount_order
        write_be_u32(&mut header, 100, header_length);
        if let Some(compression_type) = self.compression_type {
            header[104] = compression_type;
        }
        put(&mut file, 0, &header);

        // Header extensions, then the backing file name.
        let mut offset = header_length as u64;
        if let Some(backing_format) = &self.backing_format {
            let mut record = Vec::new();
            record.extend_from_slice(&0xe279_2acau32.to_be_bytes());
            record.extend_from_slice(&(backing_format.len() as u32).to_be_bytes());
            record.extend_from_slice(backing_format.as_bytes());
            while record.len() % 8 != 0 {
                record.push(0);
            }
            put(&mut file, offset, &record);
            offset += record.len() as u64;
        }
        put(&mut file, offset, &[0u8; 8]); // end marker
        offset += 8;
        if let Some(backing_file) = &self.backing_file {
            put(&mut file, offset, backing_file.as_bytes());
            write_be_u64(&mut file, 8, offset);
            write_be_u32(&mut file, 16, backing_file.len() as u32);
        }

        // L2 tables and cluster payloads.
        for (cluster_index, cluster) in &self.clusters {
            let l1_slot = cluster_index / l2_entries;
            let l2_index = cluster_index % l2_entries;
            let l2_offset = l2_offsets
                .iter()
                .find(|(slot, _)| *slot == l1_slot)
                .unwrap()
                .1;

            let entry = match cluster {
                Cluster::Data(data) => {
                    assert!(data.len() as u64 <= cs);
                    let host = (file.len() as u64).next_multiple_of(cs);
                    file.resize((host + cs) as usize, 0);
                    put(&mut file, host, data);
                    host | OFLAG_COPIED
                }
                Cluster::Zero => 1,
                Cluster::Deflate(data) => {
                    let mut encoder = flate2::write::DeflateEncoder::new(
                        Vec::new(),
                        flate2::Compression::default(),
                    );
                    encoder.write_all(data).unwrap();
                    compressed_entry(&mut file, &encoder.finish().unwrap())
                }
                Cluster::Zstd(data) => {
                    compressed_entry(&mut file, &zstd::encode_all(&data[..], 3).unwrap())
                }
            };

            let mut raw = [0u8; 8];
            write_be_u64(&mut raw, 0, entry);
            put(&mut file, l2_offset + 8 * l2_index, &raw);
        }

        // L1 entries for the touched slots.
        for (slot, l2_offset) in &l2_offsets {
            let mut raw = [0u8; 8];
            write_be_u64(&mut raw, 0, l2_offset | OFLAG_COPIED);
            put(&mut file, l1_table_offset + 8 * slot, &raw);
        }

        file
    }

    pub fn build_mem(self) -> MemStorage {
        MemStorage::new(self.build())
    }
}

/// Append a compressed stream (512-byte aligned) and return its L2
/// entry.
fn compressed_entry(file: &mut Vec<u8>, compressed: &[u8]) -> u64 {
    let host = (file.len() as u64).next_multiple_of(512);
    put(file, host, compressed);

    // x = 62 - (cluster_bits - 8) offset bits; the additional sector
    // count excludes the sector containing the start offset.
    let x = 62 - (CLUSTER_BITS - 8);
    let sectors = (compressed.len() as u64 - 1 + (host & 511)) / 512;
    OFLAG_COMPRESSED | (sectors << x) | host
}
