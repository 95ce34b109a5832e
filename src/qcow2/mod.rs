//! Qcow2 implementation.
//!
//! Provides random read access to qcow2 images (v2 and v3): two-level
//! cluster address translation with an LRU cache over L2 tables,
//! standard / compressed / all-zero cluster interpretation, optional
//! extended-L2 sub-cluster bitmaps, and transparent composition with a
//! backing image in any supported format.

pub mod compressed;
pub(crate) mod metadata;
mod types;

pub use metadata::{FeatureNameTableEntry, HeaderExtension};

use crate::error::{Context, Error, Result};
use crate::format::probe::{open_image_at_depth, open_with_format_at_depth};
use crate::format::{Extent, Image, ImageFormat};
use crate::lru_cache::LruCache;
use crate::storage::{FileStorage, SectionReader, Storage};
use compressed::{CompressionType, Decompressor};
use metadata::Header;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::{cmp, fs};
use tracing::{debug, trace, warn};
use types::*;

/// Number of L2 tables kept in the cache.
///
/// With the default 64 KiB cluster size this uses about 1 MiB and covers
/// 8 GiB of virtual space.
const L2_CACHE_SIZE: usize = 16;

/// Number of sub-clusters per cluster with extended L2 entries.
const SUBCLUSTERS: usize = 32;

/// Longest backing file chain we are willing to follow.
const MAX_BACKING_DEPTH: u32 = 32;

/// Access qcow2 images.
///
/// Created by [`Qcow2::open_image`] or [`Qcow2::open_path`]; immutable
/// afterwards except for internal caches.  Whether the image is within
/// the supported subset is determined at open time and cached; see
/// [`Image::readable`].
pub struct Qcow2 {
    /// Image file.
    storage: Box<dyn Storage>,

    /// Parsed image header.
    header: Header,

    /// Parsed header extensions.
    extensions: Vec<HeaderExtension>,

    /// Why the image cannot be read, if it cannot.  Determined once at
    /// open time; surfaced by every data access.
    unreadable: Option<Error>,

    /// Cluster size in bytes (`1 << cluster_bits`).
    cluster_size: u64,

    /// Number of entries per L2 table.
    l2_entries: usize,

    /// The L1 table.
    l1_table: Box<[L1Entry]>,

    /// L2 table cache, keyed by the raw L1 entry.
    l2_cache: LruCache<u64, [L2Entry]>,

    /// Decoder factory for the image's compression type.
    decompressor: Option<Decompressor>,

    /// Backing file name as recorded in the header.
    backing_file: Option<String>,

    /// Backing file format name, from the header extension.
    backing_format: Option<String>,

    /// Backing image; unallocated clusters read from it.
    backing: Option<Box<dyn Image>>,
}

impl Qcow2 {
    /// Open a qcow2 image over the given storage object.
    ///
    /// Parsing a storage object that is not qcow2 at all fails with
    /// [`Error::WrongFormat`].  Images that are qcow2 but fall outside
    /// the supported subset open successfully with the failure cached;
    /// it is reported by [`Image::readable`] and by every data access.
    pub fn open_image(storage: Box<dyn Storage>) -> Result<Self> {
        Self::open_image_at_depth(storage, 0)
    }

    /// Open the qcow2 image at the given path.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let storage = FileStorage::open(path)?;
        Self::open_image(Box::new(storage))
    }

    /// [`Qcow2::open_image`] with the current backing chain depth.
    pub(crate) fn open_image_at_depth(storage: Box<dyn Storage>, depth: u32) -> Result<Self> {
        let header = Header::load(storage.as_ref())?;

        let mut image = Qcow2 {
            storage,
            header,
            extensions: Vec::new(),
            unreadable: None,
            cluster_size: 0,
            l2_entries: 0,
            l1_table: Box::new([]),
            l2_cache: LruCache::new(L2_CACHE_SIZE),
            decompressor: None,
            backing_file: None,
            backing_format: None,
            backing: None,
        };

        image.unreadable = image.header.readable().err();
        if image.unreadable.is_some() {
            return Ok(image);
        }

        image.cluster_size = image.header.cluster_size();
        debug!(
            size = image.header.size(),
            cluster_bits = image.header.cluster_bits(),
            version = image.header.version(),
            compatible_features = image.header.compatible_features(),
            autoclear_features = image.header.autoclear_features(),
            refcount_order = image.header.refcount_order(),
            refcount_table_offset = image.header.refcount_table_offset(),
            refcount_table_clusters = image.header.refcount_table_clusters(),
            snapshots = image.header.nb_snapshots(),
            snapshots_offset = image.header.snapshots_offset(),
            "opened qcow2 header"
        );

        match metadata::read_extensions(image.storage.as_ref(), &image.header) {
            Ok(extensions) => image.extensions = extensions,
            Err(e) => warn!("failed to read header extensions: {e}"),
        }
        image.backing_format = image.extensions.iter().find_map(|extension| match extension {
            HeaderExtension::BackingFileFormat(format) => Some(format.clone()),
            _ => None,
        });

        image.l2_entries = if image.header.extended_l2() {
            (image.cluster_size / 16) as usize
        } else {
            (image.cluster_size / 8) as usize
        };

        image.l1_table = image.load_l1_table()?;

        // readable() has verified a decompressor is registered.
        image.decompressor = compressed::decompressor_for(image.header.compression_type());

        if let Err(e) = image.open_backing(depth) {
            image.unreadable = Some(e);
        }

        Ok(image)
    }

    /// Cluster size of this image in bytes.
    pub fn cluster_size(&self) -> u64 {
        self.cluster_size
    }

    /// The image's compression type byte.
    pub fn compression_type(&self) -> u8 {
        self.header.compression_type()
    }

    /// Backing file name recorded in the image header, if any.
    pub fn backing_file(&self) -> Option<&str> {
        self.backing_file.as_deref()
    }

    /// Backing file format name recorded in the image header, if any.
    pub fn backing_format(&self) -> Option<&str> {
        self.backing_format.as_deref()
    }

    /// The parsed header extensions, in on-disk order.
    pub fn header_extensions(&self) -> &[HeaderExtension] {
        &self.extensions
    }

    /// Number of internal snapshots recorded in the image.
    ///
    /// Snapshots are not traversed; this is informational only.
    pub fn snapshot_count(&self) -> u32 {
        self.header.nb_snapshots()
    }

    /// Whether the image uses extended L2 entries.
    fn extended_l2(&self) -> bool {
        self.header.extended_l2()
    }

    /// Load the L1 table from disk.
    fn load_l1_table(&self) -> Result<Box<[L1Entry]>> {
        let offset = self.header.l1_table_offset();
        let entries = self.header.l1_entries();
        if offset == 0 {
            return Err(Error::Malformed("invalid L1 table offset: 0".to_string()));
        }
        if entries == 0 {
            return Err(Error::Malformed("invalid L1 table size: 0".to_string()));
        }

        let mut buf = vec![0u8; entries as usize * 8];
        self.storage
            .read_exact_at(&mut buf, offset)
            .map_err(Error::Io)
            .context_with(|| "failed to read the L1 table")?;

        Ok(buf
            .chunks_exact(8)
            .map(|raw| L1Entry(u64::from_be_bytes(raw.try_into().unwrap())))
            .collect())
    }

    /// Open the backing image recorded in the header, if any.
    fn open_backing(&mut self, depth: u32) -> Result<()> {
        if self.header.backing_file_offset() == 0 {
            return Ok(());
        }
        if !self.header.backing_name_len_valid() {
            return Err(Error::Malformed(format!(
                "backing file name too long ({} bytes)",
                self.header.backing_file_size()
            )));
        }
        if depth + 1 >= MAX_BACKING_DEPTH {
            return Err(Error::UnsupportedBackingFile(format!(
                "backing file chain deeper than {MAX_BACKING_DEPTH}"
            )));
        }

        let mut name = vec![0u8; self.header.backing_file_size() as usize];
        self.storage
            .read_exact_at(&mut name, self.header.backing_file_offset())
            .map_err(Error::Io)
            .context_with(|| "failed to read the backing file name")?;
        let name = String::from_utf8(name).map_err(|e| {
            Error::UnsupportedBackingFile(format!("backing file name is not valid UTF-8: {e}"))
        })?;
        self.backing_file = Some(name.clone());

        let path = self
            .storage
            .resolve_relative_path(Path::new(&name))
            .map_err(|e| {
                Error::UnsupportedBackingFile(format!(
                    "failed to resolve the path of {name:?}: {e}"
                ))
            })?;
        let path = fs::canonicalize(&path).unwrap_or(path);

        let file = FileStorage::open(&path)
            .map_err(|e| Error::UnsupportedBackingFile(format!("file {path:?}: {e}")))?;

        let backing = match &self.backing_format {
            Some(format_name) => {
                let format = ImageFormat::from_name(format_name).ok_or_else(|| {
                    Error::UnsupportedBackingFile(format!(
                        "unknown backing format {format_name:?}"
                    ))
                })?;
                open_with_format_at_depth(Box::new(file), format, depth + 1)
            }
            None => open_image_at_depth(Box::new(file), depth + 1),
        }
        .context_with(|| format!("backing file {path:?}"))?;

        self.backing = Some(backing);
        Ok(())
    }

    /// Get the L2 table referenced by the given L1 entry, reading through
    /// the cache.
    fn l2_table(&self, l1_entry: L1Entry, l2_offset: u64) -> Result<Arc<[L2Entry]>> {
        if let Some(table) = self.l2_cache.get(&l1_entry.raw()) {
            return Ok(table);
        }

        trace!(l2_offset, "loading L2 table");
        let mut buf = vec![0u8; self.cluster_size as usize];
        self.storage
            .read_exact_at(&mut buf, l2_offset)
            .map_err(Error::Io)
            .context_with(|| format!("failed to read the L2 table at {l2_offset:#x}"))?;

        let table: Arc<[L2Entry]> = buf
            .chunks_exact(8)
            .map(|raw| L2Entry(u64::from_be_bytes(raw.try_into().unwrap())))
            .collect::<Vec<_>>()
            .into();
        self.l2_cache.insert(l1_entry.raw(), Arc::clone(&table));
        Ok(table)
    }

    /// Read a single 16-byte extended L2 entry.
    fn read_ext_l2_entry(&self, l2_offset: u64, l2_index: usize) -> Result<ExtL2Entry> {
        let mut raw = [0u8; 16];
        let entry_offset = l2_offset + 16 * l2_index as u64;
        self.storage
            .read_exact_at(&mut raw, entry_offset)
            .map_err(Error::Io)
            .context_with(|| format!("failed to read the extended L2 entry at {entry_offset:#x}"))?;
        Ok(ExtL2Entry::from_bytes(raw))
    }

    /// Translate the cluster containing virtual offset `offset`.
    fn cluster_meta(&self, offset: u64) -> Result<ClusterMeta> {
        let cluster_no = offset / self.cluster_size;
        let l1_index = (cluster_no / self.l2_entries as u64) as usize;
        if l1_index >= self.l1_table.len() {
            return Err(Error::Malformed(format!(
                "L1 index {l1_index} for virtual offset {offset:#x} exceeds the L1 table length {}",
                self.l1_table.len()
            )));
        }
        let l1_entry = self.l1_table[l1_index];

        let mut meta = ClusterMeta {
            l1_index,
            l1_entry,
            l2_index: 0,
            l2_entry: L2Entry(0),
            ext_l2: None,
            allocated: false,
            compressed: false,
            zero: false,
        };

        let Some(l2_offset) = l1_entry.l2_offset() else {
            // The whole L2 table is unallocated.
            return Ok(meta);
        };

        meta.l2_index = (cluster_no % self.l2_entries as u64) as usize;

        if self.extended_l2() {
            let ext_l2 = self
                .read_ext_l2_entry(l2_offset, meta.l2_index)
                .context_with(|| {
                    format!(
                        "L1 entry {:#x} (index {l1_index})",
                        l1_entry.raw()
                    )
                })?;
            meta.l2_entry = ext_l2.entry;
            meta.ext_l2 = Some(ext_l2);
        } else {
            let l2_table = self.l2_table(l1_entry, l2_offset).context_with(|| {
                format!("L1 entry {:#x} (index {l1_index})", l1_entry.raw())
            })?;
            meta.l2_entry = l2_table[meta.l2_index];
        }

        let descriptor = meta.l2_entry.descriptor();
        if descriptor == 0 && meta.ext_l2.is_none() {
            return Ok(meta);
        }

        meta.allocated = true;
        if meta.l2_entry.is_compressed() {
            meta.compressed = true;
        } else {
            // With extended L2 entries this flag is always clear; the
            // sub-cluster bitmaps decide instead.
            meta.zero = StandardDescriptor(descriptor).reads_as_zero();
        }

        Ok(meta)
    }

    /// Read one cluster-confined slice.
    ///
    /// `p` must lie within a single cluster, and within the virtual disk
    /// size; the slice is filled completely.
    fn read_at_aligned(&self, p: &mut [u8], offset: u64) -> Result<()> {
        let meta = self.cluster_meta(offset)?;
        if !meta.allocated {
            return self.read_unallocated(p, offset);
        }

        let len = p.len();
        let descriptor = meta.l2_entry.descriptor();
        let result = if meta.compressed {
            self.read_compressed(p, offset, CompressedDescriptor(descriptor))
                .context_with(|| "failed to read compressed cluster")
        } else if let Some(ext_l2) = meta.ext_l2 {
            self.read_standard_ext_l2(p, offset, StandardDescriptor(descriptor), ext_l2)
                .context_with(|| "failed to read standard cluster with extended L2")
        } else {
            self.read_standard(p, offset, StandardDescriptor(descriptor))
                .context_with(|| "failed to read standard cluster")
        };

        result.context_with(|| {
            format!(
                "len={len}, off={offset:#x}, desc={descriptor:#x}, L1 entry {:#x} (index {}), L2 index {}",
                meta.l1_entry.raw(),
                meta.l1_index,
                meta.l2_index,
            )
        })
    }

    /// Read a slice of a cluster that is not allocated in this image.
    ///
    /// Delegates to the backing image when one is attached.  The backing
    /// image may be shorter than this image; whatever it cannot provide
    /// reads as zeros.
    fn read_unallocated(&self, p: &mut [u8], offset: u64) -> Result<()> {
        let Some(backing) = &self.backing else {
            p.fill(0);
            return Ok(());
        };
        let n = backing.read_at(p, offset)?;
        p[n..].fill(0);
        Ok(())
    }

    /// Read a slice of a standard (uncompressed) cluster.
    fn read_standard(&self, p: &mut [u8], offset: u64, desc: StandardDescriptor) -> Result<()> {
        if desc.reads_as_zero() {
            p.fill(0);
            return Ok(());
        }

        let raw_offset = desc.host_offset() + offset % self.cluster_size;
        if raw_offset == 0 {
            // No valid host cluster sits at byte 0 (the header does).
            return Err(Error::Malformed(format!(
                "invalid raw offset 0 for virtual offset {offset:#x}"
            )));
        }
        self.storage
            .read_exact_at(p, raw_offset)
            .map_err(Error::Io)
            .context_with(|| format!("failed to read {} bytes from the raw offset {raw_offset:#x}", p.len()))
    }

    /// Read a slice of a standard cluster with extended L2 sub-cluster
    /// bitmaps, dispatching per sub-cluster.
    fn read_standard_ext_l2(
        &self,
        p: &mut [u8],
        offset: u64,
        desc: StandardDescriptor,
        ext_l2: ExtL2Entry,
    ) -> Result<()> {
        let subcluster_size = (self.cluster_size as usize) / SUBCLUSTERS;
        let in_cluster = (offset % self.cluster_size) as usize;
        let mut subcluster = in_cluster / subcluster_size;
        let mut done = 0;

        while done < p.len() && subcluster < SUBCLUSTERS {
            let current_offset = offset + done as u64;
            let current_in_cluster = in_cluster + done;
            let subcluster_end = (subcluster + 1) * subcluster_size;
            let chunk_len = cmp::min(p.len() - done, subcluster_end - current_in_cluster);
            let chunk = &mut p[done..done + chunk_len];

            if ext_l2.subcluster_allocated(subcluster) {
                let raw_offset = desc.host_offset() + current_in_cluster as u64;
                self.storage
                    .read_exact_at(chunk, raw_offset)
                    .map_err(Error::Io)
                    .context_with(|| {
                        format!("failed to read from the raw offset {raw_offset:#x}")
                    })?;
            } else if ext_l2.subcluster_reads_zero(subcluster) {
                chunk.fill(0);
            } else {
                self.read_unallocated(chunk, current_offset)?;
            }

            done += chunk_len;
            subcluster += 1;
        }

        Ok(())
    }

    /// Read a slice of a compressed cluster.
    ///
    /// Opens a streaming decoder over the compressed host region,
    /// discards up to the requested in-cluster offset, and fills `p`.
    fn read_compressed(
        &self,
        p: &mut [u8],
        offset: u64,
        desc: CompressedDescriptor,
    ) -> Result<()> {
        let cluster_bits = self.header.cluster_bits();
        let host_offset = desc.host_offset(cluster_bits);
        if host_offset == 0 {
            return Err(Error::Malformed(format!(
                "invalid host cluster offset 0 for virtual offset {offset:#x}"
            )));
        }

        let decompress = self.decompressor.ok_or_else(|| {
            Error::UnsupportedCompression(CompressionType::name(self.header.compression_type()))
        })?;

        let section = SectionReader::new(
            self.storage.as_ref(),
            host_offset,
            desc.compressed_size(cluster_bits),
        );
        let mut decoder = decompress(Box::new(section))
            .map_err(|e| Error::Io(e).context("could not open the decompressor"))?;

        let discard = offset % self.cluster_size;
        if discard > 0 {
            let skipped = io::copy(&mut (&mut decoder).take(discard), &mut io::sink())?;
            if skipped < discard {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "compressed stream ended before the requested offset",
                )));
            }
        }
        decoder.read_exact(p)?;
        Ok(())
    }

    /// Return an extent describing the single cluster at `offset`, which
    /// must be aligned to cluster size.
    ///
    /// Unallocated clusters covered by the backing image take their
    /// status from it, re-framed to this image's cluster grain.
    fn cluster_status(&self, offset: u64) -> Result<Extent> {
        let meta = self.cluster_meta(offset)?;

        if !meta.allocated {
            if let Some(backing) = &self.backing {
                if offset < backing.size() {
                    let length = cmp::min(self.cluster_size, backing.size() - offset);
                    let mut parent = backing.extent(offset, length)?;
                    // The backing image may be a raw image not aligned to
                    // this image's cluster size.
                    parent.length = self.cluster_size;
                    return Ok(parent);
                }
            }
            // Unallocated clusters read as zeros.
            return Ok(Extent {
                start: offset,
                length: self.cluster_size,
                allocated: false,
                zero: true,
                compressed: false,
            });
        }

        Ok(Extent {
            start: offset,
            length: self.cluster_size,
            allocated: true,
            zero: meta.zero,
            compressed: meta.compressed,
        })
    }
}

impl Image for Qcow2 {
    fn format(&self) -> ImageFormat {
        ImageFormat::Qcow2
    }

    fn size(&self) -> u64 {
        self.header.size()
    }

    fn readable(&self) -> Result<()> {
        match &self.unreadable {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.readable()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let size = self.header.size();
        if offset >= size {
            return Ok(0);
        }
        let len = cmp::min(buf.len() as u64, size - offset) as usize;
        let buf = &mut buf[..len];

        let mut done = 0;
        while done < len {
            let position = offset + done as u64;
            let in_cluster = (position % self.cluster_size) as usize;
            let chunk = cmp::min(len - done, self.cluster_size as usize - in_cluster);
            self.read_at_aligned(&mut buf[done..done + chunk], position)?;
            done += chunk;
        }

        Ok(len)
    }

    fn extent(&self, start: u64, length: u64) -> Result<Extent> {
        self.readable()?;

        let size = self.header.size();
        if start.checked_add(length).map_or(true, |end| end > size) {
            return Err(Error::Malformed(format!(
                "extent query [{start}, +{length}) out of bounds (size {size})"
            )));
        }

        let end = start + length;
        let mut cluster_start = start - start % self.cluster_size;
        let mut current: Option<Extent> = None;

        while cluster_start < end {
            let mut status = self.cluster_status(cluster_start)?;

            // First cluster: clip the start up to the queried start.
            if status.start < start {
                status.length -= start - status.start;
                status.start = start;
            }
            // Last cluster: clip the end down to the queried end.
            if status.start + status.length > end {
                status.length = end - status.start;
            }

            match &mut current {
                None => current = Some(status),
                Some(current) if current.same_status(&status) => {
                    current.length += status.length;
                }
                Some(_) => break,
            }

            cluster_start += self.cluster_size;
        }

        Ok(current.unwrap_or(Extent {
            start,
            ..Extent::default()
        }))
    }
}

impl Debug for Qcow2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qcow2")
            .field("storage", &self.storage)
            .field("header", &self.header)
            .field("unreadable", &self.unreadable)
            .field("backing_file", &self.backing_file)
            .field("backing_format", &self.backing_format)
            .field("backing", &self.backing)
            .finish_non_exhaustive()
    }
}

impl Display for Qcow2 {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "qcow2[{}]", self.storage)
    }
}
