//! Parallel sparseness-preserving image conversion.
//!
//! Copies a full image out to a flat destination (e.g. a raw file) with
//! multiple worker threads.  The virtual address space is split into
//! segments; each worker claims the next unprocessed segment, walks the
//! source's extents within it, skips zero extents entirely, and streams
//! the rest through a buffer.  Buffers that turn out to be all zeros are
//! not written either, producing holes in the destination if the target
//! file system supports them.  The destination must therefore start out
//! as a new empty (or fully zeroed) file.

use crate::error::{Error, Result};
use crate::format::Image;
use std::io;
use std::sync::Mutex;
use std::{cmp, thread};

/// Default size of the per-worker copy buffer.
///
/// For best performance, the size should be aligned to the image cluster
/// size or the file system block size.
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Default segment size.
///
/// Smaller values increase the overhead of synchronizing workers; larger
/// values are less effective for small images.  Must be a multiple of the
/// buffer size.
pub const SEGMENT_SIZE: u64 = 32 * BUFFER_SIZE as u64;

/// Default number of worker threads.
///
/// For best I/O throughput we want enough in-flight requests regardless
/// of core count; for decompression-heavy images more workers stop
/// helping quickly.
pub const WORKERS: usize = 8;

/// Positional write access to a conversion destination.
///
/// Implementations must be safe for concurrent use: workers write
/// disjoint ranges from multiple threads.
pub trait WriteAt: Send + Sync {
    /// Write `buf` at `offset`, returning how many bytes were written.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Write all of `buf` at `offset`.
    fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write_at(&buf[written..], offset + written as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            written += n;
        }
        Ok(())
    }
}

#[cfg(unix)]
impl WriteAt for std::fs::File {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }
}

#[cfg(windows)]
impl WriteAt for std::fs::File {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_write(self, buf, offset)
    }
}

/// Tracks conversion progress.
pub trait Updater: Send + Sync {
    /// Called after a byte range of length `n` was converted.  Invoked
    /// from multiple worker threads; if the conversion succeeds, the
    /// lengths sum up to the image's virtual size.
    fn update(&self, n: u64);
}

impl<F: Fn(u64) + Send + Sync> Updater for F {
    fn update(&self, n: u64) {
        self(n)
    }
}

/// Conversion tuning knobs.
#[derive(Clone, Debug)]
pub struct ConvertOptions {
    /// Segment size in bytes.  Must be a positive multiple of
    /// `buffer_size`.
    pub segment_size: u64,

    /// Per-worker buffer size in bytes.
    pub buffer_size: usize,

    /// Number of worker threads.
    pub workers: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        ConvertOptions {
            segment_size: SEGMENT_SIZE,
            buffer_size: BUFFER_SIZE,
            workers: WORKERS,
        }
    }
}

impl ConvertOptions {
    /// Validate option values.
    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(invalid_option("buffer size must be positive"));
        }
        if self.segment_size == 0 {
            return Err(invalid_option("segment size must be positive"));
        }
        if self.workers == 0 {
            return Err(invalid_option("number of workers must be positive"));
        }
        // Not strictly required, but there is no reason to support
        // unaligned segment sizes.
        if self.segment_size % self.buffer_size as u64 != 0 {
            return Err(invalid_option("segment size not aligned to buffer size"));
        }
        Ok(())
    }
}

/// Build an option validation error.
fn invalid_option(message: &str) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidInput, message))
}

/// Shared worker state.
struct CopyState {
    /// Next unclaimed offset.
    offset: u64,

    /// First error reported by any worker.
    err: Option<Error>,
}

/// Copies images to flat destinations; see the module documentation.
#[derive(Clone, Debug)]
pub struct Converter {
    /// Segment size in bytes.
    segment_size: u64,

    /// Per-worker buffer size in bytes.
    buffer_size: usize,

    /// Number of worker threads.
    workers: usize,
}

impl Default for Converter {
    fn default() -> Self {
        // The default options always validate.
        Converter::new(ConvertOptions::default()).unwrap()
    }
}

impl Converter {
    /// Create a converter from the given options.
    pub fn new(options: ConvertOptions) -> Result<Self> {
        options.validate()?;
        Ok(Converter {
            segment_size: options.segment_size,
            buffer_size: options.buffer_size,
            workers: options.workers,
        })
    }

    /// Copy `size` bytes from `image` to `dest`.
    ///
    /// Zero extents of the source, and read buffers that turn out to be
    /// all zeros, are skipped rather than written.  The first error wins:
    /// it stops all workers and is returned once they have joined.
    pub fn convert(
        &self,
        dest: &dyn WriteAt,
        image: &dyn Image,
        size: u64,
        progress: Option<&dyn Updater>,
    ) -> Result<()> {
        let state = Mutex::new(CopyState {
            offset: 0,
            err: None,
        });
        let zero = vec![0u8; self.buffer_size];

        thread::scope(|scope| {
            for _ in 0..self.workers {
                let state = &state;
                let zero = zero.as_slice();
                scope.spawn(move || self.copy_segments(state, zero, dest, image, size, progress));
            }
        });

        let state = state.into_inner().unwrap_or_else(|poison| poison.into_inner());
        match state.err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Worker loop: claim segments and copy them until done or stopped.
    fn copy_segments(
        &self,
        state: &Mutex<CopyState>,
        zero: &[u8],
        dest: &dyn WriteAt,
        image: &dyn Image,
        size: u64,
        progress: Option<&dyn Updater>,
    ) {
        let mut buf = vec![0u8; self.buffer_size];

        while let Some((mut start, end)) = self.next_segment(state, size) {
            while start < end {
                // Get the next extent in this segment.
                let extent = match image.extent(start, end - start) {
                    Ok(extent) => extent,
                    Err(e) => return set_error(state, e),
                };

                if extent.zero {
                    start += extent.length;
                    if let Some(progress) = progress {
                        progress.update(extent.length);
                    }
                    continue;
                }

                // Consume data from this extent.
                let mut remaining = extent.length;
                while remaining > 0 {
                    let chunk = cmp::min(remaining, buf.len() as u64) as usize;
                    let n = match image.read_at(&mut buf[..chunk], start) {
                        Ok(n) => n,
                        Err(e) => return set_error(state, e),
                    };
                    // We ask for exactly `size` bytes in total, so a
                    // zero-length read means the image lied to us.
                    if n == 0 {
                        return set_error(
                            state,
                            Error::Io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "unexpected end of image",
                            )),
                        );
                    }

                    // Skip buffers of pure zeros to create holes.
                    if buf[..n] != zero[..n] {
                        if let Err(e) = dest.write_all_at(&buf[..n], start) {
                            return set_error(state, Error::Io(e));
                        }
                    }

                    if let Some(progress) = progress {
                        progress.update(n as u64);
                    }
                    remaining -= n as u64;
                    start += n as u64;
                }
            }
        }
    }

    /// Claim the next segment, or `None` when there is no more work or
    /// another worker has failed.
    fn next_segment(&self, state: &Mutex<CopyState>, size: u64) -> Option<(u64, u64)> {
        let mut state = state.lock().unwrap();
        if state.err.is_some() || state.offset == size {
            return None;
        }
        let start = state.offset;
        state.offset = cmp::min(state.offset + self.segment_size, size);
        Some((start, state.offset))
    }
}

/// Keep the first error; it signals the other workers to stop.
fn set_error(state: &Mutex<CopyState>, err: Error) {
    let mut state = state.lock().unwrap();
    if state.err.is_none() {
        state.err = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_validate() {
        Converter::new(ConvertOptions::default()).unwrap();
    }

    #[test]
    fn rejects_invalid_options() {
        for options in [
            ConvertOptions {
                buffer_size: 0,
                ..Default::default()
            },
            ConvertOptions {
                segment_size: 0,
                ..Default::default()
            },
            ConvertOptions {
                workers: 0,
                ..Default::default()
            },
            ConvertOptions {
                segment_size: BUFFER_SIZE as u64 + 1,
                ..Default::default()
            },
        ] {
            assert!(Converter::new(options).is_err());
        }
    }
}
