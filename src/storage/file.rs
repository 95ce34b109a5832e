//! Use a plain file as storage.

use crate::storage::Storage;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Use a plain file as a storage object.
///
/// Reads are positional (`pread`-style) and keep no seek state, so a
/// `FileStorage` can be shared between threads.
#[derive(Debug)]
pub struct FileStorage {
    /// The file.
    file: fs::File,

    /// For debug purposes, and to resolve relative filenames.
    filename: Option<PathBuf>,
}

impl FileStorage {
    /// Open the file at `path` read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        Ok(FileStorage {
            file,
            filename: Some(path.to_path_buf()),
        })
    }
}

impl TryFrom<fs::File> for FileStorage {
    type Error = io::Error;

    /// Use the given existing `std::fs::File`.
    ///
    /// The resulting object will not know its own filename, which makes it
    /// impossible to auto-resolve relative paths to it, e.g. qcow2 backing
    /// file names.
    fn try_from(file: fs::File) -> io::Result<Self> {
        Ok(FileStorage {
            file,
            filename: None,
        })
    }
}

impl Storage for FileStorage {
    fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;

        loop {
            match self.file.read_at(buf, offset) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                result => return result,
            }
        }
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;

        self.file.seek_read(buf, offset)
    }

    fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }
}

impl Display for FileStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(filename) = &self.filename {
            write!(f, "file:{}", filename.display())
        } else {
            write!(f, "file:<anonymous>")
        }
    }
}
