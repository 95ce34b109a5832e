//! In-memory storage.

use crate::convert::WriteAt;
use crate::storage::Storage;
use std::fmt::{self, Display, Formatter};
use std::io;
use std::sync::RwLock;

/// In-memory storage object.
///
/// Useful for embedders that already hold image bytes in memory, and as a
/// conversion target ([`WriteAt`]) that grows on demand.
#[derive(Debug, Default)]
pub struct MemStorage {
    /// Backing bytes.
    data: RwLock<Vec<u8>>,
}

impl MemStorage {
    /// Create storage over the given bytes.
    pub fn new(data: Vec<u8>) -> Self {
        MemStorage {
            data: RwLock::new(data),
        }
    }

    /// Create zeroed storage of the given length.
    pub fn with_len(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// Consume the storage and return the backing bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner().unwrap()
    }
}

impl Storage for MemStorage {
    fn size(&self) -> io::Result<u64> {
        Ok(self.data.read().unwrap().len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self.data.read().unwrap();
        let Some(available) = (data.len() as u64).checked_sub(offset) else {
            return Ok(0);
        };
        let n = std::cmp::min(buf.len() as u64, available) as usize;
        let offset = offset as usize;
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }
}

impl WriteAt for MemStorage {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut data = self.data.write().unwrap();
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| io::Error::other("write offset overflow"))? as usize;
        if end > data.len() {
            data.resize(end, 0);
        }
        let offset = offset as usize;
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

impl Display for MemStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "mem:{} bytes", self.data.read().unwrap().len())
    }
}
