use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

/// Size prefix written before every allocated region. The first allocation
/// in a fresh store therefore always lands at this address.
pub const REGION_HEADER_SIZE: u64 = 8;

/// An allocated region of backing storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub addr: u64,
    pub size: u64,
}

/// Block-addressable storage consumed by the WAL and the segment layer.
///
/// All reads and writes are stateless and positional: there is no shared
/// seek cursor, so a handle may be used from any number of threads.
pub trait BlockStorage: Send + Sync {
    /// Allocates a fresh zeroed region of `size` bytes.
    fn allocate(&self, size: u64) -> Result<BlockHandle>;

    /// Reopens a previously allocated region by address. Address zero is
    /// never valid.
    fn open_existing(&self, addr: u64) -> Result<BlockHandle>;

    fn read_at(&self, handle: BlockHandle, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&self, handle: BlockHandle, offset: u64, bytes: &[u8]) -> Result<()>;

    /// Forces written data down to the physical medium.
    fn sync(&self) -> Result<()>;
}

fn check_span(handle: BlockHandle, offset: u64, len: u64) -> Result<()> {
    if offset + len > handle.size {
        return Err(Error::InvalidState(format!(
            "access [{}, {}) outside block of {} bytes",
            offset,
            offset + len,
            handle.size
        )));
    }
    Ok(())
}

struct FileInner {
    file: File,
    end: u64,
}

/// Single-file storage: regions are appended, each behind an 8-byte size
/// prefix so they can be reopened by address alone.
pub struct FileStorage {
    inner: Mutex<FileInner>,
}

impl FileStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let end = file.metadata()?.len();
        Ok(FileStorage {
            inner: Mutex::new(FileInner { file, end }),
        })
    }

    /// True when nothing has ever been allocated (fresh store).
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().end == 0
    }
}

impl BlockStorage for FileStorage {
    fn allocate(&self, size: u64) -> Result<BlockHandle> {
        let mut inner = self.inner.lock().unwrap();
        let addr = inner.end + REGION_HEADER_SIZE;

        let mut prefix = [0u8; REGION_HEADER_SIZE as usize];
        LittleEndian::write_u64(&mut prefix, size);
        let end = inner.end;
        inner.file.seek(SeekFrom::Start(end))?;
        inner.file.write_all(&prefix)?;

        // Zero-fill so positional reads inside the region always succeed.
        let zeros = vec![0u8; 64 * 1024];
        let mut remaining = size;
        while remaining > 0 {
            let chunk = remaining.min(zeros.len() as u64) as usize;
            inner.file.write_all(&zeros[..chunk])?;
            remaining -= chunk as u64;
        }

        inner.end = addr + size;
        Ok(BlockHandle { addr, size })
    }

    fn open_existing(&self, addr: u64) -> Result<BlockHandle> {
        if addr < REGION_HEADER_SIZE {
            return Err(Error::Corruption(format!("invalid block address {}", addr)));
        }
        let mut inner = self.inner.lock().unwrap();
        if addr > inner.end {
            return Err(Error::Corruption(format!(
                "block address {} beyond storage end {}",
                addr, inner.end
            )));
        }
        let mut prefix = [0u8; REGION_HEADER_SIZE as usize];
        inner.file.seek(SeekFrom::Start(addr - REGION_HEADER_SIZE))?;
        inner.file.read_exact(&mut prefix)?;
        let size = LittleEndian::read_u64(&prefix);
        if addr + size > inner.end {
            return Err(Error::Corruption(format!(
                "block at {} claims {} bytes past storage end",
                addr, size
            )));
        }
        Ok(BlockHandle { addr, size })
    }

    fn read_at(&self, handle: BlockHandle, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_span(handle, offset, buf.len() as u64)?;
        let mut inner = self.inner.lock().unwrap();
        inner.file.seek(SeekFrom::Start(handle.addr + offset))?;
        inner.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, handle: BlockHandle, offset: u64, bytes: &[u8]) -> Result<()> {
        check_span(handle, offset, bytes.len() as u64)?;
        let mut inner = self.inner.lock().unwrap();
        inner.file.seek(SeekFrom::Start(handle.addr + offset))?;
        inner.file.write_all(bytes)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.inner.lock().unwrap().file.sync_all()?;
        Ok(())
    }
}

/// In-memory storage with the same region layout as [`FileStorage`].
/// Keeps its contents across reopen of consumers, which makes it the unit
/// test backing of choice.
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            data: Mutex::new(Vec::new()),
        }
    }

    /// Direct byte access for corruption tests.
    #[cfg(test)]
    pub fn poke(&self, absolute: u64, byte: u8) {
        self.data.lock().unwrap()[absolute as usize] = byte;
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStorage for MemoryStorage {
    fn allocate(&self, size: u64) -> Result<BlockHandle> {
        let mut data = self.data.lock().unwrap();
        let addr = data.len() as u64 + REGION_HEADER_SIZE;
        let mut prefix = [0u8; REGION_HEADER_SIZE as usize];
        LittleEndian::write_u64(&mut prefix, size);
        data.extend_from_slice(&prefix);
        let filled = data.len() + size as usize;
        data.resize(filled, 0);
        Ok(BlockHandle { addr, size })
    }

    fn open_existing(&self, addr: u64) -> Result<BlockHandle> {
        if addr < REGION_HEADER_SIZE {
            return Err(Error::Corruption(format!("invalid block address {}", addr)));
        }
        let data = self.data.lock().unwrap();
        if addr as usize > data.len() {
            return Err(Error::Corruption(format!(
                "block address {} beyond storage end {}",
                addr,
                data.len()
            )));
        }
        let start = (addr - REGION_HEADER_SIZE) as usize;
        let size = LittleEndian::read_u64(&data[start..start + REGION_HEADER_SIZE as usize]);
        if addr + size > data.len() as u64 {
            return Err(Error::Corruption(format!(
                "block at {} claims {} bytes past storage end",
                addr, size
            )));
        }
        Ok(BlockHandle { addr, size })
    }

    fn read_at(&self, handle: BlockHandle, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_span(handle, offset, buf.len() as u64)?;
        let data = self.data.lock().unwrap();
        let start = (handle.addr + offset) as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, handle: BlockHandle, offset: u64, bytes: &[u8]) -> Result<()> {
        check_span(handle, offset, bytes.len() as u64)?;
        let mut data = self.data.lock().unwrap();
        let start = (handle.addr + offset) as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
