//! Fixed-layout header storage
//!
//! The tree persists its root address, height and counters as 32-bit words
//! at fixed offsets through [`HeaderStorage`]. Callers that embed the tree in
//! a larger file implement the trait over their own header region;
//! [`HeaderFile`] is a standalone implementation backed by a small
//! checksummed file.
//!
//! ```text
//! HeaderFile on disk: [block: HEADER_LEN bytes][crc32: 4 bytes LE]
//! ```

use crate::config::ByteOrder;
use crate::{Result, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Bytes used by the tree's persisted variables
pub const HEADER_LEN: usize = 40;

const CHECKSUM_LEN: usize = 4;

pub trait HeaderStorage {
    /// With `to_disk` store `value` at `offset` and return it; otherwise return the stored value.
    fn persist_int(&mut self, offset: usize, value: i32, to_disk: bool) -> Result<i32>;
}

/// In-memory header block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBlock {
    bytes: [u8; HEADER_LEN],
    order: ByteOrder,
}

impl HeaderBlock {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            bytes: [0u8; HEADER_LEN],
            order,
        }
    }

    pub fn from_bytes(bytes: &[u8], order: ByteOrder) -> Result<Self> {
        let bytes: [u8; HEADER_LEN] = bytes.try_into().map_err(|_| {
            StorageError::InvalidArgument(format!(
                "header block must be {} bytes, got {}",
                HEADER_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self { bytes, order })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn check_offset(offset: usize) -> Result<()> {
        if offset % 4 != 0 || offset + 4 > HEADER_LEN {
            return Err(StorageError::InvalidArgument(format!(
                "header offset {} outside the {}-byte block",
                offset, HEADER_LEN
            )));
        }
        Ok(())
    }
}

impl HeaderStorage for HeaderBlock {
    fn persist_int(&mut self, offset: usize, value: i32, to_disk: bool) -> Result<i32> {
        Self::check_offset(offset)?;
        let slot = &mut self.bytes[offset..offset + 4];
        if to_disk {
            self.order.write_i32(slot, value);
            Ok(value)
        } else {
            Ok(self.order.read_i32(slot))
        }
    }
}

/// Header block persisted in its own checksummed file
pub struct HeaderFile {
    path: PathBuf,
    block: HeaderBlock,
    dirty: bool,
}

impl HeaderFile {
    /// Load the header, or start from a zeroed block if the file does not exist yet
    pub fn open(path: impl AsRef<Path>, order: ByteOrder) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let block = match fs::read(&path) {
            Ok(data) if data.is_empty() => HeaderBlock::new(order),
            Ok(data) => Self::decode(&path, &data, order)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => HeaderBlock::new(order),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            block,
            dirty: false,
        })
    }

    fn decode(path: &Path, data: &[u8], order: ByteOrder) -> Result<HeaderBlock> {
        if data.len() != HEADER_LEN + CHECKSUM_LEN {
            return Err(StorageError::corrupted(
                path,
                format!("header file is {} bytes, expected {}", data.len(), HEADER_LEN + CHECKSUM_LEN),
            ));
        }

        let (block, stored) = data.split_at(HEADER_LEN);
        let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        let actual = crc32fast::hash(block);
        if stored != actual {
            return Err(StorageError::corrupted(
                path,
                format!("header checksum mismatch: stored 0x{:08X}, computed 0x{:08X}", stored, actual),
            ));
        }

        HeaderBlock::from_bytes(block, order)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block(&self) -> &HeaderBlock {
        &self.block
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the block through a temporary file and rename it into place
    pub fn sync(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        {
            let mut file: File = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(self.block.as_bytes())?;
            file.write_all(&crc32fast::hash(self.block.as_bytes()).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        self.dirty = false;
        Ok(())
    }
}

impl HeaderStorage for HeaderFile {
    fn persist_int(&mut self, offset: usize, value: i32, to_disk: bool) -> Result<i32> {
        let result = self.block.persist_int(offset, value, to_disk)?;
        if to_disk {
            self.dirty = true;
        }
        Ok(result)
    }
}
