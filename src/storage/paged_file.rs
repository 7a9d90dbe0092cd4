//! Memory-mapped paged file
//!
//! ## Design
//! - **Append-only**: pages are allocated at the logical end of the file and
//!   never reclaimed
//! - **Chunked growth**: the physical file grows by `grow_step` bytes at a time
//!   and is remapped; the logical length only counts allocated pages
//! - **Scoped borrows**: `page()` / `page_mut()` hand out a guard holding the
//!   storage lock and a slice of exactly one page. `allocate_page()` needs
//!   `&mut self`, so the borrow checker guarantees no page slice survives a remap
//!
//! ```text
//! Logical:   [Page 0][Page 1]...[Page n-1] | allocated = len
//! Physical:  [Page 0][Page 1]...[Page n-1][zeroed reserve ...] = grow_step multiple
//! ```
//!
//! On `close()` the physical file is truncated to the logical length, so a
//! cleanly closed file reopens with exactly its allocated pages.

use crate::config::{ByteOrder, TreeConfig};
use crate::storage::lock::{StorageGuard, StorageLockContext};
use crate::storage::PageAddress;
use crate::{Result, StorageError};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Read access to a borrowed page
pub trait PageBytes {
    fn bytes(&self) -> &[u8];

    fn byte_order(&self) -> ByteOrder;

    #[inline]
    fn read_i32(&self, offset: usize) -> i32 {
        self.byte_order().read_i32(&self.bytes()[offset..offset + 4])
    }
}

/// Read-only borrow of one page
pub struct PageRef<'a> {
    bytes: &'a [u8],
    order: ByteOrder,
    _guard: StorageGuard<'a>,
}

impl PageBytes for PageRef<'_> {
    fn bytes(&self) -> &[u8] {
        self.bytes
    }

    fn byte_order(&self) -> ByteOrder {
        self.order
    }
}

/// Mutable borrow of one page
pub struct PageMut<'a> {
    bytes: &'a mut [u8],
    order: ByteOrder,
    _guard: StorageGuard<'a>,
}

impl PageBytes for PageMut<'_> {
    fn bytes(&self) -> &[u8] {
        self.bytes
    }

    fn byte_order(&self) -> ByteOrder {
        self.order
    }
}

impl PageMut<'_> {
    #[inline]
    pub fn write_i32(&mut self, offset: usize, value: i32) {
        self.order.write_i32(&mut self.bytes[offset..offset + 4], value);
    }

    /// Move a byte range inside the page (ranges may overlap)
    #[inline]
    pub fn copy_within(&mut self, src: Range<usize>, dest: usize) {
        self.bytes.copy_within(src, dest);
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

pub struct PagedFile {
    path: PathBuf,
    file: File,
    /// `None` only while closing
    mmap: Option<MmapMut>,
    page_size: usize,
    grow_step: usize,
    /// Allocated bytes; always a multiple of `page_size`
    len: usize,
    byte_order: ByteOrder,
    lock: StorageLockContext,
}

impl PagedFile {
    /// Open or create the backing file. `truncate` discards any existing content.
    pub fn open(
        path: impl AsRef<Path>,
        config: &TreeConfig,
        lock: StorageLockContext,
        truncate: bool,
    ) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if truncate {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let page_size = config.page_size;
        let grow_step = config.effective_grow_step();
        let physical = usize::try_from(file.metadata()?.len()).map_err(|_| {
            StorageError::corrupted(&path, "file length does not fit in memory")
        })?;
        let len = physical - physical % page_size;

        // A zero-length file cannot be mapped; always keep one growth step around
        let target = round_up(physical.max(1), grow_step);
        if target != physical {
            file.set_len(target as u64)?;
        }

        // SAFETY: MmapMut::map_mut is unsafe because the file can be modified
        // externally while mapped. This is safe because:
        // 1. The file is opened read+write and owned by this PagedFile for its lifetime
        // 2. Backing files are private to the tree and not shared with other processes
        // 3. All access goes through page()/page_mut(), which bounds-check the address
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        tracing::debug!(
            path = %path.display(),
            page_size,
            len,
            physical = target,
            "opened paged file"
        );

        Ok(Self {
            path,
            file,
            mmap: Some(mmap),
            page_size,
            grow_step,
            len,
            byte_order: config.byte_order,
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn lock_context(&self) -> &StorageLockContext {
        &self.lock
    }

    /// Logical length in bytes (allocated pages only)
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_count(&self) -> usize {
        self.len / self.page_size
    }

    /// Current size of the mapping, including the unallocated reserve
    pub fn physical_len(&self) -> usize {
        self.mmap.as_ref().map_or(0, |m| m.len())
    }

    /// Set the logical length to `len` bytes of allocated pages
    ///
    /// A file dropped without `close()` keeps its zeroed growth reserve, so
    /// its page count on reopen comes from the caller's header instead.
    pub(crate) fn set_len(&mut self, len: usize) -> Result<()> {
        if len % self.page_size != 0 || len > self.physical_len() {
            return Err(StorageError::corrupted(
                &self.path,
                format!(
                    "logical length {} is not a page multiple within the {} mapped bytes",
                    len,
                    self.physical_len()
                ),
            ));
        }
        self.len = len;
        Ok(())
    }

    fn check_address(&self, address: PageAddress) -> Result<usize> {
        let start = address.offset() as usize;
        if start % self.page_size != 0 {
            return Err(StorageError::corrupted(
                &self.path,
                format!("page address {} is not aligned to {}", address, self.page_size),
            ));
        }
        if start + self.page_size > self.len {
            return Err(StorageError::corrupted(
                &self.path,
                format!("page address {} beyond end of file ({} bytes)", address, self.len),
            ));
        }
        Ok(start)
    }

    pub fn page(&self, address: PageAddress) -> Result<PageRef<'_>> {
        let start = self.check_address(address)?;
        let guard = self.lock.lock();
        let mmap = self.mmap.as_ref().ok_or_else(|| closed(&self.path))?;

        Ok(PageRef {
            bytes: &mmap[start..start + self.page_size],
            order: self.byte_order,
            _guard: guard,
        })
    }

    pub fn page_mut(&mut self, address: PageAddress) -> Result<PageMut<'_>> {
        let start = self.check_address(address)?;
        let end = start + self.page_size;
        let guard = self.lock.lock();
        let mmap = self.mmap.as_mut().ok_or_else(|| closed(&self.path))?;

        Ok(PageMut {
            bytes: &mut mmap[start..end],
            order: self.byte_order,
            _guard: guard,
        })
    }

    /// Append a zero-filled page, growing and remapping the file when needed
    pub fn allocate_page(&mut self) -> Result<PageAddress> {
        let start = self.len;
        let end = start + self.page_size;

        if end > i32::MAX as usize {
            return Err(StorageError::ResourceExhausted(format!(
                "{} would exceed the 32-bit page address space",
                self.path.display()
            )));
        }

        if end > self.physical_len() {
            self.grow(end)?;
        }

        let _guard = self.lock.lock();
        let mmap = self.mmap.as_mut().ok_or_else(|| closed(&self.path))?;
        mmap[start..end].fill(0);
        self.len = end;

        Ok(PageAddress::new(start as u32))
    }

    fn grow(&mut self, min_len: usize) -> Result<()> {
        let new_len = round_up(min_len, self.grow_step);
        let _guard = self.lock.lock();

        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
        }
        self.file.set_len(new_len as u64)?;

        // SAFETY: the previous mapping was flushed and dropped above, and
        // &mut self guarantees no page borrows into it remain. The file was
        // extended to new_len before remapping.
        self.mmap = Some(unsafe { MmapMut::map_mut(&self.file)? });

        tracing::debug!(path = %self.path.display(), new_len, "grew paged file");
        Ok(())
    }

    /// Write dirty mapped pages back to the file
    pub fn flush(&self) -> Result<()> {
        let _guard = self.lock.lock();
        if let Some(mmap) = self.mmap.as_ref() {
            mmap.flush()?;
        }
        Ok(())
    }

    /// Flush, unmap and trim the file to its allocated pages
    pub fn close(mut self) -> Result<()> {
        let _guard = self.lock.lock();
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
        }
        self.file.set_len(self.len as u64)?;
        self.file.sync_all()?;

        tracing::debug!(path = %self.path.display(), len = self.len, "closed paged file");
        Ok(())
    }
}

impl Drop for PagedFile {
    fn drop(&mut self) {
        if let Some(mmap) = self.mmap.as_ref() {
            if let Err(e) = mmap.flush() {
                tracing::warn!(path = %self.path.display(), error = %e, "flush on drop failed");
            }
        }
    }
}

fn round_up(value: usize, step: usize) -> usize {
    value.div_ceil(step) * step
}

fn closed(path: &Path) -> StorageError {
    StorageError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{} is closed", path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> TreeConfig {
        TreeConfig::default().with_page_size(512).with_grow_step(2048)
    }

    fn open_temp(truncate: bool) -> (PagedFile, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("pages.bin");
        let file = PagedFile::open(path, &small_config(), StorageLockContext::new(), truncate).unwrap();
        (file, temp_dir)
    }

    #[test]
    fn test_new_file_is_empty_but_mapped() {
        let (file, _temp) = open_temp(true);
        assert_eq!(file.len(), 0);
        assert_eq!(file.page_count(), 0);
        assert_eq!(file.physical_len(), 2048);
    }

    #[test]
    fn test_allocate_is_append_only() {
        let (mut file, _temp) = open_temp(true);
        let a = file.allocate_page().unwrap();
        let b = file.allocate_page().unwrap();
        assert_eq!(a, PageAddress::new(0));
        assert_eq!(b, PageAddress::new(512));
        assert_eq!(file.page_count(), 2);
    }

    #[test]
    fn test_grow_preserves_data() {
        let (mut file, _temp) = open_temp(true);
        let first = file.allocate_page().unwrap();
        file.page_mut(first).unwrap().write_i32(100, 0x0BADCAFE);

        // 2048-byte step: the fifth page forces a remap
        for _ in 0..8 {
            file.allocate_page().unwrap();
        }
        assert!(file.physical_len() >= 9 * 512);
        assert_eq!(file.page(first).unwrap().read_i32(100), 0x0BADCAFE);
    }

    #[test]
    fn test_allocated_pages_are_zeroed() {
        let (mut file, _temp) = open_temp(true);
        let page = file.allocate_page().unwrap();
        assert!(file.page(page).unwrap().bytes().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_out_of_range_address_is_corruption() {
        let (mut file, _temp) = open_temp(true);
        file.allocate_page().unwrap();

        let err = file.page(PageAddress::new(512)).err().unwrap();
        assert!(err.is_corruption());

        let err = file.page(PageAddress::new(100)).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_close_trims_and_reopen_keeps_pages() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("reopen.bin");
        let config = small_config();

        {
            let mut file = PagedFile::open(&path, &config, StorageLockContext::new(), true).unwrap();
            for i in 0..3 {
                let page = file.allocate_page().unwrap();
                file.page_mut(page).unwrap().write_i32(8, i);
            }
            file.close().unwrap();
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * 512);

        let file = PagedFile::open(&path, &config, StorageLockContext::new(), false).unwrap();
        assert_eq!(file.page_count(), 3);
        assert_eq!(file.page(PageAddress::new(1024)).unwrap().read_i32(8), 2);
    }

    #[test]
    fn test_truncate_discards_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("truncate.bin");
        let config = small_config();

        {
            let mut file = PagedFile::open(&path, &config, StorageLockContext::new(), true).unwrap();
            file.allocate_page().unwrap();
            file.close().unwrap();
        }

        let file = PagedFile::open(&path, &config, StorageLockContext::new(), true).unwrap();
        assert_eq!(file.page_count(), 0);
    }

    #[test]
    fn test_page_guard_holds_storage_lock() {
        let (mut file, _temp) = open_temp(true);
        let page = file.allocate_page().unwrap();
        let ctx = file.lock_context().clone();

        assert!(!ctx.is_locked());
        {
            let _page = file.page(page).unwrap();
            assert!(ctx.is_locked());
        }
        assert!(!ctx.is_locked());
    }

    #[test]
    fn test_set_len_discards_reserve() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("unclean.bin");
        let config = small_config();

        {
            let mut file = PagedFile::open(&path, &config, StorageLockContext::new(), true).unwrap();
            file.allocate_page().unwrap();
            file.allocate_page().unwrap();
            // Dropped without close: the reserve stays on disk
        }
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2048);

        let mut file = PagedFile::open(&path, &config, StorageLockContext::new(), false).unwrap();
        assert_eq!(file.page_count(), 4);
        file.set_len(2 * 512).unwrap();
        assert_eq!(file.allocate_page().unwrap(), PageAddress::new(1024));
        assert_eq!(file.physical_len(), 2048);
    }

    #[test]
    fn test_set_len_rejects_bad_length() {
        let (mut file, _temp) = open_temp(true);
        assert!(file.set_len(100).unwrap_err().is_corruption());
        assert!(file.set_len(4096).unwrap_err().is_corruption());
        assert_eq!(file.len(), 0);
    }

    #[test]
    fn test_copy_within_page() {
        let (mut file, _temp) = open_temp(true);
        let address = file.allocate_page().unwrap();
        let mut page = file.page_mut(address).unwrap();
        page.write_i32(8, 1);
        page.write_i32(12, 2);
        page.copy_within(8..16, 16);
        assert_eq!(page.read_i32(16), 1);
        assert_eq!(page.read_i32(20), 2);
    }
}
