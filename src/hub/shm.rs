//! File-backed shared mappings for the client rings.
//!
//! Every ring lives in a file under the hub's session directory, mapped
//! shared into each participating process. The hub side creates (and on
//! teardown removes) the file; clients open the same path and map the same
//! pages. All cross-process coordination inside a mapping goes through
//! atomics, so the only thing this module guarantees is a stable,
//! page-aligned, zero-initialized region of the requested size.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub(crate) struct SharedMapping {
    ptr: *mut u8,
    len: usize,
    path: PathBuf,
    owner: bool,
    _mmap: memmap2::MmapMut,
}

// Raw-pointer access into the mapping is coordinated entirely through the
// atomics stored inside it (SPSC publish/consume protocol in ring.rs).
unsafe impl Send for SharedMapping {}
unsafe impl Sync for SharedMapping {}

impl SharedMapping {
    /// Create (or replace) the backing file and map it. The region is
    /// zero-filled. The creator owns the file and unlinks it on drop.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidParam);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;

        let mut mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();

        Ok(Self {
            ptr,
            len,
            path: path.to_path_buf(),
            owner: true,
            _mmap: mmap,
        })
    }

    /// Map an existing file created by the hub side.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::InvalidParam);
        }

        let mut mmap = unsafe { memmap2::MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();

        Ok(Self {
            ptr,
            len,
            path: path.to_path_buf(),
            owner: false,
            _mmap: mmap,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Base of the mapping. Valid for the lifetime of `self`; callers keep
    /// all aliasing inside the atomic protocol.
    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SharedMapping {
    fn drop(&mut self) {
        if self.owner {
            // a client may still have the file mapped; unlinking now is
            // fine on unix and merely fails on Windows until it closes
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ucan-shmtest-{}-{tag}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn create_is_zero_filled_and_sized() {
        let path = temp_path("zero");
        let mapping = SharedMapping::create(&path, 4096).unwrap();
        assert_eq!(mapping.len(), 4096);
        let bytes = unsafe { std::slice::from_raw_parts(mapping.ptr(), 4096) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn open_sees_the_creators_writes() {
        let path = temp_path("share");
        let writer = SharedMapping::create(&path, 4096).unwrap();
        unsafe { *writer.ptr().add(100) = 0xab };

        let reader = SharedMapping::open(&path).unwrap();
        assert_eq!(reader.len(), 4096);
        assert_eq!(unsafe { *reader.ptr().add(100) }, 0xab);

        // writes travel the other way too
        unsafe { *reader.ptr().add(200) = 0xcd };
        assert_eq!(unsafe { *writer.ptr().add(200) }, 0xcd);
    }

    #[test]
    fn owner_unlinks_the_file() {
        let path = temp_path("unlink");
        {
            let _mapping = SharedMapping::create(&path, 128).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn open_of_missing_file_fails() {
        let path = temp_path("missing");
        assert!(SharedMapping::open(&path).is_err());
    }
}
