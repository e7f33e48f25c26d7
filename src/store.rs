//! The byte-addressable persistent allocator underlying every
//! container sub-object (`config`, `part`, `schemas`, and each
//! partition's `objects` file and index files).
//!
//! This module stands in for the external page store (`ods_*`) that
//! spec.md names as out of scope; it implements only the contract the
//! rest of the crate actually consumes: create/open/close of a backing
//! file, a small fixed-size user-data region, allocation and release of
//! fixed-size records, dereferencing a persistent reference back to its
//! bytes, and a commit barrier.
//!
//! Freed records are tracked purely in memory (the free list is not
//! itself persisted); a process restart does not reclaim space freed
//! by a prior process, trading a small amount of wasted space for a
//! much smaller on-disk format. This is a deliberate simplification,
//! not an oversight — see DESIGN.md.

use std::{
    convert::TryInto,
    fs,
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    util,
};

const MAGIC: &[u8; 8] = b"SOSSTORE";
const USER_DATA_CAP: usize = 64;
const HEADER_LEN: u64 = 8 /* magic */ + 8 /* record_size */ + USER_DATA_CAP as u64;

/// How durably [`Store::commit`] should make pending writes visible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitFlags {
    /// Block until the underlying file is fsync'd.
    Sync,
    /// Return immediately; durability is best-effort. Commit is a
    /// barrier for in-process visibility, not a transaction.
    Async,
}

/// A persistent reference: a byte offset into a [`Store`]'s data
/// region. Null (`0`) means "no object".
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjRef(pub u64);

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// A single backing file providing fixed-size (or, with
/// `record_size == 0`, append-only variable-size) allocation plus a
/// small user-data header.
///
/// `create`/`open` take an exclusive `flock` on the file for the
/// lifetime of the `Store`, mirroring the on-disk index's own
/// single-writer guard (`try_lock_exclusive` in the teacher crate's
/// compaction path); a second `Store` over the same path in another
/// process fails fast with `PermissionDenied` instead of silently
/// racing on offsets.
pub struct Store {
    path: PathBuf,
    file: Mutex<fs::File>,
    record_size: u64,
    free_list: Mutex<Vec<ObjRef>>,
}

impl Store {
    /// Create a new backing file at `path`. Fails with `AlreadyExists`
    /// if `path` is already present.
    pub fn create(path: &Path, record_size: u64) -> Result<Store> {
        let mut file = util::open_file_rw(path, true)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::PermissionDenied(format!("{} already locked", path.display())))?;
        let mut header = Vec::with_capacity(HEADER_LEN as usize);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&record_size.to_le_bytes());
        header.extend_from_slice(&[0u8; USER_DATA_CAP]);
        file.write_all(&header)?;
        file.sync_all()?;
        Ok(Store {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            record_size,
            free_list: Mutex::new(Vec::new()),
        })
    }

    /// Open an existing backing file, verifying its magic signature.
    pub fn open(path: &Path) -> Result<Store> {
        let mut file = util::open_file_existing(path)?;
        file.try_lock_exclusive()
            .map_err(|_| Error::PermissionDenied(format!("{} already locked", path.display())))?;
        let header = util::read_at(&mut file, 0, HEADER_LEN as usize)?;
        if &header[0..8] != MAGIC {
            log::error!("bad store signature in {}", path.display());
            return Err(Error::Corruption(format!(
                "bad store signature in {}",
                path.display()
            )));
        }
        let record_size = u64::from_le_bytes(header[8..16].try_into().unwrap());
        Ok(Store {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            record_size,
            free_list: Mutex::new(Vec::new()),
        })
    }

    /// Open `path`, creating it with `record_size` if it does not yet
    /// exist. Used when materializing a partition's `objects` file on
    /// demand (spec.md §4.1 `open`).
    pub fn open_or_create(path: &Path, record_size: u64) -> Result<Store> {
        if path.exists() {
            Store::open(path)
        } else {
            Store::create(path, record_size)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    /// Read the user-data region, e.g. the `part` store's
    /// `{signature, primary, head, tail, lock}` block.
    pub fn user_data(&self) -> Result<Vec<u8>> {
        let mut file = self.file.lock();
        util::read_at(&mut file, 16, USER_DATA_CAP)
    }

    /// Overwrite the user-data region. `data` must fit within
    /// [`USER_DATA_CAP`].
    pub fn set_user_data(&self, data: &[u8]) -> Result<()> {
        if data.len() > USER_DATA_CAP {
            return Err(Error::InvalidArgument(format!(
                "user-data of {} bytes exceeds cap of {}",
                data.len(),
                USER_DATA_CAP
            )));
        }
        let mut padded = vec![0u8; USER_DATA_CAP];
        padded[..data.len()].copy_from_slice(data);
        let mut file = self.file.lock();
        util::write_at(&mut file, 16, &padded)
    }

    /// Allocate `size` bytes, reusing a freed record of the exact same
    /// size when this store holds fixed-size records.
    pub fn alloc(&self, size: u64) -> Result<ObjRef> {
        if self.record_size != 0 && size == self.record_size {
            let mut free_list = self.free_list.lock();
            if let Some(r) = free_list.pop() {
                log::debug!("alloc reused freed {:?} in {}", r, self.path.display());
                return Ok(r);
            }
        }
        let mut file = self.file.lock();
        let offset = file.seek(SeekFrom::End(0))?;
        let len: usize = util::try_convert(size, "alloc size does not fit in memory")?;
        file.write_all(&vec![0u8; len])?;
        log::debug!("alloc {} bytes at {} in {}", size, offset, self.path.display());
        Ok(ObjRef(offset))
    }

    /// Release `r` back to this store's free list for reuse by a
    /// future `alloc` of the same size, within this process only.
    pub fn free(&self, r: ObjRef) {
        if r.is_null() {
            return;
        }
        log::debug!("free {:?} in {}", r, self.path.display());
        self.free_list.lock().push(r);
    }

    /// Dereference `r`, reading `len` bytes starting at its offset.
    pub fn get(&self, r: ObjRef, len: usize) -> Result<Vec<u8>> {
        if r.is_null() {
            return Err(Error::InvalidArgument("dereference of null ref".into()));
        }
        let mut file = self.file.lock();
        util::read_at(&mut file, r.0, len)
    }

    /// Overwrite the bytes at `r`.
    pub fn put(&self, r: ObjRef, bytes: &[u8]) -> Result<()> {
        if r.is_null() {
            return Err(Error::InvalidArgument("write to null ref".into()));
        }
        let mut file = self.file.lock();
        util::write_at(&mut file, r.0, bytes)
    }

    /// Durability barrier; see [`CommitFlags`].
    pub fn commit(&self, flags: CommitFlags) -> Result<()> {
        match flags {
            CommitFlags::Sync => {
                self.file.lock().sync_all()?;
                Ok(())
            }
            CommitFlags::Async => Ok(()),
        }
    }

    /// Grow the file to at least `new_size` bytes past the header,
    /// failing if `new_size` would shrink the current data region.
    pub fn extend(&self, new_size: u64) -> Result<()> {
        let mut file = self.file.lock();
        let cur = file.metadata()?.len();
        let target = HEADER_LEN + new_size;
        if target < cur {
            return Err(Error::InvalidArgument(
                "extend: new_size smaller than current size".into(),
            ));
        }
        file.set_len(target)?;
        Ok(())
    }

    pub fn stat(&self) -> Result<fs::Metadata> {
        Ok(self.file.lock().metadata()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_roundtrips_user_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");
        {
            let store = Store::create(&path, 32).unwrap();
            store.set_user_data(b"hello").unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(&store.user_data().unwrap()[..5], b"hello");
        assert_eq!(store.record_size(), 32);
    }

    #[test]
    fn open_rejects_bad_signature() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, vec![0u8; 128]).unwrap();
        assert!(matches!(Store::open(&path), Err(Error::Corruption(_))));
    }

    #[test]
    fn alloc_get_put_roundtrip() {
        let dir = tempdir().unwrap();
        let store = Store::create(&dir.path().join("objs.bin"), 16).unwrap();
        let r = store.alloc(16).unwrap();
        store.put(r, b"0123456789abcdef").unwrap();
        assert_eq!(store.get(r, 16).unwrap(), b"0123456789abcdef");
    }

    #[test]
    fn freed_record_is_reused() {
        let dir = tempdir().unwrap();
        let store = Store::create(&dir.path().join("objs.bin"), 8).unwrap();
        let r1 = store.alloc(8).unwrap();
        store.free(r1);
        let r2 = store.alloc(8).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn second_open_of_same_path_is_locked_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("objs.bin");
        let _store = Store::create(&path, 8).unwrap();
        assert!(matches!(Store::open(&path), Err(Error::PermissionDenied(_))));
    }

    #[test]
    fn extend_rejects_shrink() {
        let dir = tempdir().unwrap();
        let store = Store::create(&dir.path().join("objs.bin"), 8).unwrap();
        store.extend(64).unwrap();
        assert!(store.extend(0).is_err());
    }
}
