//! `BXTREE`: the ordered index family every [`crate::index::Index`]
//! delegates to.
//!
//! A full, paged, multi-level B+-tree belongs in the external page
//! store (`ods_*`) that spec.md explicitly places out of scope; this
//! module gives the rest of the crate the ordered-insert/ordered-delete
//! contract that component actually exposes, over a single sorted run
//! kept in memory and flushed to disk as one blob on
//! [`Tree::commit`]. `order` is recorded on disk and accepted at
//! `new`/`open` for on-disk compatibility with a future multi-level
//! implementation, but does not otherwise change behavior here — see
//! DESIGN.md.

use std::{convert::TryInto, path::Path};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::RwLock;

use crate::{
    comparator::{self, Comparator},
    error::{Error, Result},
    store::{CommitFlags, ObjRef, Store},
};

const KEY_TYPE_CAP: usize = 16;

struct UserData {
    key_type: String,
    order: u32,
    blob: ObjRef,
    blob_len: u64,
}

impl UserData {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(KEY_TYPE_CAP + 4 + 8 + 8);
        let mut name = self.key_type.clone().into_bytes();
        name.resize(KEY_TYPE_CAP, 0);
        buf.extend_from_slice(&name);
        buf.write_u32::<LittleEndian>(self.order).unwrap();
        buf.write_u64::<LittleEndian>(self.blob.0).unwrap();
        buf.write_u64::<LittleEndian>(self.blob_len).unwrap();
        buf
    }

    fn decode(raw: &[u8]) -> Result<UserData> {
        let end = raw[..KEY_TYPE_CAP]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(KEY_TYPE_CAP);
        let key_type = String::from_utf8_lossy(&raw[..end]).into_owned();
        let mut rest = &raw[KEY_TYPE_CAP..];
        let order = rest
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Corruption(e.to_string()))?;
        let blob = rest
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Corruption(e.to_string()))?;
        let blob_len = rest
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Corruption(e.to_string()))?;
        Ok(UserData {
            key_type,
            order,
            blob: ObjRef(blob),
            blob_len,
        })
    }
}

/// One ordered index over `(key, persistent-ref)` pairs, backed by a
/// single [`Store`] file.
pub struct Tree {
    store: Store,
    comparator: &'static dyn Comparator,
    order: u32,
    entries: RwLock<Vec<(Vec<u8>, ObjRef)>>,
}

impl Tree {
    /// Create a new, empty tree of the given `key_type` and `order`
    /// (the B+-tree fanout the reference tool records alongside
    /// `family="BXTREE"`).
    pub fn new(path: &Path, key_type: &str, order: u32) -> Result<Tree> {
        if key_type.len() >= KEY_TYPE_CAP {
            return Err(Error::InvalidArgument(format!(
                "key_type {} too long",
                key_type
            )));
        }
        let comparator = comparator::lookup(key_type)?;
        let store = Store::create(path, 0)?;
        let ud = UserData {
            key_type: key_type.to_string(),
            order,
            blob: ObjRef::NULL,
            blob_len: 0,
        };
        store.set_user_data(&ud.encode())?;
        Ok(Tree {
            store,
            comparator,
            order,
            entries: RwLock::new(Vec::new()),
        })
    }

    /// Open an existing tree, reading back its sorted run.
    pub fn open(path: &Path) -> Result<Tree> {
        let store = Store::open(path)?;
        let ud = UserData::decode(&store.user_data()?)?;
        let comparator = comparator::lookup(&ud.key_type)?;
        let entries = if ud.blob.is_null() {
            Vec::new()
        } else {
            let bytes = store.get(ud.blob, ud.blob_len as usize)?;
            decode_entries(&bytes)?
        };
        Ok(Tree {
            store,
            comparator,
            order: ud.order,
            entries: RwLock::new(entries),
        })
    }

    pub fn order(&self) -> u32 {
        self.order
    }

    pub fn key_type(&self) -> &'static str {
        self.comparator.type_name()
    }

    fn find(&self, entries: &[(Vec<u8>, ObjRef)], key: &[u8]) -> std::result::Result<usize, usize> {
        entries.binary_search_by(|(k, _)| self.comparator.compare(k, key))
    }

    /// Insert `key -> value`, overwriting any existing entry for an
    /// equal key (matching `ods_idx_insert`'s upsert semantics).
    pub fn insert(&self, key: &[u8], value: ObjRef) -> Result<()> {
        log::debug!("index insert {} -> {:?}", self.comparator.to_str(key), value);
        let mut entries = self.entries.write();
        match self.find(&entries, key) {
            Ok(pos) => entries[pos].1 = value,
            Err(pos) => entries.insert(pos, (key.to_vec(), value)),
        }
        Ok(())
    }

    /// Remove the entry for `key`, returning its value.
    pub fn delete(&self, key: &[u8]) -> Result<ObjRef> {
        log::debug!("index delete {}", self.comparator.to_str(key));
        let mut entries = self.entries.write();
        match self.find(&entries, key) {
            Ok(pos) => Ok(entries.remove(pos).1),
            Err(_) => Err(Error::NotFound(format!(
                "key {} not present in index",
                self.comparator.to_str(key)
            ))),
        }
    }

    /// Exact-match lookup, used by readers and by tests.
    pub fn lookup(&self, key: &[u8]) -> Option<ObjRef> {
        let entries = self.entries.read();
        self.find(&entries, key).ok().map(|pos| entries[pos].1)
    }

    /// Snapshot of all entries in ascending key order.
    pub fn iter(&self) -> Vec<(Vec<u8>, ObjRef)> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Flush the sorted run to disk and apply the requested commit
    /// barrier.
    pub fn commit(&self, flags: CommitFlags) -> Result<()> {
        let entries = self.entries.read();
        let bytes = encode_entries(&entries);
        let blob = self.store.alloc(bytes.len() as u64)?;
        self.store.put(blob, &bytes)?;
        let ud = UserData {
            key_type: self.comparator.type_name().to_string(),
            order: self.order,
            blob,
            blob_len: bytes.len() as u64,
        };
        self.store.set_user_data(&ud.encode())?;
        self.store.commit(flags)
    }
}

fn encode_entries(entries: &[(Vec<u8>, ObjRef)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
    for (key, value) in entries {
        buf.write_u16::<LittleEndian>(key.len() as u16).unwrap();
        buf.extend_from_slice(key);
        buf.write_u64::<LittleEndian>(value.0).unwrap();
    }
    buf
}

fn decode_entries(mut buf: &[u8]) -> Result<Vec<(Vec<u8>, ObjRef)>> {
    let count = buf
        .read_u32::<LittleEndian>()
        .map_err(|e| Error::Corruption(e.to_string()))?;
    let mut entries = Vec::with_capacity(count.try_into().unwrap());
    for _ in 0..count {
        let klen = buf
            .read_u16::<LittleEndian>()
            .map_err(|e| Error::Corruption(e.to_string()))? as usize;
        if buf.len() < klen {
            return Err(Error::Corruption("truncated index entry".into()));
        }
        let key = buf[..klen].to_vec();
        buf = &buf[klen..];
        let value = buf
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Corruption(e.to_string()))?;
        entries.push((key, ObjRef(value)));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn insert_lookup_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let tree = Tree::new(&dir.path().join("idx.bin"), "STRING", 5).unwrap();
        tree.insert(b"b\0", ObjRef(10)).unwrap();
        tree.insert(b"a\0", ObjRef(20)).unwrap();
        assert_eq!(tree.lookup(b"a\0"), Some(ObjRef(20)));

        let keys: Vec<Vec<u8>> = tree.iter().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"a\0".to_vec(), b"b\0".to_vec()]);

        assert_eq!(tree.delete(b"a\0").unwrap(), ObjRef(20));
        assert!(tree.lookup(b"a\0").is_none());
    }

    #[test]
    fn index_roundtrip_restores_preceding_index_ops() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.bin");
        {
            let tree = Tree::new(&path, "UINT64", 5).unwrap();
            tree.insert(&42u64.to_le_bytes(), ObjRef(7)).unwrap();
            tree.commit(CommitFlags::Sync).unwrap();
        }
        let tree = Tree::open(&path).unwrap();
        assert_eq!(tree.lookup(&42u64.to_le_bytes()), Some(ObjRef(7)));
    }

    #[test]
    fn delete_missing_key_is_not_found() {
        let dir = tempdir().unwrap();
        let tree = Tree::new(&dir.path().join("idx.bin"), "STRING", 5).unwrap();
        assert!(matches!(tree.delete(b"x\0"), Err(Error::NotFound(_))));
    }
}
