//! The logical index abstraction: a named ordered index realized as
//! one [`Tree`] per partition that may hold the objects it references.
//!
//! Two selection policies resolve a logical index down to the
//! concrete sub-tree to operate on: [`Index::active_idx_part`] for
//! insertion of newly-allocated objects (defaults to the cached
//! `last_part`, falling back to the first active partition), and
//! [`Index::matching_idx_part`] for operations that must target the
//! sub-tree holding a *specific* object regardless of which partition
//! is currently primary — required for deletion, and for indexing
//! objects that were not allocated in the current primary (e.g. during
//! bulk re-index).

use std::{
    fs,
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;

use crate::{
    bxtree::Tree,
    error::{Error, Result},
    partition::Partition,
    store::{CommitFlags, ObjRef},
};

struct IndexPart {
    part_ref: ObjRef,
    part_name: String,
    tree: Arc<Tree>,
}

/// A named B+-tree-backed index, fanned out across every active
/// partition.
pub struct Index {
    name: String,
    parts: RwLock<Vec<IndexPart>>,
    last_part: RwLock<Option<ObjRef>>,
}

fn index_file(root: &Path, partition_name: &str, index_name: &str) -> std::path::PathBuf {
    root.join(partition_name).join(format!("{}.idx", index_name))
}

/// Open `path` if a prior process already created it, else create a
/// fresh tree of `key_type`/`order`.
fn open_or_new_tree(path: &std::path::Path, key_type: &str, order: u32) -> Result<Tree> {
    if path.exists() {
        Tree::open(path)
    } else {
        Tree::new(path, key_type, order)
    }
}

impl Index {
    /// Materialize per-partition sub-trees for every partition in
    /// `partitions`, of the given `key_type`/`order` ("family" is
    /// always `BXTREE`, per §6 — there being no other implemented
    /// family). Opens a partition's tree file if a prior process
    /// already created it (e.g. a free-standing index reopened in a
    /// later session), rather than unconditionally creating one and
    /// failing with `AlreadyExists`.
    pub fn index_new(
        root: &Path,
        name: &str,
        key_type: &str,
        order: u32,
        partitions: &[Partition],
    ) -> Result<Index> {
        let mut parts = Vec::new();
        for part in partitions {
            let path = index_file(root, part.name(), name);
            let tree = open_or_new_tree(&path, key_type, order)?;
            parts.push(IndexPart {
                part_ref: part_obj_ref(part),
                part_name: part.name().to_string(),
                tree: Arc::new(tree),
            });
        }
        Ok(Index {
            name: name.to_string(),
            parts: RwLock::new(parts),
            last_part: RwLock::new(None),
        })
    }

    /// Open the sub-trees that already exist on disk for `name`
    /// across `partitions`.
    pub fn index_open(root: &Path, name: &str, partitions: &[Partition]) -> Result<Index> {
        let mut parts = Vec::new();
        for part in partitions {
            let path = index_file(root, part.name(), name);
            if path.exists() {
                let tree = Tree::open(&path)?;
                parts.push(IndexPart {
                    part_ref: part_obj_ref(part),
                    part_name: part.name().to_string(),
                    tree: Arc::new(tree),
                });
            }
        }
        if parts.is_empty() {
            return Err(Error::NotFound(format!("index {}", name)));
        }
        Ok(Index {
            name: name.to_string(),
            parts: RwLock::new(parts),
            last_part: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Materialize this index's sub-tree for `part` if it is not
    /// already open, creating the file when it does not yet exist.
    /// Mirrors the schema-editor contract (§4.3a): adding an indexed
    /// attribute, or activating a partition, opens the index on every
    /// active partition.
    pub fn ensure_partition(&self, root: &Path, part: &Partition, key_type: &str, order: u32) -> Result<()> {
        let already = self
            .parts
            .read()
            .iter()
            .any(|p| p.part_ref == part_obj_ref(part));
        if already {
            return Ok(());
        }
        let path = index_file(root, part.name(), &self.name);
        let tree = open_or_new_tree(&path, key_type, order)?;
        self.parts.write().push(IndexPart {
            part_ref: part_obj_ref(part),
            part_name: part.name().to_string(),
            tree: Arc::new(tree),
        });
        Ok(())
    }

    /// The cached partition's sub-tree if it is still active, else the
    /// first active partition's sub-tree.
    pub fn active_idx_part(&self, partitions: &[Partition]) -> Option<Arc<Tree>> {
        let parts = self.parts.read();
        let active_refs: Vec<ObjRef> = partitions
            .iter()
            .filter(|p| p.is_active())
            .map(part_obj_ref)
            .collect();

        if let Some(cached) = *self.last_part.read() {
            if active_refs.contains(&cached) {
                if let Some(ip) = parts.iter().find(|p| p.part_ref == cached) {
                    return Some(ip.tree.clone());
                }
            }
        }

        for part_ref in active_refs {
            if let Some(ip) = parts.iter().find(|p| p.part_ref == part_ref) {
                *self.last_part.write() = Some(part_ref);
                return Some(ip.tree.clone());
            }
        }
        None
    }

    /// The sub-tree whose partition equals `obj_part`, regardless of
    /// that partition's current active/primary state.
    pub fn matching_idx_part(&self, obj_part: ObjRef) -> Option<Arc<Tree>> {
        self.parts
            .read()
            .iter()
            .find(|p| p.part_ref == obj_part)
            .map(|p| p.tree.clone())
    }

    pub fn partition_names(&self) -> Vec<String> {
        self.parts.read().iter().map(|p| p.part_name.clone()).collect()
    }

    /// Look up `key` across every sub-tree regardless of partition,
    /// for callers (e.g. a unique-attribute lookup) that don't already
    /// know which partition holds a matching object.
    pub fn lookup_any(&self, key: &[u8]) -> Option<ObjRef> {
        self.parts.read().iter().find_map(|p| p.tree.lookup(key))
    }

    pub fn commit(&self, flags: CommitFlags) -> Result<()> {
        for ip in self.parts.read().iter() {
            ip.tree.commit(flags)?;
        }
        Ok(())
    }

    /// Destroy this index's sub-tree for `part`: drops the in-memory
    /// handle and removes its backing tree file from disk. Mirrors the
    /// ownership rule that an index sub-tree is destroyed together
    /// with its partition.
    pub fn drop_partition(&self, root: &Path, part: &Partition) -> Result<()> {
        let part_ref = part_obj_ref(part);
        self.parts.write().retain(|p| p.part_ref != part_ref);
        if *self.last_part.read() == Some(part_ref) {
            *self.last_part.write() = None;
        }
        let path = index_file(root, part.name(), &self.name);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn part_obj_ref(part: &Partition) -> ObjRef {
    part.obj_ref()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::PartitionList;
    use tempfile::tempdir;

    #[test]
    fn insert_then_matching_part_lookup_roundtrips() {
        let dir = tempdir().unwrap();
        let list = PartitionList::create(&dir.path().join("part")).unwrap();
        let p = list.part_new(dir.path(), "__ROOT__").unwrap();
        let p = list.part_primary_set(&p).unwrap();

        let idx = Index::index_new(dir.path(), "Id", "UINT64", 5, &[p.clone()]).unwrap();
        let tree = idx.active_idx_part(&[p.clone()]).unwrap();
        tree.insert(&42u64.to_le_bytes(), ObjRef(100)).unwrap();

        let matching = idx.matching_idx_part(part_obj_ref(&p)).unwrap();
        assert_eq!(matching.lookup(&42u64.to_le_bytes()), Some(ObjRef(100)));
    }
}
