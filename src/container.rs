//! The top-level container handle: owns the schema registry, partition
//! list, configuration store, and the per-partition object store and
//! indices that back every [`crate::object::Object`].
//!
//! Mirrors how the teacher crate's top-level `Rdms` handle glues
//! together its index, WAL, and config pieces behind one mutex-guarded
//! struct; here the in-memory caches named in the concurrency model
//! (schema dictionary, free list, cached primary partition) all live
//! under one [`parking_lot::Mutex`].

use std::{
    collections::HashMap,
    convert::TryInto,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;

use crate::{
    config::Config,
    error::{Error, Result},
    index::Index,
    object::{Object, ObjectRef},
    partition::{Partition, PartitionList},
    schema::{AttrSpec, AttrType, Schema, SchemaRegistry},
    store::{CommitFlags, Store},
};

const ROOT_PARTITION: &str = "__ROOT__";

/// The comparator family an attribute's indexed value is stored under.
/// Only `STRING` and `UINT64` comparators are registered (§4.5); every
/// numeric attribute type shares the `UINT64` comparator's fixed
/// 8-byte layout via [`crate::object::Value::to_key_bytes`].
fn key_type_for(type_tag: AttrType) -> &'static str {
    match type_tag {
        AttrType::Str | AttrType::Bytes => "STRING",
        AttrType::Uint32
        | AttrType::Uint64
        | AttrType::Int32
        | AttrType::Int64
        | AttrType::Float
        | AttrType::Double => "UINT64",
    }
}

struct Inner {
    dir: PathBuf,
    config: Config,
    schemas: SchemaRegistry,
    partitions: PartitionList,
    /// One variable-record object store per partition, shared by every
    /// schema — every object's first 8 bytes are its schema id
    /// regardless of schema, so `obj_from_ref` can resolve the schema
    /// before it knows how to interpret the rest of the record (§4.4,
    /// §9 "object header stores only a schema id").
    obj_stores: Mutex<HashMap<String, Arc<Store>>>,
    indices: Mutex<HashMap<String, Arc<Index>>>,
    free_list: Mutex<Vec<Object>>,
    cached_primary: Mutex<Option<Partition>>,
}

/// A named directory grouping schemas, partitions, and the indices
/// built over the objects inside them. Cheap to clone; every clone
/// shares the same open sub-objects.
#[derive(Clone)]
pub struct Container {
    inner: Arc<Inner>,
}

impl Container {
    /// Create a fresh container rooted at `path`. Fails with
    /// `AlreadyExists` if `path` already exists; rolls back every
    /// sub-object already created if a later step fails.
    pub fn create(path: &Path, mode: u32) -> Result<Container> {
        if path.exists() {
            return Err(Error::AlreadyExists(path.display().to_string()));
        }
        fs::create_dir_all(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let dmode = crate::util::dir_mode_from_file_mode(mode);
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(dmode));
        }

        let result = (|| -> Result<Container> {
            let config = Config::create(path)?;
            let schemas = SchemaRegistry::create(path)?;
            let partitions = PartitionList::create(&path.join("part"))?;

            let container = Container {
                inner: Arc::new(Inner {
                    dir: path.to_path_buf(),
                    config,
                    schemas,
                    partitions,
                    obj_stores: Mutex::new(HashMap::new()),
                    indices: Mutex::new(HashMap::new()),
                    free_list: Mutex::new(Vec::new()),
                    cached_primary: Mutex::new(None),
                }),
            };
            container.ensure_root_partition()?;
            log::info!("container created at {}", path.display());
            Ok(container)
        })();

        if result.is_err() {
            let _ = fs::remove_dir_all(path);
        }
        result
    }

    /// Open an existing container, rebuilding the schema dictionary and
    /// materializing per-partition object stores and indices for every
    /// `ACTIVE` partition.
    pub fn open(path: &Path) -> Result<Container> {
        let config = Config::open(path)?;
        let schemas = SchemaRegistry::open(path)?;
        let partitions = PartitionList::open(&path.join("part"))?;

        let container = Container {
            inner: Arc::new(Inner {
                dir: path.to_path_buf(),
                config,
                schemas,
                partitions,
                obj_stores: Mutex::new(HashMap::new()),
                indices: Mutex::new(HashMap::new()),
                free_list: Mutex::new(Vec::new()),
                cached_primary: Mutex::new(None),
            }),
        };
        container.ensure_root_partition()?;

        for part in container.inner.partitions.iter_all()? {
            if part.is_active() {
                container.open_partition_stores(&part)?;
            }
        }
        log::info!("container opened at {}", path.display());
        Ok(container)
    }

    pub fn open_or_create(path: &Path, mode: u32) -> Result<Container> {
        if path.exists() {
            Container::open(path)
        } else {
            Container::create(path, mode)
        }
    }

    fn ensure_root_partition(&self) -> Result<()> {
        if self.inner.partitions.first()?.is_some() {
            return Ok(());
        }
        let part = self.inner.partitions.part_new(&self.inner.dir, ROOT_PARTITION)?;
        let part = self.inner.partitions.part_primary_set(&part)?;
        *self.inner.cached_primary.lock() = Some(part.clone());
        self.open_partition_stores(&part)?;
        Ok(())
    }

    fn part_dir(&self, part: &Partition) -> PathBuf {
        self.inner.dir.join(part.name())
    }

    /// Ensure the objects file exists and every indexed-schema
    /// sub-index is open for `part`, matching the contract §4.3a
    /// describes for schema-add and partition-activation.
    fn open_partition_stores(&self, part: &Partition) -> Result<()> {
        let part_dir = self.part_dir(part);
        fs::create_dir_all(&part_dir)?;
        self.obj_store(part)?;

        for schema in self.inner.schemas.schemas() {
            for attr in schema.indexed_attrs() {
                self.ensure_index(part, &schema, &attr.name)?;
            }
        }
        Ok(())
    }

    /// The single variable-record object store for `part`, shared by
    /// every schema (objects are record_size == 0 since schemas have
    /// differing `obj_sz`).
    fn obj_store(&self, part: &Partition) -> Result<Arc<Store>> {
        if let Some(store) = self.inner.obj_stores.lock().get(part.name()) {
            return Ok(store.clone());
        }
        let path = self.part_dir(part).join("objects");
        let store = Arc::new(Store::open_or_create(&path, 0)?);
        self.inner
            .obj_stores
            .lock()
            .insert(part.name().to_string(), store.clone());
        Ok(store)
    }

    fn index_name(schema: &Schema, attr_name: &str) -> String {
        format!("{}.{}", schema.name, attr_name)
    }

    fn ensure_index(&self, part: &Partition, schema: &Schema, attr_name: &str) -> Result<Arc<Index>> {
        let attr = schema
            .attr_by_name(attr_name)
            .ok_or_else(|| Error::NotFound(format!("attribute {}", attr_name)))?;
        let key_type = key_type_for(attr.type_tag);
        let name = Self::index_name(schema, attr_name);
        self.named_index(&name, key_type, 5, Some(part))
    }

    /// Open (creating on first use) a named index not tied to any
    /// schema attribute, across every currently `ACTIVE` partition —
    /// used for the reference tool's `CompTime`/`JobComp` compound-key
    /// indices (§6). `part`, when given, is additionally ensured even
    /// if not yet `ACTIVE` (the attribute-indexing path above passes
    /// the partition currently being materialized).
    pub fn named_index(&self, name: &str, key_type: &str, order: u32, part: Option<&Partition>) -> Result<Arc<Index>> {
        let mut indices = self.inner.indices.lock();
        if let Some(index) = indices.get(name) {
            if let Some(part) = part {
                index.ensure_partition(&self.inner.dir, part, key_type, order)?;
            }
            return Ok(index.clone());
        }

        let mut parts = self
            .inner
            .partitions
            .iter_all()?
            .into_iter()
            .filter(|p| p.is_active())
            .collect::<Vec<_>>();
        if let Some(part) = part {
            if !parts.iter().any(|p| p.obj_ref() == part.obj_ref()) {
                parts.push(part.clone());
            }
        }

        let index = Arc::new(Index::index_new(&self.inner.dir, name, key_type, order, &parts)?);
        indices.insert(name.to_string(), index.clone());
        Ok(index)
    }

    /// Add a new schema to the dictionary, then materialize its
    /// indices on every currently `ACTIVE` partition (§4.3a).
    pub fn schema_add(&self, name: &str, specs: Vec<AttrSpec>) -> Result<Arc<Schema>> {
        let schema = self.inner.schemas.schema_add(name, specs)?;
        for part in self.inner.partitions.iter_all()? {
            if part.is_active() {
                for attr in schema.indexed_attrs() {
                    self.ensure_index(&part, &schema, &attr.name)?;
                }
            }
        }
        Ok(schema)
    }

    pub fn schema_by_name(&self, name: &str) -> Option<Arc<Schema>> {
        self.inner.schemas.schema_by_name(name)
    }

    pub fn schema_by_id(&self, id: u64) -> Option<Arc<Schema>> {
        self.inner.schemas.schema_by_id(id)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Create and activate a new partition (§4.2), materializing the
    /// object store and indices for every schema already in the
    /// dictionary.
    pub fn part_new(&self, name: &str) -> Result<Partition> {
        let part = self.inner.partitions.part_new(&self.inner.dir, name)?;
        let part = self.inner.partitions.part_active_set(&part, true)?;
        self.open_partition_stores(&part)?;
        log::info!("partition '{}' created and activated", name);
        Ok(part)
    }

    pub fn part_primary_set(&self, part: &Partition) -> Result<Partition> {
        let part = self.inner.partitions.part_primary_set(part)?;
        *self.inner.cached_primary.lock() = Some(part.clone());
        Ok(part)
    }

    pub fn part_active_set(&self, part: &Partition, online: bool) -> Result<Partition> {
        self.inner.partitions.part_active_set(part, online)
    }

    pub fn partitions(&self) -> Result<Vec<Partition>> {
        self.inner.partitions.iter_all()
    }

    /// Delete `part` (§4.2, §3 ownership: "an index sub-tree is
    /// destroyed with its partition"): tears down every named index's
    /// sub-tree for this partition and drops its object store handle,
    /// then releases the partition list's own hold on the record.
    /// Rejects deleting the primary partition. The on-disk record and
    /// directory are only actually removed once the partition's
    /// refcount reaches zero — deferred if some other live snapshot
    /// (e.g. a concurrently-running iterator) still holds a reference.
    pub fn part_delete(&self, part: &Partition) -> Result<()> {
        for index in self.inner.indices.lock().values() {
            index.drop_partition(&self.inner.dir, part)?;
        }
        self.inner.obj_stores.lock().remove(part.name());

        let deallocated = self.inner.partitions.part_delete(part)?;
        if deallocated {
            let part_dir = self.part_dir(part);
            if part_dir.exists() {
                fs::remove_dir_all(&part_dir)?;
            }
            log::info!("partition '{}' deleted", part.name());
        } else {
            log::debug!("partition '{}' release recorded; still referenced", part.name());
        }
        Ok(())
    }

    fn primary(&self) -> Result<Partition> {
        if let Some(p) = self.inner.cached_primary.lock().clone() {
            return Ok(p);
        }
        self.inner
            .partitions
            .primary()?
            .ok_or_else(|| Error::InvalidArgument("container has no primary partition".into()))
    }

    /// Allocate a new object of `schema` in the primary partition. The
    /// container's free list (populated by `obj_put`) is drained here
    /// purely to bound its size; handle reuse is a performance
    /// optimization only (§9) and this crate's `Object` wrapper carries
    /// no state worth literally recycling, so a stale entry is just
    /// dropped rather than returned.
    pub fn obj_new(&self, schema: &Arc<Schema>) -> Result<Object> {
        let part = self.primary()?;
        let store = self.obj_store(&part)?;
        let oref = store.alloc(schema.obj_sz as u64)?;
        store.put(oref, &schema.id.to_le_bytes())?;

        self.inner.free_list.lock().pop();
        Ok(Object::new(store, schema.clone(), part.name().to_string(), part.obj_ref(), oref))
    }

    /// Resolve a persistent reference back to an object handle.
    /// Returns `None` (no error) if the partition or schema cannot be
    /// resolved, matching `obj_from_ref`'s "fail silent" contract.
    pub fn obj_from_ref(&self, r: ObjectRef) -> Option<Object> {
        if r.is_null() {
            return None;
        }
        let part = self
            .inner
            .partitions
            .iter_all()
            .ok()?
            .into_iter()
            .find(|p| p.obj_ref() == r.part)?;
        let store = self.obj_store(&part).ok()?;
        let raw = store.get(r.oref, 8).ok()?;
        let schema_id = u64::from_le_bytes(raw.try_into().ok()?);
        let schema = self.inner.schemas.schema_by_id(schema_id)?;
        Some(Object::new(store, schema, part.name().to_string(), r.part, r.oref))
    }

    /// Construct an object in-place from a fully-populated value list,
    /// attribute-by-attribute, then index it — the bulk-load counterpart
    /// to `obj_new` + repeated `set_by_name` + `obj_index`.
    pub fn obj_from_value(&self, schema: &Arc<Schema>, values: &[(&str, crate::object::Value)]) -> Result<Object> {
        let obj = self.obj_new(schema)?;
        for (name, value) in values {
            obj.set_by_name(name, value.clone())?;
        }
        self.obj_index(&obj)?;
        Ok(obj)
    }

    /// Insert `obj` into every indexed attribute's matching sub-tree.
    /// On partial failure the object remains indexed by the attributes
    /// already inserted (§7); the caller is responsible for a
    /// compensating `obj_remove`.
    pub fn obj_index(&self, obj: &Object) -> Result<()> {
        let part = self
            .inner
            .partitions
            .iter_all()?
            .into_iter()
            .find(|p| p.name() == obj.partition_name())
            .ok_or_else(|| Error::NotFound(format!("partition {}", obj.partition_name())))?;

        for attr in obj.schema().indexed_attrs() {
            let index = self.ensure_index(&part, obj.schema(), &attr.name)?;
            let tree = index
                .matching_idx_part(obj.obj_ref().part)
                .ok_or_else(|| Error::NotFound(format!("index partition for {}", attr.name)))?;
            let value = obj.get_by_name(&attr.name)?;
            log::debug!("obj_index {:?} attr '{}' into index '{}'", obj.obj_ref(), attr.name, index.name());
            if let Err(e) = tree.insert(&value.to_key_bytes(), obj.obj_ref().oref) {
                log::warn!(
                    "partial obj_index failure on attr '{}' for object {:?}: {} (object remains indexed by attributes already inserted)",
                    attr.name, obj.obj_ref(), e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove `obj` from every indexed attribute's matching sub-tree;
    /// the inverse of `obj_index`. A missing entry is treated as fatal,
    /// per §4.4.
    pub fn obj_remove(&self, obj: &Object) -> Result<()> {
        for attr in obj.schema().indexed_attrs() {
            let index = self
                .inner
                .indices
                .lock()
                .get(&Self::index_name(obj.schema(), &attr.name))
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("index {}", attr.name)))?;
            let tree = index
                .matching_idx_part(obj.obj_ref().part)
                .ok_or_else(|| Error::NotFound(format!("index partition for {}", attr.name)))?;
            let value = obj.get_by_name(&attr.name)?;
            tree.delete(&value.to_key_bytes())?;
        }
        Ok(())
    }

    /// Return a no-longer-needed object handle to the free list instead
    /// of releasing it to the system allocator, mirroring `obj_put`'s
    /// refcount-to-zero path. The handle itself is not deleted from
    /// disk; callers that want that call `Object::obj_delete` first.
    pub fn obj_put(&self, obj: Object) {
        self.inner.free_list.lock().push(obj);
    }

    /// Durability barrier over every open sub-object (§4.1).
    pub fn commit(&self, flags: CommitFlags) -> Result<()> {
        self.inner.config.commit(flags)?;
        self.inner.schemas.commit(flags)?;
        for store in self.inner.obj_stores.lock().values() {
            store.commit(flags)?;
        }
        for index in self.inner.indices.lock().values() {
            index.commit(flags)?;
        }
        Ok(())
    }

    /// Grow the primary partition's object file. Fails `InvalidArgument`
    /// if `new_size` is smaller than the current size, and explicitly
    /// (unlike the reference tool, which falls through the end of the
    /// function with no return statement when there is no primary —
    /// see DESIGN.md) returns `InvalidArgument` when there is no
    /// primary partition to extend.
    pub fn extend(&self, new_size: u64) -> Result<()> {
        let part = self.primary()?;
        let store = self.obj_store(&part)?;
        store.extend(new_size)
    }

    /// OS file stat of the primary partition's object file.
    pub fn stat(&self) -> Result<fs::Metadata> {
        let part = self.primary()?;
        let store = self.obj_store(&part)?;
        store.stat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object::Value, schema::AttrType};
    use tempfile::tempdir;

    fn sample_schema(c: &Container) -> Arc<Schema> {
        c.schema_add(
            "S",
            vec![
                AttrSpec::new("Id", AttrType::Uint32).indexed(),
                AttrSpec::new("V", AttrType::Uint64),
            ],
        )
        .unwrap()
    }

    #[test]
    fn create_add_schema_insert_lookup_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("c1");
        {
            let c = Container::create(&path, 0o750).unwrap();
            let schema = sample_schema(&c);
            let obj = c.obj_new(&schema).unwrap();
            obj.set_by_name("Id", Value::Uint32(42)).unwrap();
            obj.set_by_name("V", Value::Uint64(7)).unwrap();
            c.obj_index(&obj).unwrap();
            c.commit(CommitFlags::Sync).unwrap();
        }

        let c = Container::open(&path).unwrap();
        let schema = c.schema_by_name("S").unwrap();
        assert_eq!(schema.attrs.len(), 2);
    }

    #[test]
    fn obj_from_ref_round_trips_schema_and_attrs() {
        let dir = tempdir().unwrap();
        let c = Container::create(&dir.path().join("c1b"), 0o750).unwrap();
        let schema = sample_schema(&c);
        let obj = c.obj_new(&schema).unwrap();
        obj.set_by_name("Id", Value::Uint32(11)).unwrap();
        let r = obj.obj_ref();

        let back = c.obj_from_ref(r).unwrap();
        assert_eq!(back.schema().id, schema.id);
        assert_eq!(back.get_by_name("Id").unwrap(), Value::Uint32(11));
    }

    #[test]
    fn fresh_container_has_primary_root_partition() {
        let dir = tempdir().unwrap();
        let c = Container::create(&dir.path().join("c2"), 0o750).unwrap();
        let parts = c.partitions().unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].name(), ROOT_PARTITION);
        assert!(parts[0].is_primary() && parts[0].is_active());
    }

    #[test]
    fn partition_rollover_demotes_previous_primary() {
        let dir = tempdir().unwrap();
        let c = Container::create(&dir.path().join("c3"), 0o750).unwrap();
        let p2 = c.part_new("P2").unwrap();
        let p2 = c.part_primary_set(&p2).unwrap();
        assert!(p2.is_primary());

        let root = c
            .partitions()
            .unwrap()
            .into_iter()
            .find(|p| p.name() == ROOT_PARTITION)
            .unwrap();
        assert!(!root.is_primary());
        assert!(root.is_active());
    }

    #[test]
    fn duplicate_partition_name_rejected_with_no_residue() {
        let dir = tempdir().unwrap();
        let c = Container::create(&dir.path().join("c4"), 0o750).unwrap();
        c.part_new("P").unwrap();
        assert!(matches!(c.part_new("P"), Err(Error::AlreadyExists(_))));
        assert_eq!(c.partitions().unwrap().len(), 2); // __ROOT__ + P
    }

    #[test]
    fn part_delete_rejects_primary() {
        let dir = tempdir().unwrap();
        let c = Container::create(&dir.path().join("c6"), 0o750).unwrap();
        let root = c.partitions().unwrap().into_iter().find(|p| p.is_primary()).unwrap();
        assert!(c.part_delete(&root).is_err());
    }

    #[test]
    fn part_delete_removes_partition_and_its_index_files() {
        let dir = tempdir().unwrap();
        let c = Container::create(&dir.path().join("c7"), 0o750).unwrap();
        let _schema = sample_schema(&c);
        let p2 = c.part_new("P2").unwrap();

        // schema_add/part_new both materialize a sub-index for every
        // indexed attribute on every active partition.
        let index_path = dir.path().join("c7").join("P2").join("S.Id.idx");
        assert!(index_path.exists());

        c.part_delete(&p2).unwrap();
        assert!(!index_path.exists());
        assert!(!dir.path().join("c7").join("P2").exists());
        assert_eq!(c.partitions().unwrap().len(), 1);
    }

    #[test]
    fn obj_index_then_remove_round_trips_cleanly() {
        let dir = tempdir().unwrap();
        let c = Container::create(&dir.path().join("c5"), 0o750).unwrap();
        let schema = sample_schema(&c);

        let obj = c.obj_new(&schema).unwrap();
        obj.set_by_name("Id", Value::Uint32(9)).unwrap();
        obj.set_by_name("V", Value::Uint64(1)).unwrap();
        c.obj_index(&obj).unwrap();
        c.obj_remove(&obj).unwrap();

        // Re-indexing after a clean remove must succeed again.
        c.obj_index(&obj).unwrap();
    }
}
