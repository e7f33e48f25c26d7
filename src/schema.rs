//! The schema registry: a persistent dictionary of typed attribute
//! lists, indexed in memory by name and by numeric id.
//!
//! Schema ids are monotonic starting at [`FIRST_USER`] and are never
//! renumbered; deleting the last live object of a schema does not
//! delete the schema itself (a schema's lifetime is its longest
//! holder, tracked with [`std::sync::Arc`] standing in for the
//! spec's manual `schema_get`/`schema_put` refcount).

use std::{
    collections::BTreeMap,
    convert::TryInto,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        Arc,
    },
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, RwLock};

use crate::{
    bxtree::Tree,
    error::{Error, Result},
    store::{ObjRef, Store},
};

const SIGNATURE: u64 = 0x534f535f534348; // "SOS_SCH" tag
const VERSION: u32 = 1;

/// Numeric ids below this value are reserved for built-in use; the
/// first schema a caller adds gets this id.
pub const FIRST_USER: u64 = 10;

/// The scalar type an attribute holds. `array` on [`Attr`] additionally
/// marks `Bytes`/`Str` (and, in principle, any type) as stored
/// out-of-band via a persistent reference rather than inline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrType {
    Uint32,
    Uint64,
    Int32,
    Int64,
    Float,
    Double,
    Str,
    Bytes,
}

impl AttrType {
    fn tag(self) -> u8 {
        match self {
            AttrType::Uint32 => 0,
            AttrType::Uint64 => 1,
            AttrType::Int32 => 2,
            AttrType::Int64 => 3,
            AttrType::Float => 4,
            AttrType::Double => 5,
            AttrType::Str => 6,
            AttrType::Bytes => 7,
        }
    }

    fn from_tag(tag: u8) -> Result<AttrType> {
        Ok(match tag {
            0 => AttrType::Uint32,
            1 => AttrType::Uint64,
            2 => AttrType::Int32,
            3 => AttrType::Int64,
            4 => AttrType::Float,
            5 => AttrType::Double,
            6 => AttrType::Str,
            7 => AttrType::Bytes,
            _ => return Err(Error::Corruption(format!("unknown attr type tag {}", tag))),
        })
    }

    /// Inline slot width. Array-backed attributes (§4.4a) are always
    /// an 8-byte persistent reference regardless of type.
    fn inline_width(self) -> u32 {
        match self {
            AttrType::Uint32 | AttrType::Int32 | AttrType::Float => 4,
            AttrType::Uint64 | AttrType::Int64 | AttrType::Double => 8,
            AttrType::Str | AttrType::Bytes => 8, // out-of-band ref
        }
    }
}

/// One attribute of a [`Schema`]: a name, a type, whether it is
/// indexed, and its offset/size within the object payload.
#[derive(Clone, Debug)]
pub struct Attr {
    pub name: String,
    pub type_tag: AttrType,
    pub array: bool,
    pub indexed: bool,
    pub offset: u32,
    pub size: u32,
}

/// A caller-supplied attribute definition, before offsets are assigned.
#[derive(Clone, Debug)]
pub struct AttrSpec {
    pub name: String,
    pub type_tag: AttrType,
    pub array: bool,
    pub indexed: bool,
}

impl AttrSpec {
    pub fn new(name: &str, type_tag: AttrType) -> AttrSpec {
        AttrSpec {
            name: name.to_string(),
            type_tag,
            array: false,
            indexed: false,
        }
    }

    pub fn indexed(mut self) -> AttrSpec {
        self.indexed = true;
        self
    }

    pub fn array(mut self) -> AttrSpec {
        self.array = true;
        self
    }
}

/// A versioned description of an object's attributes.
#[derive(Clone, Debug)]
pub struct Schema {
    pub id: u64,
    pub name: String,
    pub attrs: Vec<Attr>,
    pub obj_sz: u32,
}

impl Schema {
    pub fn attr_by_name(&self, name: &str) -> Option<&Attr> {
        self.attrs.iter().find(|a| a.name == name)
    }

    pub fn indexed_attrs(&self) -> impl Iterator<Item = &Attr> {
        self.attrs.iter().filter(|a| a.indexed)
    }

    fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.write_u64::<LittleEndian>(self.id).unwrap();
        write_str(&mut body, &self.name);
        body.write_u32::<LittleEndian>(self.obj_sz).unwrap();
        body.write_u16::<LittleEndian>(self.attrs.len() as u16).unwrap();
        for attr in &self.attrs {
            write_str(&mut body, &attr.name);
            body.push(attr.type_tag.tag());
            body.push(attr.array as u8);
            body.push(attr.indexed as u8);
            body.write_u32::<LittleEndian>(attr.offset).unwrap();
            body.write_u32::<LittleEndian>(attr.size).unwrap();
        }
        let mut framed = Vec::with_capacity(body.len() + 4);
        framed.write_u32::<LittleEndian>(body.len() as u32).unwrap();
        framed.extend_from_slice(&body);
        framed
    }

    fn decode(mut buf: &[u8]) -> Result<Schema> {
        let id = buf
            .read_u64::<LittleEndian>()
            .map_err(|e| Error::Corruption(e.to_string()))?;
        let name = read_str(&mut buf)?;
        let obj_sz = buf
            .read_u32::<LittleEndian>()
            .map_err(|e| Error::Corruption(e.to_string()))?;
        let count = buf
            .read_u16::<LittleEndian>()
            .map_err(|e| Error::Corruption(e.to_string()))?;
        let mut attrs = Vec::with_capacity(count.into());
        for _ in 0..count {
            let name = read_str(&mut buf)?;
            let type_tag = AttrType::from_tag(
                *buf.get(0).ok_or_else(|| Error::Corruption("truncated attr".into()))?,
            )?;
            buf = &buf[1..];
            let array = buf[0] != 0;
            let indexed = buf[1] != 0;
            buf = &buf[2..];
            let offset = buf
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::Corruption(e.to_string()))?;
            let size = buf
                .read_u32::<LittleEndian>()
                .map_err(|e| Error::Corruption(e.to_string()))?;
            attrs.push(Attr {
                name,
                type_tag,
                array,
                indexed,
                offset,
                size,
            });
        }
        Ok(Schema {
            id,
            name,
            attrs,
            obj_sz,
        })
    }
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.write_u16::<LittleEndian>(s.len() as u16).unwrap();
    buf.extend_from_slice(s.as_bytes());
}

fn read_str(buf: &mut &[u8]) -> Result<String> {
    let len = buf
        .read_u16::<LittleEndian>()
        .map_err(|e| Error::Corruption(e.to_string()))? as usize;
    if buf.len() < len {
        return Err(Error::Corruption("truncated string".into()));
    }
    let s = String::from_utf8_lossy(&buf[..len]).into_owned();
    *buf = &buf[len..];
    Ok(s)
}

/// `{signature, version, last_schema_id}` persisted in the `schemas`
/// store's user-data.
struct UserData {
    version: u32,
    last_schema_id: u64,
}

fn decode_user_data(raw: &[u8]) -> Result<UserData> {
    let mut rest = raw;
    let sig = rest
        .read_u64::<LittleEndian>()
        .map_err(|e| Error::Corruption(e.to_string()))?;
    if sig != SIGNATURE {
        log::error!("bad schema-store signature");
        return Err(Error::Corruption("bad schema-store signature".into()));
    }
    let version = rest.read_u32::<LittleEndian>().unwrap();
    if version != VERSION {
        return Err(Error::InvalidArgument(format!(
            "schema store version {} unsupported",
            version
        )));
    }
    let last_schema_id = rest.read_u64::<LittleEndian>().unwrap();
    Ok(UserData {
        version,
        last_schema_id,
    })
}

fn encode_user_data(ud: &UserData) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20);
    buf.write_u64::<LittleEndian>(SIGNATURE).unwrap();
    buf.write_u32::<LittleEndian>(ud.version).unwrap();
    buf.write_u64::<LittleEndian>(ud.last_schema_id).unwrap();
    buf
}

/// The container's schema dictionary: persisted definitions plus two
/// in-memory ordered maps for O(log n) lookup by name and by id.
pub struct SchemaRegistry {
    store: Store,
    name_idx: Tree,
    by_name: RwLock<BTreeMap<String, Arc<Schema>>>,
    by_id: RwLock<BTreeMap<u64, Arc<Schema>>>,
    next_id: AtomicU64,
    add_lock: Mutex<()>,
}

impl SchemaRegistry {
    pub fn create(dir: &Path) -> Result<SchemaRegistry> {
        let store = Store::create(&dir.join("schemas"), 0)?;
        store.set_user_data(&encode_user_data(&UserData {
            version: VERSION,
            last_schema_id: FIRST_USER - 1,
        }))?;
        let name_idx = Tree::new(&dir.join("schema_idx"), "STRING", 5)?;
        Ok(SchemaRegistry {
            store,
            name_idx,
            by_name: RwLock::new(BTreeMap::new()),
            by_id: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(FIRST_USER),
            add_lock: Mutex::new(()),
        })
    }

    pub fn open(dir: &Path) -> Result<SchemaRegistry> {
        let store = Store::open(&dir.join("schemas"))?;
        let ud = decode_user_data(&store.user_data()?)?;
        let name_idx = Tree::open(&dir.join("schema_idx"))?;

        let by_name = RwLock::new(BTreeMap::new());
        let by_id = RwLock::new(BTreeMap::new());
        let registry = SchemaRegistry {
            store,
            name_idx,
            by_name,
            by_id,
            next_id: AtomicU64::new(ud.last_schema_id + 1),
            add_lock: Mutex::new(()),
        };
        registry.rebuild_from_index()?;
        Ok(registry)
    }

    fn rebuild_from_index(&self) -> Result<()> {
        for (_, r) in self.name_idx.iter() {
            let len_hdr = self.store.get(r, 4)?;
            let len = u32::from_le_bytes(len_hdr.as_slice().try_into().unwrap()) as usize;
            let framed = self.store.get(r, 4 + len)?;
            let schema = Arc::new(Schema::decode(&framed[4..])?);
            self.by_name.write().insert(schema.name.clone(), schema.clone());
            self.by_id.write().insert(schema.id, schema);
        }
        Ok(())
    }

    /// Append a new schema with computed attribute offsets, persist
    /// it, and index it by name and by id. Fails `AlreadyExists` if
    /// the name is taken.
    pub fn schema_add(&self, name: &str, specs: Vec<AttrSpec>) -> Result<Arc<Schema>> {
        let _guard = self.add_lock.lock();
        if self.by_name.read().contains_key(name) {
            return Err(Error::AlreadyExists(format!("schema {}", name)));
        }

        let mut offset = 8u32; // persistent header: schema id
        let mut attrs = Vec::with_capacity(specs.len());
        for spec in specs {
            let size = if spec.array { 8 } else { spec.type_tag.inline_width() };
            attrs.push(Attr {
                name: spec.name,
                type_tag: spec.type_tag,
                array: spec.array,
                indexed: spec.indexed,
                offset,
                size,
            });
            offset += size;
        }

        let id = self.next_id.fetch_add(1, SeqCst);
        let schema = Arc::new(Schema {
            id,
            name: name.to_string(),
            attrs,
            obj_sz: offset,
        });

        let framed = schema.encode();
        let r = self.store.alloc(framed.len() as u64)?;
        self.store.put(r, &framed)?;
        self.name_idx.insert(format!("{}\0", name).as_bytes(), r)?;
        self.store.set_user_data(&encode_user_data(&UserData {
            version: VERSION,
            last_schema_id: id,
        }))?;

        self.by_name.write().insert(schema.name.clone(), schema.clone());
        self.by_id.write().insert(schema.id, schema.clone());
        log::info!("schema '{}' added with id {}", schema.name, schema.id);
        Ok(schema)
    }

    pub fn schema_by_name(&self, name: &str) -> Option<Arc<Schema>> {
        self.by_name.read().get(name).cloned()
    }

    pub fn schema_by_id(&self, id: u64) -> Option<Arc<Schema>> {
        self.by_id.read().get(&id).cloned()
    }

    /// Every schema currently in the dictionary, in id order.
    pub fn schemas(&self) -> Vec<Arc<Schema>> {
        self.by_id.read().values().cloned().collect()
    }

    /// Explicit refcount-hold, mirroring `schema_get`. A thin wrapper
    /// over `Arc::clone` — holding code should still call this (rather
    /// than cloning the `Arc` directly) so the call site reads the
    /// same as the spec's API.
    pub fn schema_get(schema: &Arc<Schema>) -> Arc<Schema> {
        schema.clone()
    }

    /// Mirrors `schema_put`; dropping the returned value releases the
    /// hold.
    pub fn schema_put(_schema: Arc<Schema>) {}

    pub fn commit(&self, flags: crate::store::CommitFlags) -> Result<()> {
        self.name_idx.commit(flags)?;
        self.store.commit(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_specs() -> Vec<AttrSpec> {
        vec![
            AttrSpec::new("Id", AttrType::Uint32).indexed(),
            AttrSpec::new("V", AttrType::Uint64),
        ]
    }

    #[test]
    fn add_then_lookup_by_name_and_id_agree() {
        let dir = tempdir().unwrap();
        let reg = SchemaRegistry::create(dir.path()).unwrap();
        let s = reg.schema_add("S", sample_specs()).unwrap();
        let by_name = reg.schema_by_name("S").unwrap();
        let by_id = reg.schema_by_id(s.id).unwrap();
        assert_eq!(by_name.id, by_id.id);
        assert_eq!(by_name.id, s.id);
        assert_eq!(s.id, FIRST_USER);
    }

    #[test]
    fn duplicate_schema_name_rejected() {
        let dir = tempdir().unwrap();
        let reg = SchemaRegistry::create(dir.path()).unwrap();
        reg.schema_add("S", sample_specs()).unwrap();
        assert!(matches!(
            reg.schema_add("S", sample_specs()),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn reopen_restores_schema_dictionary() {
        let dir = tempdir().unwrap();
        {
            let reg = SchemaRegistry::create(dir.path()).unwrap();
            reg.schema_add("S", sample_specs()).unwrap();
            reg.commit(crate::store::CommitFlags::Sync).unwrap();
        }
        let reg = SchemaRegistry::open(dir.path()).unwrap();
        let s = reg.schema_by_name("S").unwrap();
        assert_eq!(s.id, FIRST_USER);
        assert_eq!(s.attrs.len(), 2);
    }
}
