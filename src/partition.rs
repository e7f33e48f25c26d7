//! Partition metadata: a persistent, doubly-linked list rooted at the
//! container's `part` sub-object, mutated under a list-wide lock (see
//! [`crate::spinlock`]).
//!
//! Exactly one partition may carry the `PRIMARY` bit at any moment
//! (the partition new objects are allocated into); any number may
//! carry `ACTIVE` (still readable/indexable). `PRIMARY` implies
//! `ACTIVE`.
//!
//! Every partition record carries a persistent refcount, seeded to 1
//! at `part_new` (the list's own hold on the record). `first`/`next`
//! hand back refcounted snapshots: each acquires a reference on the
//! partition it returns, and `next` releases the reference on the
//! partition it is advancing past before acquiring the next one. A
//! partition is unlinked and its record deallocated only once its
//! refcount falls to zero, which `part_delete` drives by releasing the
//! list's own hold.

use std::{convert::TryInto, fs, path::Path};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    store::{ObjRef, Store},
};

const SIGNATURE: u64 = 0x534f535f50415254; // "SOS_PART" little-endian tag
const NAME_CAP: usize = 64;
const RECORD_LEN: u64 = NAME_CAP as u64 + 1 + 3 + 4 + 8 + 8;

bitflags! {
    /// Partition lifecycle state. `PRIMARY` without `ACTIVE` is not a
    /// reachable state — every transition that sets `PRIMARY` also
    /// sets `ACTIVE`.
    pub struct PartitionState: u8 {
        const OFFLINE = 0b000;
        const ACTIVE  = 0b001;
        const PRIMARY = 0b010;
    }
}

/// A refcounted snapshot of one partition's metadata, safe to hold
/// across a container mutation (an iterator holding one defers
/// concurrent deletion — see the module doc comment).
#[derive(Clone, Debug)]
pub struct Partition {
    r: ObjRef,
    name: String,
    state: PartitionState,
}

impl Partition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn is_primary(&self) -> bool {
        self.state.contains(PartitionState::PRIMARY)
    }

    pub fn is_active(&self) -> bool {
        self.state.contains(PartitionState::ACTIVE)
    }

    /// This partition's own persistent ref within the `part` store,
    /// used as the stable partition component of an
    /// [`crate::object::ObjectRef`] and as the key
    /// [`crate::index::Index`] uses to pick a matching sub-tree.
    pub fn obj_ref(&self) -> ObjRef {
        self.r
    }
}

struct UserData {
    primary: ObjRef,
    head: ObjRef,
    tail: ObjRef,
}

fn decode_user_data(raw: &[u8]) -> Result<UserData> {
    let mut rest = raw;
    let sig = rest
        .read_u64::<LittleEndian>()
        .map_err(|e| Error::Corruption(e.to_string()))?;
    if sig != SIGNATURE {
        log::error!("bad partition-list signature");
        return Err(Error::Corruption("bad partition-list signature".into()));
    }
    let primary = rest.read_u64::<LittleEndian>().unwrap();
    let head = rest.read_u64::<LittleEndian>().unwrap();
    let tail = rest.read_u64::<LittleEndian>().unwrap();
    Ok(UserData {
        primary: ObjRef(primary),
        head: ObjRef(head),
        tail: ObjRef(tail),
    })
}

fn encode_user_data(ud: &UserData) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.write_u64::<LittleEndian>(SIGNATURE).unwrap();
    buf.write_u64::<LittleEndian>(ud.primary.0).unwrap();
    buf.write_u64::<LittleEndian>(ud.head.0).unwrap();
    buf.write_u64::<LittleEndian>(ud.tail.0).unwrap();
    buf
}

/// The persistent partition list belonging to one container, plus the
/// lock serializing mutations to it.
///
/// The spec calls for a process-shared spin-lock embedded in the
/// `part` user-data (mutations must be serialized across processes
/// mapping the same container file). This implementation's [`Store`]
/// is plain file I/O rather than a shared mapping, so true cross-process
/// mutual exclusion would require the page-store-level mmap support
/// that spec.md places out of scope; here the list is additionally
/// guarded by an in-process [`Mutex`], and a [`crate::spinlock::PartLock`]-shaped
/// word is reserved in the on-disk format so a future mmap-backed store
/// can upgrade to real cross-process exclusion without a format change.
pub struct PartitionList {
    store: Store,
    guard: Mutex<()>,
}

impl PartitionList {
    pub fn create(path: &Path) -> Result<PartitionList> {
        let store = Store::create(path, RECORD_LEN)?;
        store.set_user_data(&encode_user_data(&UserData {
            primary: ObjRef::NULL,
            head: ObjRef::NULL,
            tail: ObjRef::NULL,
        }))?;
        Ok(PartitionList {
            store,
            guard: Mutex::new(()),
        })
    }

    pub fn open(path: &Path) -> Result<PartitionList> {
        let store = Store::open(path)?;
        decode_user_data(&store.user_data()?)?; // validates signature
        Ok(PartitionList {
            store,
            guard: Mutex::new(()),
        })
    }

    /// Returns `(name, state, refcount, prev, next)`.
    fn read_record(&self, r: ObjRef) -> Result<(String, PartitionState, u32, ObjRef, ObjRef)> {
        let raw = self.store.get(r, RECORD_LEN as usize)?;
        let end = raw[..NAME_CAP]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(NAME_CAP);
        let name = String::from_utf8_lossy(&raw[..end]).into_owned();
        let state = PartitionState::from_bits_truncate(raw[NAME_CAP]);
        let mut rest = &raw[NAME_CAP + 1 + 3..];
        let refcount = rest.read_u32::<LittleEndian>().unwrap();
        let prev = rest.read_u64::<LittleEndian>().unwrap();
        let next = rest.read_u64::<LittleEndian>().unwrap();
        Ok((name, state, refcount, ObjRef(prev), ObjRef(next)))
    }

    fn write_record(
        &self,
        r: ObjRef,
        name: &str,
        state: PartitionState,
        refcount: u32,
        prev: ObjRef,
        next: ObjRef,
    ) -> Result<()> {
        let mut buf = Vec::with_capacity(RECORD_LEN as usize);
        let mut padded = name.as_bytes().to_vec();
        padded.resize(NAME_CAP, 0);
        buf.extend_from_slice(&padded);
        buf.push(state.bits());
        buf.extend_from_slice(&[0u8; 3]);
        buf.write_u32::<LittleEndian>(refcount).unwrap();
        buf.write_u64::<LittleEndian>(prev.0).unwrap();
        buf.write_u64::<LittleEndian>(next.0).unwrap();
        self.store.put(r, &buf)
    }

    fn user_data(&self) -> Result<UserData> {
        decode_user_data(&self.store.user_data()?)
    }

    fn set_user_data(&self, ud: &UserData) -> Result<()> {
        self.store.set_user_data(&encode_user_data(ud))
    }

    /// Increment `r`'s persistent refcount by one, for a snapshot that
    /// must outlive the caller's own traversal step.
    fn acquire(&self, r: ObjRef) -> Result<()> {
        let (name, state, refcount, prev, next) = self.read_record(r)?;
        self.write_record(r, &name, state, refcount + 1, prev, next)
    }

    /// Decrement `r`'s persistent refcount by one, unlinking and
    /// freeing the record once it reaches zero. Returns whether the
    /// record was deallocated.
    fn release(&self, r: ObjRef) -> Result<bool> {
        let (name, state, refcount, prev, next) = self.read_record(r)?;
        let refcount = refcount.saturating_sub(1);
        if refcount == 0 {
            self.unlink_and_free(r, prev, next)?;
            return Ok(true);
        }
        self.write_record(r, &name, state, refcount, prev, next)?;
        Ok(false)
    }

    /// Splice `r` out of the list, fixing up neighbor links and the
    /// head/tail/primary pointers, then return its slot to the
    /// backing store's free list.
    fn unlink_and_free(&self, r: ObjRef, prev: ObjRef, next: ObjRef) -> Result<()> {
        if !prev.is_null() {
            let (pname, pstate, prefcount, pprev, _) = self.read_record(prev)?;
            self.write_record(prev, &pname, pstate, prefcount, pprev, next)?;
        }
        if !next.is_null() {
            let (nname, nstate, nrefcount, _, nnext) = self.read_record(next)?;
            self.write_record(next, &nname, nstate, nrefcount, prev, nnext)?;
        }
        let ud = self.user_data()?;
        let head = if ud.head == r { next } else { ud.head };
        let tail = if ud.tail == r { prev } else { ud.tail };
        let primary = if ud.primary == r { ObjRef::NULL } else { ud.primary };
        self.set_user_data(&UserData { primary, head, tail })?;
        self.store.free(r);
        Ok(())
    }

    /// Create a new, `OFFLINE` partition named `name`, with its
    /// directory under `container_dir`, seeded with refcount=1 (the
    /// list's own hold on the record). Rejects a filesystem or list
    /// collision with `AlreadyExists` and leaves no residue on either
    /// failure path.
    pub fn part_new(&self, container_dir: &Path, name: &str) -> Result<Partition> {
        if name.len() >= NAME_CAP {
            return Err(Error::InvalidArgument(format!(
                "partition name {} exceeds {} bytes",
                name, NAME_CAP
            )));
        }
        let _guard = self.guard.lock();

        let part_dir = container_dir.join(name);
        if part_dir.exists() {
            return Err(Error::AlreadyExists(part_dir.display().to_string()));
        }

        let mut cur = self.user_data()?.head;
        while !cur.is_null() {
            let (existing, _, _, _, next) = self.read_record(cur)?;
            if existing == name {
                return Err(Error::AlreadyExists(format!("partition {}", name)));
            }
            cur = next;
        }

        let ud = self.user_data()?;
        let r = self.store.alloc(RECORD_LEN)?;
        self.write_record(r, name, PartitionState::OFFLINE, 1, ud.tail, ObjRef::NULL)?;
        if !ud.tail.is_null() {
            let (tname, tstate, trefcount, tprev, _) = self.read_record(ud.tail)?;
            self.write_record(ud.tail, &tname, tstate, trefcount, tprev, r)?;
        }
        let head = if ud.head.is_null() { r } else { ud.head };
        self.set_user_data(&UserData {
            primary: ud.primary,
            head,
            tail: r,
        })?;

        fs::create_dir_all(&part_dir)?;

        Ok(Partition {
            r,
            name: name.to_string(),
            state: PartitionState::OFFLINE,
        })
    }

    /// First partition in list order, or `None` if the container has
    /// no partitions yet. Acquires a reference on the partition
    /// returned.
    pub fn first(&self) -> Result<Option<Partition>> {
        let _guard = self.guard.lock();
        let head = self.user_data()?.head;
        if head.is_null() {
            return Ok(None);
        }
        self.acquire(head)?;
        let (name, state, _, _, _) = self.read_record(head)?;
        Ok(Some(Partition { r: head, name, state }))
    }

    /// Partition following `part` in list order, or `None` at the end
    /// of the list. Releases the reference held for `part` (unlinking
    /// and deallocating it if that was its last reference) before
    /// acquiring one on the partition returned.
    pub fn next(&self, part: &Partition) -> Result<Option<Partition>> {
        let _guard = self.guard.lock();
        let (_, _, _, _, next) = self.read_record(part.r)?;
        self.release(part.r)?;
        if next.is_null() {
            return Ok(None);
        }
        self.acquire(next)?;
        let (name, state, _, _, _) = self.read_record(next)?;
        Ok(Some(Partition { r: next, name, state }))
    }

    /// All partitions, head to tail.
    pub fn iter_all(&self) -> Result<Vec<Partition>> {
        let mut out = Vec::new();
        let mut cur = self.first()?;
        while let Some(p) = cur {
            cur = self.next(&p)?;
            out.push(p);
        }
        Ok(out)
    }

    /// Demote the previous primary (if any) and promote `part` to
    /// `PRIMARY | ACTIVE`.
    pub fn part_primary_set(&self, part: &Partition) -> Result<Partition> {
        let _guard = self.guard.lock();
        let ud = self.user_data()?;
        if !ud.primary.is_null() && ud.primary != part.r {
            let (pname, pstate, prefcount, pprev, pnext) = self.read_record(ud.primary)?;
            self.write_record(
                ud.primary,
                &pname,
                pstate & !PartitionState::PRIMARY,
                prefcount,
                pprev,
                pnext,
            )?;
        }
        let (name, _, refcount, prev, next) = self.read_record(part.r)?;
        let state = PartitionState::PRIMARY | PartitionState::ACTIVE;
        self.write_record(part.r, &name, state, refcount, prev, next)?;
        self.set_user_data(&UserData {
            primary: part.r,
            head: ud.head,
            tail: ud.tail,
        })?;
        log::info!("partition '{}' promoted to primary", name);
        Ok(Partition { r: part.r, name, state })
    }

    /// Flip `ACTIVE` on `part`. Rejects taking the primary partition
    /// offline, since `PRIMARY` implies `ACTIVE`.
    pub fn part_active_set(&self, part: &Partition, online: bool) -> Result<Partition> {
        let _guard = self.guard.lock();
        let (name, state, refcount, prev, next) = self.read_record(part.r)?;
        if !online && state.contains(PartitionState::PRIMARY) {
            return Err(Error::InvalidArgument(
                "cannot take the primary partition offline".into(),
            ));
        }
        let state = if online {
            state | PartitionState::ACTIVE
        } else {
            state & !PartitionState::ACTIVE
        };
        self.write_record(part.r, &name, state, refcount, prev, next)?;
        Ok(Partition { r: part.r, name, state })
    }

    pub fn primary(&self) -> Result<Option<Partition>> {
        let ud = self.user_data()?;
        if ud.primary.is_null() {
            return Ok(None);
        }
        let (name, state, _, _, _) = self.read_record(ud.primary)?;
        Ok(Some(Partition { r: ud.primary, name, state }))
    }

    /// Release the list's own hold on `part` (established at
    /// `part_new` with refcount=1). Rejects deleting the primary
    /// partition, since the container always needs a live one to
    /// allocate into. Returns whether the record was unlinked and
    /// deallocated immediately (no other live snapshot was still
    /// holding a reference) — `false` means a concurrently-held
    /// iterator snapshot still references the record, which will be
    /// deallocated once that snapshot is advanced past.
    pub fn part_delete(&self, part: &Partition) -> Result<bool> {
        let _guard = self.guard.lock();
        let (_, state, _, _, _) = self.read_record(part.r)?;
        if state.contains(PartitionState::PRIMARY) {
            return Err(Error::InvalidArgument(
                "cannot delete the primary partition".into(),
            ));
        }
        self.release(part.r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn part_new_then_primary_set_demotes_previous() {
        let dir = tempdir().unwrap();
        let list = PartitionList::create(&dir.path().join("part")).unwrap();

        let root = list.part_new(dir.path(), "__ROOT__").unwrap();
        let root = list.part_primary_set(&root).unwrap();
        assert!(root.is_primary() && root.is_active());

        let p2 = list.part_new(dir.path(), "P2").unwrap();
        let p2 = list.part_primary_set(&p2).unwrap();
        assert!(p2.is_primary());

        let root_again = list.iter_all().unwrap().into_iter().find(|p| p.name() == "__ROOT__").unwrap();
        assert!(!root_again.is_primary());
        assert!(root_again.is_active());
    }

    #[test]
    fn duplicate_partition_name_is_already_exists() {
        let dir = tempdir().unwrap();
        let list = PartitionList::create(&dir.path().join("part")).unwrap();
        list.part_new(dir.path(), "P").unwrap();
        let err = list.part_new(dir.path(), "P").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(list.iter_all().unwrap().len(), 1);
    }

    #[test]
    fn cannot_take_primary_offline() {
        let dir = tempdir().unwrap();
        let list = PartitionList::create(&dir.path().join("part")).unwrap();
        let p = list.part_new(dir.path(), "P").unwrap();
        let p = list.part_primary_set(&p).unwrap();
        assert!(list.part_active_set(&p, false).is_err());
    }

    #[test]
    fn cannot_delete_primary_partition() {
        let dir = tempdir().unwrap();
        let list = PartitionList::create(&dir.path().join("part")).unwrap();
        let p = list.part_new(dir.path(), "P").unwrap();
        let p = list.part_primary_set(&p).unwrap();
        assert!(list.part_delete(&p).is_err());
    }

    #[test]
    fn part_delete_unlinks_non_primary_partition() {
        let dir = tempdir().unwrap();
        let list = PartitionList::create(&dir.path().join("part")).unwrap();
        let root = list.part_new(dir.path(), "__ROOT__").unwrap();
        let root = list.part_primary_set(&root).unwrap();
        let p2 = list.part_new(dir.path(), "P2").unwrap();

        let deallocated = list.part_delete(&p2).unwrap();
        assert!(deallocated);

        let names: Vec<String> = list.iter_all().unwrap().into_iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec![root.name().to_string()]);
    }

    #[test]
    fn part_delete_deferred_while_iterator_holds_a_reference() {
        let dir = tempdir().unwrap();
        let list = PartitionList::create(&dir.path().join("part")).unwrap();
        let root = list.part_new(dir.path(), "__ROOT__").unwrap();
        list.part_primary_set(&root).unwrap();
        let p2 = list.part_new(dir.path(), "P2").unwrap();

        // `first`/`next` each acquire a reference; hold one live on P2
        // via `first` while `part_delete` releases the list's own hold.
        let held = list.first().unwrap().unwrap(); // __ROOT__, refcount 2
        let held = list.next(&held).unwrap().unwrap(); // releases __ROOT__, acquires P2 (refcount 2)
        assert_eq!(held.name(), "P2");

        let deallocated = list.part_delete(&p2).unwrap();
        assert!(!deallocated, "P2 is still referenced by `held`");
        assert_eq!(list.iter_all().unwrap().len(), 2);
    }
}
