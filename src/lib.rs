//! SOS is a persistent, schema-driven object store for high-throughput
//! ingest of structured telemetry: per-job/per-component time-series
//! samples keyed and indexed for fast random and ordered access.
//!
//! A [`container::Container`] groups typed objects with the indices
//! that make them findable. Objects conform to a [`schema::Schema`]
//! registered in the container's dictionary; they live in one of the
//! container's [`partition::Partition`]s, exactly one of which is
//! `PRIMARY` (receives new writes) at any moment. Attributes marked
//! indexed are kept in an ordered [`index::Index`] — one B+-tree-backed
//! [`bxtree::Tree`] per partition — under a pluggable
//! [`comparator::Comparator`].
//!
//! On-disk allocation is provided by [`store::Store`], a single-file
//! allocator standing in for the external page store this design
//! assumes; see each module's doc comment for what it simplifies and
//! why.

mod bxtree;
pub mod cli;
pub mod comparator;
pub mod config;
pub mod container;
pub mod error;
pub mod index;
pub mod key;
pub mod object;
pub mod partition;
pub mod schema;
pub mod spinlock;
pub mod store;
mod util;

pub use crate::{
    container::Container,
    error::{Error, Result},
    object::{Object, ObjectRef, Value},
    partition::{Partition, PartitionState},
    schema::{AttrSpec, AttrType, Schema, SchemaRegistry},
};
