//! Proto Core: the value representation of the Proto runtime
//!
//! This crate is the dependency-free foundation shared by the managed runtime
//! and any native front-end:
//!
//! - `value`: the pointer-tagged 8-byte value word (14 pointer tags, 8
//!   embedded scalar types, branch-free hashing)
//! - `utf8`: lead-byte-classified UTF-8 decoding into code points
//!
//! Nothing in this crate allocates; heap cells and their management live in
//! `proto-runtime`.

pub mod utf8;
pub mod value;

// Re-export key types
pub use value::{
    ADDRESS_MASK, EmbeddedType, MAX_SMALL_INT, MAX_TIMESTAMP, MIN_SMALL_INT, PointerTag, TAG_MASK,
    Value,
};
