//! Proto Runtime: a prototype-based object model on a managed cell heap
//!
//! Every value is a pointer-tagged 8-byte word: an embedded scalar or a
//! reference to a 64-byte cell. Cells are immutable after construction and
//! belong to a concurrent, stop-the-world mark/sweep collector fed by
//! per-frame allocation chains and thread-local cell pools.
//!
//! # Modules
//!
//! - `cell`: the 64-byte cell and its per-variant reference traversal
//! - `context`: per-frame allocation chains, locals roots, constructors
//! - `list`: persistent ordered list (height-balanced, path-copying)
//! - `sparse`: persistent sparse map keyed by 64-bit index
//! - `tuple`: interned tuples and the process-wide tuple dictionary
//! - `string`: strings as tuples of code points, canonical by content
//! - `object`: prototype objects, parent chains, the mutable-ref table
//! - `method`, `buffer`: native methods, byte buffers, external pointers
//! - `space`: the process-wide heap, registry, roots and configuration
//! - `gc`: the collector thread (safepoint handshake, mark, sweep)
//! - `thread`: thread lifecycle and the per-thread method cache
//! - `report`, `diagnostics`: at-exit KPIs and SIGQUIT dumps

pub mod buffer;
pub mod cell;
pub mod context;
pub mod diagnostics;
pub mod gc;
pub mod list;
pub mod method;
pub mod object;
pub mod report;
pub mod space;
pub mod sparse;
pub mod string;
pub mod thread;
pub mod tuple;

// Re-export key types
pub use buffer::{ProtoByteBuffer, ProtoExternalPointer};
pub use context::Context;
pub use list::{ProtoList, ProtoListIterator};
pub use method::{ProtoMethod, ProtoMethodCell};
pub use object::ProtoObject;
pub use proto_core::{EmbeddedType, PointerTag, Value};
pub use space::{Space, SpaceConfig};
pub use sparse::{ProtoSparseMap, ProtoSparseMapIterator};
pub use string::{ProtoString, ProtoStringIterator};
pub use thread::{ProtoThread, call};
pub use tuple::{ProtoTuple, ProtoTupleIterator};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::context::Context;
    use crate::space::{Space, SpaceConfig};

    /// Run a test body inside a fresh Space with an adopted, registered
    /// thread and its root frame.
    pub(crate) fn with_context<R>(f: impl FnOnce(&mut Context) -> R) -> R {
        let space = Space::new(SpaceConfig::default());
        let thread = space.adopt_current_thread("unit-test");
        let result = {
            let mut ctx = space.root_context(thread);
            let result = f(&mut ctx);
            space.release_current_thread(&mut ctx);
            result
        };
        result
    }
}
