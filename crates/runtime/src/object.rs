//! Prototype Object Model
//!
//! An object cell carries the head of its parent chain, a mutable-reference
//! id and its own-attribute sparse map (attribute-name hash to value).
//!
//! Identity comes in two flavors. An immutable object (`mutable_ref == 0`)
//! is its cell: every attribute write produces a new cell. A mutable object
//! is its id: the current state lives in the Space-wide mutable-reference
//! table and writes publish a replacement cell by CAS, so readers that
//! observe the new root observe a fully constructed state.
//!
//! The parent chain is a persistent linked list of `{prototype, tail}`
//! cells, pre-flattened at construction: `new_child` shares the parent's
//! whole chain as its tail. Attribute resolution walks the chain head-first
//! with no further linearization.

use crate::cell::{Cell, CellBody, ObjectNode, ParentLinkNode, cell_value};
use crate::context::Context;
use crate::list::ProtoList;
use crate::space::Space;
use crate::sparse::ProtoSparseMap;
use crate::string::ProtoString;
use proto_core::{PointerTag, Value};
use rand::Rng;
use std::ptr;
use std::sync::atomic::Ordering as MemoryOrdering;

/// A fresh nonzero mutable-reference id from the calling thread's generator.
/// Zero is reserved for immutable identity.
pub(crate) fn generate_mutable_ref() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.r#gen();
        if id != 0 {
            return id;
        }
    }
}

#[inline(always)]
fn obj_node<'a>(cell: *mut Cell) -> &'a ObjectNode {
    unsafe {
        match &(*cell).body {
            CellBody::Object(n) => n,
            _ => unreachable!("object cell expected"),
        }
    }
}

#[inline(always)]
fn link_node<'a>(cell: *mut Cell) -> &'a ParentLinkNode {
    unsafe {
        match &(*cell).body {
            CellBody::ParentLink(n) => n,
            _ => unreachable!("parent link cell expected"),
        }
    }
}

fn new_parent_link(ctx: &mut Context, tail: *mut Cell, object: *mut Cell) -> *mut Cell {
    ctx.alloc_cell(CellBody::ParentLink(ParentLinkNode { tail, object }))
}

fn new_object_cell(
    ctx: &mut Context,
    parent: *mut Cell,
    mutable_ref: u64,
    attributes: *mut Cell,
) -> *mut Cell {
    let attributes = if attributes.is_null() {
        ProtoSparseMap::new(ctx).cell()
    } else {
        attributes
    };
    ctx.alloc_cell(CellBody::Object(ObjectNode {
        parent,
        mutable_ref,
        attributes,
    }))
}

/// Resolve a cell through the mutable-reference table when it carries a
/// nonzero id; the cell itself otherwise.
fn resolve(space: &Space, cell: *mut Cell) -> *mut Cell {
    let id = obj_node(cell).mutable_ref;
    if id == 0 {
        return cell;
    }
    let root = space.mutable_root.load(MemoryOrdering::Acquire);
    let current = ProtoSparseMap::from_cell(root).get_at(id);
    if current.is_none() {
        cell
    } else {
        current.cell_address() as *mut Cell
    }
}

/// Register `object_value` under a freshly drawn id; redraws on collision.
/// Returns the id, which the (not yet shared) cell already carries.
fn publish_new_mutable(ctx: &mut Context, cell: *mut Cell) -> u64 {
    let space: *const Space = ctx.space();
    loop {
        let root = unsafe { (*space).mutable_root.load(MemoryOrdering::Acquire) };
        let table = ProtoSparseMap::from_cell(root);
        let id = generate_mutable_ref();
        if table.has(id) {
            continue;
        }
        // The cell is not published yet, so stamping the id is still legal.
        unsafe {
            if let CellBody::Object(n) = &mut (*cell).body {
                n.mutable_ref = id;
            }
        }
        let new_root = table.set_at(ctx, id, unsafe { cell_value(cell) });
        let swapped = unsafe {
            (*space).mutable_root.compare_exchange(
                root,
                new_root.cell(),
                MemoryOrdering::AcqRel,
                MemoryOrdering::Acquire,
            )
        };
        if swapped.is_ok() {
            return id;
        }
    }
}

// =============================================================================
// ProtoObject
// =============================================================================

/// Handle to a value treated as a prototype object. Operations on values
/// that are not object cells return sentinels and leave the value unchanged.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtoObject(pub Value);

impl ProtoObject {
    /// A fresh object with no parents and empty attributes.
    pub fn new(ctx: &mut Context, is_mutable: bool) -> ProtoObject {
        let cell = new_object_cell(ctx, ptr::null_mut(), 0, ptr::null_mut());
        if is_mutable {
            publish_new_mutable(ctx, cell);
        }
        ProtoObject(unsafe { cell_value(cell) })
    }

    pub fn from_value(v: Value) -> ProtoObject {
        ProtoObject(v)
    }

    pub fn as_value(self) -> Value {
        self.0
    }

    /// The object cell behind this value, if it is one.
    fn object_cell(self) -> Option<*mut Cell> {
        if self.0.tag() != PointerTag::Object as u8 || self.0.is_none() {
            return None;
        }
        let cell = self.0.cell_address() as *mut Cell;
        match unsafe { &(*cell).body } {
            CellBody::Object(_) => Some(cell),
            _ => None,
        }
    }

    /// The identity id of a mutable object; 0 for immutable objects and
    /// non-objects.
    pub fn mutable_ref(self) -> u64 {
        self.object_cell().map_or(0, |c| obj_node(c).mutable_ref)
    }

    /// Attribute lookup along the parent chain; none when absent.
    pub fn get_attribute(self, ctx: &mut Context, name: ProtoString) -> Value {
        let Some(cell) = self.object_cell() else {
            return Value::NONE;
        };
        let space = ctx.space();
        let hash = name.get_hash();

        let current = resolve(space, cell);
        let own = ProtoSparseMap::from_cell(obj_node(current).attributes);
        if own.has(hash) {
            return own.get_at(hash);
        }

        let mut link = obj_node(current).parent;
        while !link.is_null() {
            let parent = resolve(space, link_node(link).object);
            let attrs = ProtoSparseMap::from_cell(obj_node(parent).attributes);
            if attrs.has(hash) {
                return attrs.get_at(hash);
            }
            link = link_node(link).tail;
        }
        Value::NONE
    }

    /// True when resolution along the chain finds the attribute.
    pub fn has_attribute(self, ctx: &mut Context, name: ProtoString) -> Value {
        if self.get_attribute(ctx, name).is_none() {
            Value::FALSE
        } else {
            Value::TRUE
        }
    }

    /// True when the resolved object itself carries the attribute.
    pub fn has_own_attribute(self, ctx: &mut Context, name: ProtoString) -> Value {
        let Some(cell) = self.object_cell() else {
            return Value::FALSE;
        };
        let current = resolve(ctx.space(), cell);
        let own = ProtoSparseMap::from_cell(obj_node(current).attributes);
        Value::from_bool(own.has(name.get_hash()))
    }

    /// Copy-on-write attribute update.
    ///
    /// Immutable receiver: a new object cell with the attribute map
    /// path-copied. Mutable receiver: the replacement cell is published
    /// under the same id by CAS on the mutable root and the receiver itself
    /// is returned, its identity intact.
    pub fn set_attribute(self, ctx: &mut Context, name: ProtoString, value: Value) -> ProtoObject {
        let Some(cell) = self.object_cell() else {
            return self;
        };
        let hash = name.get_hash();
        let id = obj_node(cell).mutable_ref;

        if id == 0 {
            let n = obj_node(cell);
            let attrs = ProtoSparseMap::from_cell(n.attributes).set_at(ctx, hash, value);
            let replacement = new_object_cell(ctx, n.parent, 0, attrs.cell());
            return ProtoObject(unsafe { cell_value(replacement) });
        }

        let space: *const Space = ctx.space();
        loop {
            let root = unsafe { (*space).mutable_root.load(MemoryOrdering::Acquire) };
            let table = ProtoSparseMap::from_cell(root);
            let current_value = table.get_at(id);
            let current = if current_value.is_none() {
                cell
            } else {
                current_value.cell_address() as *mut Cell
            };
            let n = obj_node(current);
            let attrs = ProtoSparseMap::from_cell(n.attributes).set_at(ctx, hash, value);
            let replacement = new_object_cell(ctx, n.parent, id, attrs.cell());
            let new_root = table.set_at(ctx, id, unsafe { cell_value(replacement) });
            let swapped = unsafe {
                (*space).mutable_root.compare_exchange(
                    root,
                    new_root.cell(),
                    MemoryOrdering::AcqRel,
                    MemoryOrdering::Acquire,
                )
            };
            if swapped.is_ok() {
                return self;
            }
        }
    }

    /// The whole chain flattened into one sparse map; the child is visited
    /// first and shadows its parents.
    pub fn get_attributes(self, ctx: &mut Context) -> ProtoSparseMap {
        let mut flattened = ProtoSparseMap::new(ctx);
        let Some(cell) = self.object_cell() else {
            return flattened;
        };
        let space: *const Space = ctx.space();

        let mut pending: Vec<(u64, Value)> = Vec::new();
        let collect = |cell: *mut Cell, pending: &mut Vec<(u64, Value)>| {
            let own = ProtoSparseMap::from_cell(obj_node(cell).attributes);
            own.process_elements(&mut |k, v| pending.push((k, v)));
        };

        let current = resolve(unsafe { &*space }, cell);
        collect(current, &mut pending);
        let mut link = obj_node(current).parent;
        while !link.is_null() {
            let parent = resolve(unsafe { &*space }, link_node(link).object);
            collect(parent, &mut pending);
            link = link_node(link).tail;
        }

        for (k, v) in pending {
            if !flattened.has(k) {
                flattened = flattened.set_at(ctx, k, v);
            }
        }
        flattened
    }

    /// The resolved object's own attribute map.
    pub fn get_own_attributes(self, ctx: &mut Context) -> ProtoSparseMap {
        match self.object_cell() {
            Some(cell) => {
                let current = resolve(ctx.space(), cell);
                ProtoSparseMap::from_cell(obj_node(current).attributes)
            }
            None => ProtoSparseMap::new(ctx),
        }
    }

    /// The prototypes along the chain, head-first.
    pub fn get_parents(self, ctx: &mut Context) -> ProtoList {
        let mut parents = ProtoList::new(ctx);
        let Some(cell) = self.object_cell() else {
            return parents;
        };
        let mut link = obj_node(cell).parent;
        while !link.is_null() {
            let object = link_node(link).object;
            let value = unsafe { cell_value(object) };
            parents = parents.append_last(ctx, value);
            link = link_node(link).tail;
        }
        parents
    }

    /// A new object whose chain is `{new_parent} ++ old_chain`; attributes
    /// and identity are preserved. The receiver is resolved first, so a
    /// mutable receiver contributes its current chain and attributes.
    pub fn add_parent(self, ctx: &mut Context, new_parent: ProtoObject) -> ProtoObject {
        let Some(cell) = self.object_cell() else {
            return self;
        };
        let Some(parent_cell) = new_parent.object_cell() else {
            return self;
        };
        let current = resolve(ctx.space(), cell);
        let n = obj_node(current);
        let link = new_parent_link(ctx, n.parent, parent_cell);
        let replacement = new_object_cell(ctx, link, n.mutable_ref, n.attributes);
        ProtoObject(unsafe { cell_value(replacement) })
    }

    /// True when `prototype` appears anywhere along the chain.
    pub fn is_instance_of(self, _ctx: &mut Context, prototype: ProtoObject) -> Value {
        let Some(cell) = self.object_cell() else {
            return Value::FALSE;
        };
        let Some(proto_cell) = prototype.object_cell() else {
            return Value::FALSE;
        };
        let mut link = obj_node(cell).parent;
        while !link.is_null() {
            if link_node(link).object == proto_cell {
                return Value::TRUE;
            }
            link = link_node(link).tail;
        }
        Value::FALSE
    }

    /// A copy with the same parents and attributes but a fresh identity.
    pub fn clone_object(self, ctx: &mut Context, is_mutable: bool) -> ProtoObject {
        let Some(cell) = self.object_cell() else {
            return ProtoObject(Value::NONE);
        };
        let current = resolve(ctx.space(), cell);
        let n = obj_node(current);
        let copy = new_object_cell(ctx, n.parent, 0, n.attributes);
        if is_mutable {
            publish_new_mutable(ctx, copy);
        }
        ProtoObject(unsafe { cell_value(copy) })
    }

    /// A child with empty attributes whose chain is `{self} ++ self.chain`.
    /// The receiver is resolved first, so the child links the current state
    /// of a mutable parent.
    pub fn new_child(self, ctx: &mut Context, is_mutable: bool) -> ProtoObject {
        let Some(cell) = self.object_cell() else {
            return ProtoObject(Value::NONE);
        };
        let current = resolve(ctx.space(), cell);
        let n = obj_node(current);
        let link = new_parent_link(ctx, n.parent, current);
        let child = new_object_cell(ctx, link, 0, ptr::null_mut());
        if is_mutable {
            publish_new_mutable(ctx, child);
        }
        ProtoObject(unsafe { cell_value(child) })
    }
}

// =============================================================================
// Tests
// =============================================================================
