//! Method Cells
//!
//! A method cell wraps a native function pointer following the runtime call
//! convention so it can travel as a first-class value and live in attribute
//! maps. The collector never follows it.

use crate::cell::{Cell, CellBody, MethodNode, cell_value};
use crate::context::Context;
use crate::list::ProtoList;
use crate::sparse::ProtoSparseMap;
use proto_core::{PointerTag, Value};

/// The native call convention: context, receiver, the next parent link for
/// `super`-style dispatch, positional arguments, keyword arguments (keyed by
/// attribute-name hash). The runtime does not validate arity.
pub type ProtoMethod =
    fn(&mut Context, Value, *mut Cell, ProtoList, ProtoSparseMap) -> Value;

/// Handle to a method cell.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtoMethodCell(pub(crate) *mut Cell);

impl ProtoMethodCell {
    pub fn new(ctx: &mut Context, method: ProtoMethod) -> ProtoMethodCell {
        ProtoMethodCell(ctx.alloc_cell(CellBody::Method(MethodNode { method })))
    }

    fn method_node<'a>(self) -> &'a MethodNode {
        unsafe {
            match &(*self.0).body {
                CellBody::Method(n) => n,
                _ => unreachable!("method cell expected"),
            }
        }
    }

    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    /// Recover a method handle from a value word; `None` for any other tag.
    pub fn from_value(v: Value) -> Option<ProtoMethodCell> {
        if v.tag() == PointerTag::Method as u8 && !v.is_none() {
            Some(ProtoMethodCell(v.cell_address() as *mut Cell))
        } else {
            None
        }
    }

    /// The wrapped function pointer.
    pub fn get_method(self) -> ProtoMethod {
        self.method_node().method
    }

    /// Invoke the wrapped method with this cell as the receiver.
    pub fn invoke(
        self,
        ctx: &mut Context,
        args: ProtoList,
        kwargs: ProtoSparseMap,
    ) -> Value {
        let method = self.get_method();
        method(ctx, self.as_value(), std::ptr::null_mut(), args, kwargs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_context;

    fn sum_args(
        _ctx: &mut Context,
        _self: Value,
        _parent: *mut Cell,
        args: ProtoList,
        _kwargs: ProtoSparseMap,
    ) -> Value {
        let mut total = 0i64;
        for i in 0..args.get_size() {
            total += args.get_at(i as i64).as_small_int();
        }
        Value::from_small_int(total)
    }

    #[test]
    fn test_invoke() {
        with_context(|ctx| {
            let cell = ctx.from_method(sum_args);
            let mut args = ctx.new_list();
            args = args.append_last(ctx, Value::from_small_int(2));
            args = args.append_last(ctx, Value::from_small_int(40));
            let kwargs = ctx.new_sparse_map();
            let result = cell.invoke(ctx, args, kwargs);
            assert_eq!(result.as_small_int(), 42);
        });
    }

    #[test]
    fn test_value_roundtrip() {
        with_context(|ctx| {
            let cell = ctx.from_method(sum_args);
            let v = cell.as_value();
            assert_eq!(v.tag(), PointerTag::Method as u8);
            let back = ProtoMethodCell::from_value(v).unwrap();
            assert_eq!(back.0, cell.0);
            assert!(ProtoMethodCell::from_value(Value::from_small_int(1)).is_none());
        });
    }
}
