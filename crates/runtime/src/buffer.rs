//! Byte Buffers and External Pointers
//!
//! A byte buffer cell manages (or wraps) a byte array living outside the
//! cell heap; owned memory is freed by the sweep finalizer. An external
//! pointer cell carries an opaque pointer the collector never follows; it
//! exists so host data can travel as a first-class value.

use crate::cell::{BufferNode, Cell, CellBody, ExternalNode, cell_value};
use crate::context::Context;
use proto_core::{PointerTag, Value};

/// Handle to a byte buffer cell. The payload is mutable; it is host memory,
/// not part of the immutable cell graph.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtoByteBuffer(pub(crate) *mut Cell);

impl ProtoByteBuffer {
    /// A buffer owning `length` zeroed bytes.
    pub fn new(ctx: &mut Context, length: usize) -> ProtoByteBuffer {
        let data = if length == 0 {
            std::ptr::null_mut()
        } else {
            unsafe { libc::calloc(length, 1) as *mut u8 }
        };
        if length != 0 && data.is_null() {
            eprintln!("PANIC ERROR: byte buffer allocation of {length} bytes failed! Exiting ...");
            std::process::abort();
        }
        ProtoByteBuffer(ctx.alloc_cell(CellBody::ByteBuffer(BufferNode {
            size: length as u64,
            data,
            owned: true,
        })))
    }

    /// A buffer wrapping caller-owned memory; the finalizer leaves it alone.
    ///
    /// # Safety
    /// `data` must stay valid for the lifetime of the buffer cell.
    pub unsafe fn wrap(ctx: &mut Context, length: usize, data: *mut u8) -> ProtoByteBuffer {
        ProtoByteBuffer(ctx.alloc_cell(CellBody::ByteBuffer(BufferNode {
            size: length as u64,
            data,
            owned: false,
        })))
    }

    fn buffer_node<'a>(self) -> &'a BufferNode {
        unsafe {
            match &(*self.0).body {
                CellBody::ByteBuffer(n) => n,
                _ => unreachable!("byte buffer cell expected"),
            }
        }
    }

    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    /// Recover a buffer handle from a value word; `None` for any other tag.
    pub fn from_value(v: Value) -> Option<ProtoByteBuffer> {
        if v.tag() == PointerTag::ByteBuffer as u8 && !v.is_none() {
            Some(ProtoByteBuffer(v.cell_address() as *mut Cell))
        } else {
            None
        }
    }

    pub fn get_size(self) -> u64 {
        self.buffer_node().size
    }

    /// The raw payload pointer.
    pub fn get_buffer(self) -> *mut u8 {
        self.buffer_node().data
    }

    fn resolve_index(self, index: i64) -> Option<usize> {
        let size = self.get_size() as i64;
        let resolved = if index < 0 { index + size } else { index };
        if resolved < 0 || resolved >= size {
            None
        } else {
            Some(resolved as usize)
        }
    }

    /// The byte at `index`; 0 when out of range.
    pub fn get_at(self, index: i64) -> u8 {
        match self.resolve_index(index) {
            Some(i) => unsafe { *self.buffer_node().data.add(i) },
            None => 0,
        }
    }

    /// Store a byte; out-of-range indexes are ignored.
    pub fn set_at(self, index: i64, value: u8) {
        if let Some(i) = self.resolve_index(index) {
            unsafe { *self.buffer_node().data.add(i) = value };
        }
    }

    /// The payload as a slice.
    pub fn as_slice<'a>(self) -> &'a [u8] {
        let n = self.buffer_node();
        if n.data.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(n.data, n.size as usize) }
        }
    }
}

/// Handle to an external pointer cell.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtoExternalPointer(pub(crate) *mut Cell);

impl ProtoExternalPointer {
    pub fn new(ctx: &mut Context, pointer: *mut libc::c_void) -> ProtoExternalPointer {
        ProtoExternalPointer(ctx.alloc_cell(CellBody::ExternalPointer(ExternalNode { pointer })))
    }

    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    /// Recover an external pointer handle from a value word.
    pub fn from_value(v: Value) -> Option<ProtoExternalPointer> {
        if v.tag() == PointerTag::ExternalPointer as u8 && !v.is_none() {
            Some(ProtoExternalPointer(v.cell_address() as *mut Cell))
        } else {
            None
        }
    }

    /// The wrapped pointer.
    pub fn get_pointer(self) -> *mut libc::c_void {
        unsafe {
            match &(*self.0).body {
                CellBody::ExternalPointer(n) => n.pointer,
                _ => unreachable!("external pointer cell expected"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_context;

    #[test]
    fn test_owned_buffer() {
        with_context(|ctx| {
            let buffer = ctx.new_buffer(10);
            assert_eq!(buffer.get_size(), 10);
            // Freshly allocated buffers are zeroed.
            assert_eq!(buffer.get_at(0), 0);

            buffer.set_at(0, b'H');
            buffer.set_at(1, b'i');
            assert_eq!(buffer.get_at(0), b'H');
            assert_eq!(buffer.get_at(1), b'i');
            assert_eq!(buffer.get_at(-9), b'i');
            assert_eq!(&buffer.as_slice()[..2], b"Hi");

            // Out-of-range accesses are sentinels / no-ops.
            assert_eq!(buffer.get_at(10), 0);
            buffer.set_at(99, b'X');
        });
    }

    #[test]
    fn test_wrapped_buffer() {
        with_context(|ctx| {
            let mut host = *b"abc";
            let buffer = unsafe { ctx.from_buffer(3, host.as_mut_ptr()) };
            assert_eq!(buffer.get_at(2), b'c');
            buffer.set_at(0, b'z');
            assert_eq!(host[0], b'z');
        });
    }

    #[test]
    fn test_external_pointer() {
        with_context(|ctx| {
            let mut data = 42i32;
            let ptr = ctx.from_external_pointer(&mut data as *mut i32 as *mut libc::c_void);
            let recovered = ptr.get_pointer() as *mut i32;
            assert_eq!(recovered, &mut data as *mut i32);
            assert_eq!(unsafe { *recovered }, 42);

            let v = ptr.as_value();
            assert_eq!(v.tag(), PointerTag::ExternalPointer as u8);
            assert_eq!(ProtoExternalPointer::from_value(v).unwrap().0, ptr.0);
        });
    }
}
