//! Strings
//!
//! A string is a cell wrapping a tuple of embedded `UnicodeChar` values.
//! Size, indexing and hashing delegate to the tuple; because tuples intern,
//! string equality and hashing collapse to the tuple's identity. String
//! cells themselves are canonicalized through a Space-wide table keyed by
//! their tuple, so two strings built from the same character sequence are
//! the same cell.
//!
//! Every mutating operation rebuilds and re-canonicalizes the character
//! tuple; the operations behave as their list analogues applied to the
//! underlying characters.

use crate::cell::{Cell, CellBody, StringIterNode, StringNode, cell_value};
use crate::context::Context;
use crate::list::ProtoList;
use crate::space::Space;
use crate::tuple::ProtoTuple;
use proto_core::{PointerTag, Value, utf8};
use std::cmp::Ordering;
use std::sync::atomic::Ordering as MemoryOrdering;

#[inline(always)]
fn node<'a>(cell: *mut Cell) -> &'a StringNode {
    unsafe {
        match &(*cell).body {
            CellBody::Str(n) => n,
            _ => unreachable!("string cell expected"),
        }
    }
}

/// Handle to a canonical string cell.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ProtoString(pub(crate) *mut Cell);

impl ProtoString {
    /// The canonical string over a decoded UTF-8 byte sequence.
    pub fn from_utf8(ctx: &mut Context, bytes: &[u8]) -> ProtoString {
        let chars: Vec<Value> = utf8::decode(bytes).map(Value::from_char).collect();
        let tuple = ProtoTuple::from_values(ctx, &chars);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// The canonical string over a tuple of `UnicodeChar` values.
    ///
    /// The tuple is already canonical, so its identity hash keys the string
    /// table; a CAS on the table root publishes a freshly wrapped cell.
    pub fn from_tuple(ctx: &mut Context, tuple: ProtoTuple) -> ProtoString {
        let space: *const Space = ctx.space();
        let key = tuple.get_hash();
        let mut fresh: *mut Cell = std::ptr::null_mut();
        loop {
            let root = unsafe { (*space).string_root.load(MemoryOrdering::Acquire) };
            let table = crate::sparse::ProtoSparseMap::from_cell(root);
            let existing = table.get_at(key);
            if !existing.is_none() {
                return ProtoString(existing.cell_address() as *mut Cell);
            }
            if fresh.is_null() {
                fresh = ctx.alloc_cell(CellBody::Str(StringNode {
                    base_tuple: tuple.cell(),
                }));
            }
            let published = unsafe { cell_value(fresh) };
            let new_root = table.set_at(ctx, key, published);
            let swapped = unsafe {
                (*space).string_root.compare_exchange(
                    root,
                    new_root.cell(),
                    MemoryOrdering::AcqRel,
                    MemoryOrdering::Acquire,
                )
            };
            if swapped.is_ok() {
                return ProtoString(fresh);
            }
        }
    }

    fn chars(self) -> Vec<Value> {
        self.base_tuple().elements()
    }

    fn rebuild(ctx: &mut Context, chars: &[Value]) -> ProtoString {
        let tuple = ProtoTuple::from_values(ctx, chars);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// The underlying character tuple.
    pub fn base_tuple(self) -> ProtoTuple {
        ProtoTuple::from_cell(node(self.0).base_tuple)
    }

    /// The string as a tagged value word.
    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    /// Recover a string handle from a value word; `None` for any other tag.
    pub fn from_value(v: Value) -> Option<ProtoString> {
        if v.tag() == PointerTag::String as u8 && !v.is_none() {
            Some(ProtoString(v.cell_address() as *mut Cell))
        } else {
            None
        }
    }

    pub fn get_size(self) -> u64 {
        self.base_tuple().get_size()
    }

    /// Hash of the underlying tuple: equal contents, equal hash.
    pub fn get_hash(self) -> u64 {
        self.base_tuple().get_hash()
    }

    /// The character at `index` as an embedded `UnicodeChar`; none when out
    /// of range.
    pub fn get_at(self, index: i64) -> Value {
        self.base_tuple().get_at(index)
    }

    /// Code-point-wise lexicographic comparison.
    pub fn cmp_to_string(self, other: ProtoString) -> i32 {
        if self.0 == other.0 {
            return 0;
        }
        let a = self.chars();
        let b = other.chars();
        let common = a.len().min(b.len());
        for i in 0..common {
            match a[i].as_char().cmp(&b[i].as_char()) {
                Ordering::Less => return -1,
                Ordering::Greater => return 1,
                Ordering::Equal => {}
            }
        }
        match a.len().cmp(&b.len()) {
            Ordering::Less => -1,
            Ordering::Greater => 1,
            Ordering::Equal => 0,
        }
    }

    /// The characters in `[from, to)`.
    pub fn get_slice(self, ctx: &mut Context, from: i64, to: i64) -> ProtoString {
        let tuple = self.base_tuple().get_slice(ctx, from, to);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// A string with the character at `index` replaced; out-of-range
    /// indexes and non-character values return the string unchanged.
    pub fn set_at(self, ctx: &mut Context, index: i64, character: Value) -> ProtoString {
        if !character.is_char() {
            return self;
        }
        let tuple = self.base_tuple().set_at(ctx, index, character);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// A string with `character` inserted at `index`.
    pub fn insert_at(self, ctx: &mut Context, index: i64, character: Value) -> ProtoString {
        if !character.is_char() {
            return self;
        }
        let tuple = self.base_tuple().insert_at(ctx, index, character);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// Overwrite characters starting at `index` with `other`, extending at
    /// the end if `other` runs past it.
    pub fn set_at_string(self, ctx: &mut Context, index: i64, other: ProtoString) -> ProtoString {
        let mut chars = self.chars();
        let size = chars.len() as i64;
        let start = (if index < 0 { index + size } else { index }).clamp(0, size) as usize;
        for (offset, ch) in other.chars().into_iter().enumerate() {
            let at = start + offset;
            if at < chars.len() {
                chars[at] = ch;
            } else {
                chars.push(ch);
            }
        }
        ProtoString::rebuild(ctx, &chars)
    }

    /// Insert all of `other` at `index`.
    pub fn insert_at_string(self, ctx: &mut Context, index: i64, other: ProtoString) -> ProtoString {
        let mut chars = self.chars();
        let size = chars.len() as i64;
        let at = (if index < 0 { index + size } else { index }).clamp(0, size) as usize;
        chars.splice(at..at, other.chars());
        ProtoString::rebuild(ctx, &chars)
    }

    /// Concatenation with `other` in front.
    pub fn append_first(self, ctx: &mut Context, other: ProtoString) -> ProtoString {
        let tuple = self.base_tuple().append_first(ctx, other.base_tuple());
        ProtoString::from_tuple(ctx, tuple)
    }

    /// Concatenation with `other` behind.
    pub fn append_last(self, ctx: &mut Context, other: ProtoString) -> ProtoString {
        let tuple = self.base_tuple().append_last(ctx, other.base_tuple());
        ProtoString::from_tuple(ctx, tuple)
    }

    /// The first `count` characters.
    pub fn split_first(self, ctx: &mut Context, count: i64) -> ProtoString {
        let tuple = self.base_tuple().split_first(ctx, count);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// Everything from position `count` on.
    pub fn split_last(self, ctx: &mut Context, count: i64) -> ProtoString {
        let tuple = self.base_tuple().split_last(ctx, count);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// Without the first `count` characters.
    pub fn remove_first(self, ctx: &mut Context, count: i64) -> ProtoString {
        let tuple = self.base_tuple().remove_first(ctx, count);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// Without the last `count` characters.
    pub fn remove_last(self, ctx: &mut Context, count: i64) -> ProtoString {
        let tuple = self.base_tuple().remove_last(ctx, count);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// Without the character at `index`.
    pub fn remove_at(self, ctx: &mut Context, index: i64) -> ProtoString {
        let tuple = self.base_tuple().remove_at(ctx, index);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// Without the characters in `[from, to)`.
    pub fn remove_slice(self, ctx: &mut Context, from: i64, to: i64) -> ProtoString {
        let tuple = self.base_tuple().remove_slice(ctx, from, to);
        ProtoString::from_tuple(ctx, tuple)
    }

    /// The characters as a fresh persistent list.
    pub fn as_list(self, ctx: &mut Context) -> ProtoList {
        self.base_tuple().as_list(ctx)
    }

    /// An iterator cell positioned at the first character.
    pub fn get_iterator(self, ctx: &mut Context) -> ProtoStringIterator {
        ProtoStringIterator::new(ctx, self, 0)
    }

    /// Re-encode the characters as UTF-8. Host-side convenience.
    pub fn to_utf8_string(self) -> String {
        let mut bytes = Vec::new();
        for ch in self.chars() {
            utf8::encode_one(ch.as_char(), &mut bytes);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Positional iterator cell over a string. `next` does not advance;
/// `advance` returns a new iterator at the following position.
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct ProtoStringIterator(pub(crate) *mut Cell);

impl ProtoStringIterator {
    fn new(ctx: &mut Context, base: ProtoString, index: u64) -> ProtoStringIterator {
        ProtoStringIterator(ctx.alloc_cell(CellBody::StrIter(StringIterNode {
            base: base.0,
            index,
        })))
    }

    fn iter_node<'a>(self) -> &'a StringIterNode {
        unsafe {
            match &(*self.0).body {
                CellBody::StrIter(n) => n,
                _ => unreachable!("string iterator cell expected"),
            }
        }
    }

    pub fn as_value(self) -> Value {
        unsafe { cell_value(self.0) }
    }

    pub fn has_next(self) -> bool {
        let n = self.iter_node();
        n.index < ProtoString(n.base).get_size()
    }

    pub fn next(self) -> Value {
        let n = self.iter_node();
        ProtoString(n.base).get_at(n.index as i64)
    }

    pub fn advance(self, ctx: &mut Context) -> ProtoStringIterator {
        let n = self.iter_node();
        let base = ProtoString(n.base);
        let index = n.index + 1;
        ProtoStringIterator::new(ctx, base, index)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::with_context;

    #[test]
    fn test_from_utf8_and_size() {
        with_context(|ctx| {
            let s = ctx.from_utf8_string("hola");
            assert_eq!(s.get_size(), 4);
            assert_eq!(s.get_at(1).as_char(), 'o' as u32);
            assert_eq!(s.to_utf8_string(), "hola");
        });
    }

    #[test]
    fn test_multibyte_characters_count_as_one() {
        with_context(|ctx| {
            let s = ctx.from_utf8_string("prøtø😀");
            assert_eq!(s.get_size(), 6);
            assert_eq!(s.get_at(2).as_char(), 'ø' as u32);
            assert_eq!(s.get_at(5).as_char(), 0x1F600);
            assert_eq!(s.to_utf8_string(), "prøtø😀");
        });
    }

    #[test]
    fn test_string_interning() {
        with_context(|ctx| {
            let a = ctx.from_utf8_string("shared text");
            let b = ctx.from_utf8_string("shared text");
            assert_eq!(a.0, b.0, "equal byte sequences must be one cell");
            assert_eq!(a.get_hash(), b.get_hash());

            let c = ctx.from_utf8_string("different text");
            assert_ne!(a.0, c.0);
        });
    }

    #[test]
    fn test_rebuilt_strings_intern_too() {
        with_context(|ctx| {
            let hola = ctx.from_utf8_string("hola");
            let hol = ctx.from_utf8_string("hol");
            let a = ctx.from_utf8_string("a");
            let rebuilt = hol.append_last(ctx, a);
            assert_eq!(rebuilt.0, hola.0);
        });
    }

    #[test]
    fn test_concatenation() {
        with_context(|ctx| {
            let s1 = ctx.from_utf8_string("hola");
            let s2 = ctx.from_utf8_string(" mundo");
            let s3 = s1.append_last(ctx, s2);
            assert_eq!(s3.get_size(), 10);
            assert_eq!(s3.to_utf8_string(), "hola mundo");
            // The originals are untouched.
            assert_eq!(s1.get_size(), 4);

            let s4 = s1.append_first(ctx, s2);
            assert_eq!(s4.to_utf8_string(), " mundohola");
        });
    }

    #[test]
    fn test_slices() {
        with_context(|ctx| {
            let s = ctx.from_utf8_string("hola mundo");
            let slice = s.get_slice(ctx, 5, 10);
            assert_eq!(slice.to_utf8_string(), "mundo");
            // Identity slice interns back to the same cell.
            let all = s.get_slice(ctx, 0, s.get_size() as i64);
            assert_eq!(all.0, s.0);
        });
    }

    #[test]
    fn test_set_and_insert() {
        with_context(|ctx| {
            let s = ctx.from_utf8_string("cat");
            let set = s.set_at(ctx, 0, Value::from_char('b' as u32));
            assert_eq!(set.to_utf8_string(), "bat");
            let inserted = s.insert_at(ctx, 3, Value::from_char('s' as u32));
            assert_eq!(inserted.to_utf8_string(), "cats");
            // Non-characters bounce.
            assert_eq!(s.set_at(ctx, 0, Value::from_small_int(1)).0, s.0);
        });
    }

    #[test]
    fn test_splits_and_removes() {
        with_context(|ctx| {
            let s = ctx.from_utf8_string("runtime");
            assert_eq!(s.split_first(ctx, 3).to_utf8_string(), "run");
            assert_eq!(s.split_last(ctx, 3).to_utf8_string(), "time");
            assert_eq!(s.remove_first(ctx, 3).to_utf8_string(), "time");
            assert_eq!(s.remove_last(ctx, 4).to_utf8_string(), "run");
            assert_eq!(s.remove_at(ctx, 0).to_utf8_string(), "untime");
            assert_eq!(s.remove_slice(ctx, 1, 4).to_utf8_string(), "rime");
        });
    }

    #[test]
    fn test_string_level_splices() {
        with_context(|ctx| {
            let s = ctx.from_utf8_string("hello world");
            let patch = ctx.from_utf8_string("WORLD");
            assert_eq!(
                s.set_at_string(ctx, 6, patch).to_utf8_string(),
                "hello WORLD"
            );
            let ins = ctx.from_utf8_string("big ");
            assert_eq!(
                s.insert_at_string(ctx, 6, ins).to_utf8_string(),
                "hello big world"
            );
            // Overwrites past the end extend the string.
            let tail = ctx.from_utf8_string("world!");
            assert_eq!(
                s.set_at_string(ctx, 6, tail).to_utf8_string(),
                "hello world!"
            );
        });
    }

    #[test]
    fn test_cmp_to_string() {
        with_context(|ctx| {
            let a = ctx.from_utf8_string("abc");
            let b = ctx.from_utf8_string("abd");
            let prefix = ctx.from_utf8_string("ab");
            assert_eq!(a.cmp_to_string(a), 0);
            assert_eq!(a.cmp_to_string(b), -1);
            assert_eq!(b.cmp_to_string(a), 1);
            assert_eq!(prefix.cmp_to_string(a), -1);
            assert_eq!(a.cmp_to_string(prefix), 1);
        });
    }

    #[test]
    fn test_as_list() {
        with_context(|ctx| {
            let s = ctx.from_utf8_string("ab");
            let list = s.as_list(ctx);
            assert_eq!(list.get_size(), 2);
            assert_eq!(list.get_at(0).as_char(), 'a' as u32);
            assert_eq!(list.get_at(1).as_char(), 'b' as u32);
        });
    }

    #[test]
    fn test_iterator() {
        with_context(|ctx| {
            let s = ctx.from_utf8_string("xyz");
            let mut iter = s.get_iterator(ctx);
            let mut seen = String::new();
            while iter.has_next() {
                seen.push(char::from_u32(iter.next().as_char()).unwrap());
                iter = iter.advance(ctx);
            }
            assert_eq!(seen, "xyz");
        });
    }

    #[test]
    fn test_empty_string() {
        with_context(|ctx| {
            let e = ctx.from_utf8_string("");
            assert_eq!(e.get_size(), 0);
            assert!(e.get_at(0).is_none());
            assert_eq!(e.to_utf8_string(), "");
            let e2 = ctx.from_utf8_string("");
            assert_eq!(e.0, e2.0);
        });
    }
}
