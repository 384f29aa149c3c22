//! Structural type descriptors.
//!
//! Every managed object points at a [Type] that tells the tracer where
//! its references live. Descriptors are themselves managed objects: the
//! fixed head below is followed by a trailing array of [Field] entries,
//! and the `count` word doubles as that array's length prefix (for every
//! suffix-carrying type the `u32` element count sits at payload offset 0
//! and is covered by `data_size`; elements start at `payload +
//! data_size`).

use std::mem::size_of;
use std::slice;

use modular_bitfield::prelude::*;

/// Reference-shape flags of a [Type].
#[bitfield(bits = 32)]
#[repr(u32)]
#[derive(Clone, Copy, Debug)]
pub struct TypeFlags {
    /// The instance is a single reference cell.
    pub is_ref: bool,
    /// One or more field offsets (or suffix elements) carry references.
    pub has_refs: bool,
    /// The instance ends in a length-prefixed trailing array.
    pub has_suffix: bool,
    #[skip]
    __: B29,
}

/// Managed string view: `data` is the payload of a managed char array,
/// `begin`/`length` select a byte range of it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Str {
    pub data: *mut u8,
    pub begin: u32,
    pub length: u32,
}

impl Str {
    pub const EMPTY: Str = Str {
        data: std::ptr::null_mut(),
        begin: 0,
        length: 0,
    };

    /// Bytes of the view. The char-array payload starts with its `u32`
    /// length prefix; content follows it.
    pub unsafe fn as_bytes(&self) -> &[u8] {
        if self.data.is_null() {
            return &[];
        }
        let content = self.data.add(size_of::<u32>());
        slice::from_raw_parts(content.add(self.begin as usize), self.length as usize)
    }
}

/// One reference-bearing slot of a type: where it is and what lives
/// there. With `HAS_SUFFIX` the entry past the last real field describes
/// the trailing-array element type and its `offset` is unused.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Field {
    pub ty: *mut Type,
    pub offset: u32,
    pub flags: u32,
}

/// Head of a type descriptor object. Followed in memory by `count`
/// [Field] entries.
#[repr(C)]
pub struct Type {
    /// Trailing [Field] entries, including the suffix element entry.
    pub(crate) count: u32,
    /// Size of the fixed head of an instance, including its own suffix
    /// count prefix when `HAS_SUFFIX`.
    pub data_size: u32,
    /// Trailing-array element stride, or 0.
    pub elem_size: u32,
    pub(crate) flags: TypeFlags,
    /// Diagnostic name.
    pub name: Str,
}

impl Type {
    #[inline(always)]
    pub fn is_ref(&self) -> bool {
        self.flags.is_ref()
    }

    #[inline(always)]
    pub fn has_refs(&self) -> bool {
        self.flags.has_refs()
    }

    #[inline(always)]
    pub fn has_suffix(&self) -> bool {
        self.flags.has_suffix()
    }

    /// Whether instances carry any references the tracer must follow.
    #[inline(always)]
    pub fn traced(&self) -> bool {
        self.is_ref() || self.has_refs()
    }

    /// All trailing entries, suffix element entry included.
    #[inline]
    pub(crate) unsafe fn entries(&self) -> &[Field] {
        let base = (self as *const Type as *const u8).add(size_of::<Type>()) as *const Field;
        slice::from_raw_parts(base, self.count as usize)
    }

    /// The reference-bearing fields of the fixed head.
    #[inline]
    pub(crate) unsafe fn ref_fields(&self) -> &[Field] {
        let entries = self.entries();
        let fields = entries.len() - self.has_suffix() as usize;
        &entries[..fields]
    }

    /// Element type of the trailing array. Only valid with `HAS_SUFFIX`.
    #[inline]
    pub(crate) unsafe fn suffix_elem(&self) -> *mut Type {
        debug_assert!(self.has_suffix());
        self.entries()[self.count as usize - 1].ty
    }

    pub unsafe fn name_bytes(&self) -> &[u8] {
        self.name.as_bytes()
    }
}

/// Descriptor literal handed to `new_type`. `fields` lists only the
/// reference-bearing offsets; flags are derived.
pub struct TypeInit<'a> {
    pub name: &'a str,
    pub data_size: u32,
    pub elem_size: u32,
    pub is_ref: bool,
    pub fields: &'a [FieldInit],
    pub suffix: Option<*mut Type>,
}

pub struct FieldInit {
    pub ty: *mut Type,
    pub offset: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_head_layout() {
        // The trailing Field array is addressed right past the head, and
        // the count word is the instance's own suffix length prefix.
        assert_eq!(size_of::<Type>(), 32);
        assert_eq!(std::mem::offset_of!(Type, count), 0);
        assert_eq!(std::mem::offset_of!(Type, name), 16);
        assert_eq!(size_of::<Field>(), 16);
        assert_eq!(size_of::<Str>(), 16);
    }
}
