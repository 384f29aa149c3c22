//! The runtime's error value.
//!
//! Builtins report failures as a small immutable managed value holding a
//! message; the surface language turns these into exceptions. The
//! runtime defines the value and the bounds check that produces the most
//! common one — unwinding policy belongs to the caller.

use std::ptr::null_mut;

use crate::header::ObjHeader;
use crate::thread::Thread;
use crate::types::Str;

pub const MSG_BOUNDS: &str = "Bounds check";

/// Payload of an error object: just the message.
#[repr(C)]
pub struct ErrorVal {
    pub message: Str,
}

/// Payload size of an object as its descriptor sees it.
pub unsafe fn obj_size(payload: *mut u8) -> usize {
    let ty = (*ObjHeader::of(payload)).ty();
    let mut size = (*ty).data_size as usize;
    if (*ty).has_suffix() {
        size += (*ty).elem_size as usize * array_len(payload) as usize;
    }
    size
}

/// Element count of a suffix-carrying object.
#[inline]
pub unsafe fn array_len(payload: *mut u8) -> u32 {
    *(payload as *const u32)
}

/// Bounds test: whether accesses up to `end_offset` stay inside the
/// object. Null passes only for empty ranges.
pub unsafe fn check(payload: *mut u8, end_offset: usize) -> bool {
    if end_offset == 0 {
        return true;
    }
    if payload.is_null() {
        return false;
    }
    end_offset <= obj_size(payload)
}

impl Thread {
    /// Allocate an error value carrying `msg`. Returns null on OOM.
    pub fn make_error(&mut self, msg: &str) -> *mut u8 {
        let vm = unsafe { &*std::sync::Arc::as_ptr(self.vm_arc()) };
        let error_ty = vm.types().error;
        let err = self.alloc(error_ty);
        if err.is_null() {
            return null_mut();
        }
        let message = self.new_string(msg);
        unsafe {
            self.set_string(err, std::mem::offset_of!(ErrorVal, message), message);
        }
        err
    }

    /// Bounds-checked failure helper: null when the access fits, an
    /// error value otherwise.
    pub fn check_bounds(&mut self, payload: *mut u8, end_offset: usize) -> *mut u8 {
        unsafe {
            if check(payload, end_offset) {
                null_mut()
            } else {
                self.make_error(MSG_BOUNDS)
            }
        }
    }
}
