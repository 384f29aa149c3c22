//! Tracing engine: precise marking driven by type descriptors, and the
//! sweep that partitions survivors back into their groups.

use std::sync::atomic::Ordering as FenceOrdering;

use atomic::Ordering;

use crate::header::{Gen, ObjHeader};
use crate::lists::ObjList;
use crate::thread::Thread;
use crate::types::Type;
use crate::vm::{Group, Vm};

/// Mark the object at `payload`. With `to_g` (or when already tenured)
/// the object lands in the tenured group at the current major epoch;
/// otherwise its nursery epoch is brought current. Objects whose type
/// carries references are queued for traversal.
///
/// Concurrent markers race on the generation CAS; the loser sees the
/// winner's epoch and returns, so an object is queued at most once per
/// transition.
pub(crate) unsafe fn mark(vm: &Vm, thread: *mut Thread, payload: *mut u8, to_g: bool) {
    if payload.is_null() {
        return;
    }
    let hdr = ObjHeader::of(payload);
    let cur = vm.gen();
    loop {
        let og = (*hdr).gen.load(Ordering::Relaxed);
        let new = if og.g != 0 || to_g {
            if og.g == cur.g {
                return;
            }
            Gen { g: cur.g, n: og.n }
        } else {
            if og.n == cur.n {
                return;
            }
            Gen { g: 0, n: cur.n }
        };
        if (*hdr)
            .gen
            .compare_exchange_weak(og, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            break;
        }
    }
    let ty = (*hdr).ty;
    if !ty.is_null() && (*ty).traced() {
        (*thread).marks.push(hdr, &vm.objs_mark, &vm.objs_reuse);
    }
}

/// Mark one instance of `ty` at `ptr` (not necessarily a heap object:
/// root frames and interior struct fields come through here too).
pub(crate) unsafe fn mark_type(
    vm: &Vm,
    thread: *mut Thread,
    ptr: *mut u8,
    ty: *mut Type,
    to_g: bool,
) {
    let t = &*ty;
    if t.is_ref() {
        mark(vm, thread, *(ptr as *mut *mut u8), to_g);
        return;
    }
    if !t.has_refs() {
        return;
    }
    for field in t.ref_fields() {
        mark_type(vm, thread, ptr.add(field.offset as usize), field.ty, to_g);
    }
    if t.has_suffix() {
        let count = *(ptr as *const u32) as usize;
        let elem = t.suffix_elem();
        let stride = t.elem_size as usize;
        let base = ptr.add(t.data_size as usize);
        if (*elem).is_ref() {
            // Pointer array: skip the descriptor walk per element.
            let slots = base as *mut *mut u8;
            for i in 0..count {
                mark(vm, thread, *slots.add(i), to_g);
            }
        } else if (*elem).has_refs() {
            // Struct array.
            let mut p = base;
            for _ in 0..count {
                mark_type(vm, thread, p, elem, to_g);
                p = p.add(stride);
            }
        }
    }
}

/// One mark step: pop a list from the global mark stack and traverse
/// each object with its own group as the promotion hint, so everything a
/// tenured object reaches is promoted and cross-generation edges heal.
/// Returns whether work was performed.
pub(crate) unsafe fn gc_mark(vm: &Vm, thread: *mut Thread) -> bool {
    let list = vm.objs_mark.pop();
    if list.is_null() {
        return false;
    }
    for i in 0..(*list).count as usize {
        let hdr = (*list).objs[i];
        let to_g = (*hdr).generation().is_tenured();
        mark_type(vm, thread, (*hdr).payload(), (*hdr).ty, to_g);
    }
    ObjList::recycle(list, &vm.objs_reuse);
    true
}

/// One sweep step: pop a list from the sweep stack, keep survivors in
/// their group's alive buffer, free the rest. When the primary stack
/// drains, the deferred tenured chain moves in atomically. Returns
/// whether work was performed.
pub(crate) unsafe fn gc_sweep(vm: &Vm, thread: *mut Thread) -> bool {
    let mut list = vm.objs_sweep.pop();
    if list.is_null() {
        let chain = vm.objs_sweep_next.pop_all();
        if chain.is_null() {
            return false;
        }
        vm.objs_sweep.push_all(chain);
        list = vm.objs_sweep.pop();
        if list.is_null() {
            return false;
        }
    }
    let cur = vm.gen();
    for i in 0..(*list).count as usize {
        let hdr = (*list).objs[i];
        let og = (*hdr).generation();
        if og.is_alive(cur) {
            let group = if og.is_tenured() {
                Group::Tenured as usize
            } else {
                Group::Nursery as usize
            };
            (*thread)
                .alive[group]
                .push(hdr, &vm.objs_alive[group], &vm.objs_reuse);
        } else {
            free_obj(vm, hdr);
        }
    }
    ObjList::recycle(list, &vm.objs_reuse);
    true
}

/// Release a dead object: invalidate its weak slot, then return the
/// memory. The object's descriptor outlives it (descriptors are registry
/// roots), so the size is still computable here.
pub(crate) unsafe fn free_obj(vm: &Vm, hdr: *mut ObjHeader) {
    let slot = (*hdr).weak_slot.load(FenceOrdering::Relaxed);
    if slot != 0 {
        vm.weak_mutex.lock();
        (*vm.weaks.get()).release(slot);
        vm.weak_mutex.unlock();
    }
    let total = total_size(hdr);
    vm.stats.count_free(total);
    libc::free(hdr as *mut libc::c_void);
}

/// Allocated size of an object, header included.
pub(crate) unsafe fn total_size(hdr: *mut ObjHeader) -> usize {
    let ty = (*hdr).ty;
    let mut payload = (*ty).data_size as usize;
    if (*ty).has_suffix() {
        let count = *((*hdr).payload() as *const u32) as usize;
        payload += (*ty).elem_size as usize * count;
    }
    std::mem::size_of::<ObjHeader>() + payload
}
