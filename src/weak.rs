//! Weak references.
//!
//! A weak handle is a `{slot, generation}` pair packed in 64 bits. The
//! slot table pairs each slot with a generation counter that is bumped
//! whenever the slot is granted or reclaimed, so handles to a recycled
//! slot go permanently stale instead of resolving to a stranger.

use std::ptr::null_mut;
use std::sync::atomic::Ordering;

use crate::collect::Phase;
use crate::header::ObjHeader;
use crate::thread::Thread;
use crate::trace;
use crate::vm::Vm;

/// Weak handle: slot index in the high half, slot generation in the low.
/// `WeakRef::NULL` never resolves.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WeakRef(pub u64);

impl WeakRef {
    pub const NULL: WeakRef = WeakRef(0);

    #[inline]
    pub(crate) fn assemble(slot: u32, gen: u32) -> WeakRef {
        WeakRef(((slot as u64) << 32) | gen as u64)
    }

    #[inline]
    pub(crate) fn slot(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub(crate) fn generation(self) -> u32 {
        self.0 as u32
    }
}

/// A slot holds either the header of its target or, while free, the next
/// free slot index.
struct WeakSlot {
    val: u64,
    gen: u32,
}

/// Slot table; guarded by `weak_mutex`. Slot 0 is reserved as null.
pub(crate) struct WeakTable {
    slots: Vec<WeakSlot>,
    free_head: u32,
}

impl WeakTable {
    pub(crate) fn new() -> WeakTable {
        WeakTable {
            slots: vec![WeakSlot { val: 0, gen: 0 }],
            free_head: 0,
        }
    }

    /// Grant a slot for `hdr`: reuse the free list or extend the table.
    pub(crate) fn acquire(&mut self, hdr: *mut ObjHeader) -> (u32, u32) {
        let index = if self.free_head != 0 {
            let index = self.free_head;
            self.free_head = self.slots[index as usize].val as u32;
            index
        } else {
            self.slots.push(WeakSlot { val: 0, gen: 0 });
            (self.slots.len() - 1) as u32
        };
        let slot = &mut self.slots[index as usize];
        slot.val = hdr as u64;
        slot.gen = slot.gen.wrapping_add(1);
        (index, slot.gen)
    }

    /// Reclaim the slot of a freed object and invalidate its handles.
    pub(crate) fn release(&mut self, index: u32) {
        let free_head = self.free_head;
        let slot = &mut self.slots[index as usize];
        slot.gen = slot.gen.wrapping_add(1);
        slot.val = free_head as u64;
        self.free_head = index;
    }

    pub(crate) fn generation_of(&self, index: u32) -> u32 {
        self.slots[index as usize].gen
    }

    /// Header of the handle's target, if the handle is still live.
    pub(crate) fn get(&self, r: WeakRef) -> Option<*mut ObjHeader> {
        let index = r.slot() as usize;
        if index == 0 || index >= self.slots.len() {
            return None;
        }
        let slot = &self.slots[index];
        if slot.gen != r.generation() {
            return None;
        }
        Some(slot.val as *mut ObjHeader)
    }
}

impl Thread {
    /// Create (or re-fetch) a weak handle to `obj`.
    ///
    /// # Safety
    ///
    /// `obj` must be null or a live managed payload.
    pub unsafe fn make_weak(&mut self, obj: *mut u8) -> WeakRef {
        if obj.is_null() {
            return WeakRef::NULL;
        }
        let vm = &*std::sync::Arc::as_ptr(self.vm_arc());
        {
            let hdr = ObjHeader::of(obj);
            vm.weak_mutex.lock();
            let table = &mut *vm.weaks.get();
            let existing = (*hdr).weak_slot.load(Ordering::Relaxed);
            let r = if existing != 0 {
                WeakRef::assemble(existing, table.generation_of(existing))
            } else {
                let (index, gen) = table.acquire(hdr);
                (*hdr).weak_slot.store(index, Ordering::Relaxed);
                WeakRef::assemble(index, gen)
            };
            vm.weak_mutex.unlock();
            r
        }
    }

    /// Resolve a weak handle. Returns the target payload, or null if the
    /// handle is stale or the target is past reviving (the collector is
    /// sweeping and the object was not marked this cycle).
    ///
    /// The returned pointer must be rooted before this thread's next
    /// checkpoint; until then the in-flight cycle cannot complete past
    /// this thread's barrier.
    pub fn resolve_weak(&mut self, r: WeakRef) -> *mut u8 {
        if r == WeakRef::NULL {
            return null_mut();
        }
        let vm = unsafe { &*std::sync::Arc::as_ptr(self.vm_arc()) };
        // Fast path: target already marked this cycle.
        vm.weak_mutex.lock();
        let current = unsafe {
            let table = &*vm.weaks.get();
            match table.get(r) {
                None => Some(null_mut()),
                Some(hdr) => {
                    if (*hdr).generation().is_current(vm.gen()) {
                        Some((*hdr).payload())
                    } else {
                        None
                    }
                }
            }
        };
        vm.weak_mutex.unlock();
        if let Some(result) = current {
            return result;
        }
        // Stale target: deciding between "not yet traced" and "about to
        // be swept" needs the driver lock, which orders before the weak
        // lock and must not be taken while this thread's own lock is
        // held (the barrier would deadlock against it).
        let was_locked = self.yield_lock();
        vm.gc_mutex.lock();
        vm.weak_mutex.lock();
        let result = unsafe { resolve_stale(vm, self as *mut Thread, r) };
        vm.weak_mutex.unlock();
        vm.gc_mutex.unlock();
        self.restore_lock(was_locked);
        result
    }
}

/// Slow half of weak resolution; both `gc_mutex` and `weak_mutex` held.
pub(crate) unsafe fn resolve_stale(vm: &Vm, thread: *mut Thread, r: WeakRef) -> *mut u8 {
    let table = &*vm.weaks.get();
    let hdr = match table.get(r) {
        Some(hdr) => hdr,
        None => return null_mut(),
    };
    let og = (*hdr).generation();
    let payload = (*hdr).payload();
    if og.is_current(vm.gen()) {
        return payload;
    }
    if vm.phase.load(Ordering::Relaxed) == Phase::Sweep {
        // Too late to revive: the sweep owns unmarked objects now.
        return null_mut();
    }
    trace::mark(vm, thread, payload, false);
    payload
}
