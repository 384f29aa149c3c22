//! String interning over weak references.
//!
//! An open-addressing Robin Hood table keyed by content hash, storing
//! weak handles to managed char arrays. The table never keeps a symbol
//! alive: dead entries linger until a rehash prunes them, so uniqueness
//! is eventual — a dead symbol may transiently coexist with its fresh
//! replacement.

use std::ptr::null_mut;
use std::sync::atomic::Ordering;

use log::trace as log_trace;

use crate::collect::Phase;
use crate::thread::Thread;
use crate::trace;
use crate::vm::Vm;
use crate::weak::WeakRef;

const INITIAL_SLOTS: usize = 64;

#[derive(Clone, Copy)]
struct Entry {
    hash: u32,
    handle: WeakRef,
}

const EMPTY: Entry = Entry {
    hash: 0,
    handle: WeakRef::NULL,
};

/// Intern table; guarded by `weak_mutex`, with the driver lock held
/// around operations that consult the collector phase.
pub(crate) struct InternTable {
    slots: Vec<Entry>,
    used: usize,
}

#[inline]
fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = 0x811c_9dc5u32;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

impl InternTable {
    pub(crate) fn new() -> InternTable {
        InternTable {
            slots: vec![EMPTY; INITIAL_SLOTS],
            used: 0,
        }
    }

    /// Entries the table accepts before rehashing: 7/8 of the slots.
    #[inline]
    fn capacity(&self) -> usize {
        self.slots.len() - self.slots.len() / 8
    }
}

/// Symbol payload bytes: length prefix, then content.
unsafe fn symbol_eq(payload: *mut u8, bytes: &[u8]) -> bool {
    let len = *(payload as *const u32) as usize;
    if len != bytes.len() {
        return false;
    }
    let content = payload.add(std::mem::size_of::<u32>());
    std::slice::from_raw_parts(content, len) == bytes
}

/// Whether an entry's target can still come back: its slot generation
/// matches and the object is not already owned by an in-flight sweep.
unsafe fn probably_valid(vm: &Vm, entry: Entry) -> bool {
    let table = &*vm.weaks.get();
    let hdr = match table.get(entry.handle) {
        Some(hdr) => hdr,
        None => return false,
    };
    (*hdr).generation().is_current(vm.gen())
        || vm.phase.load(Ordering::Relaxed) != Phase::Sweep
}

/// Probe for a live symbol with this content, reviving it if the cycle
/// has not swept yet. Both `gc_mutex` and `weak_mutex` held.
unsafe fn lookup(vm: &Vm, thread: *mut Thread, hash: u32, bytes: &[u8]) -> Option<*mut u8> {
    let interns = &*vm.interns.get();
    let mask = interns.slots.len() - 1;
    let mut index = hash as usize & mask;
    loop {
        let entry = interns.slots[index];
        if entry.handle == WeakRef::NULL {
            return None;
        }
        if entry.hash == hash {
            let weaks = &*vm.weaks.get();
            if let Some(hdr) = weaks.get(entry.handle) {
                let payload = (*hdr).payload();
                if symbol_eq(payload, bytes) {
                    let og = (*hdr).generation();
                    if og.is_current(vm.gen()) {
                        return Some(payload);
                    }
                    if vm.phase.load(Ordering::Relaxed) != Phase::Sweep {
                        trace::mark(vm, thread, payload, false);
                        return Some(payload);
                    }
                    // Dead symbol; leave it for the next rehash.
                }
            }
        }
        index = (index + 1) & mask;
    }
}

fn robin_hood_insert(slots: &mut [Entry], mut entry: Entry) {
    let mask = slots.len() - 1;
    let mut index = entry.hash as usize & mask;
    let mut distance = 0usize;
    loop {
        let cur = &mut slots[index];
        if cur.handle == WeakRef::NULL {
            *cur = entry;
            return;
        }
        let cur_distance = index.wrapping_sub(cur.hash as usize) & mask;
        if cur_distance < distance {
            std::mem::swap(cur, &mut entry);
            distance = cur_distance;
        }
        index = (index + 1) & mask;
        distance += 1;
    }
}

/// Insert a fresh symbol handle; both locks held, content known absent.
unsafe fn insert(vm: &Vm, hash: u32, handle: WeakRef) {
    let interns = &mut *vm.interns.get();
    if interns.used >= interns.capacity() {
        rehash(vm);
    }
    let interns = &mut *vm.interns.get();
    robin_hood_insert(&mut interns.slots, Entry { hash, handle });
    interns.used += 1;
}

/// Prune entries whose weak handle is no longer probably valid, and grow
/// only if the survivors still crowd half the slots.
unsafe fn rehash(vm: &Vm) {
    let interns = &mut *vm.interns.get();
    let mut live = Vec::with_capacity(interns.used);
    for entry in interns.slots.iter() {
        if entry.handle != WeakRef::NULL && probably_valid(vm, *entry) {
            live.push(*entry);
        }
    }
    let new_len = if live.len() > interns.slots.len() / 2 {
        interns.slots.len() * 2
    } else {
        interns.slots.len()
    };
    log_trace!(
        "intern: rehash {} -> {} entries, {} slots",
        interns.used,
        live.len(),
        new_len
    );
    interns.slots.clear();
    interns.slots.resize(new_len, EMPTY);
    for entry in live.iter() {
        robin_hood_insert(&mut interns.slots, *entry);
    }
    interns.used = live.len();
}

impl Thread {
    /// Return the canonical symbol for `bytes`: an existing live symbol
    /// with the same content, or a fresh managed char array. The result
    /// follows the same rooting contract as
    /// [resolve_weak](Thread::resolve_weak).
    pub fn intern(&mut self, bytes: &[u8]) -> *mut u8 {
        assert!(self.locked, "intern outside lock/unlock span");
        let vm = unsafe { &*std::sync::Arc::as_ptr(self.vm_arc()) };
        let hash = fnv1a(bytes);
        let mut candidate: *mut u8 = null_mut();
        let mut candidate_weak = WeakRef::NULL;
        let mut frame: *mut u8 = null_mut();
        loop {
            // Probe under the driver and weak locks; this thread's own
            // lock is yielded first, as for any blocking take of gc_mutex.
            let was_locked = self.yield_lock();
            vm.gc_mutex.lock();
            vm.weak_mutex.lock();
            let result = unsafe {
                match lookup(vm, self as *mut Thread, hash, bytes) {
                    Some(symbol) => Some(symbol),
                    None if !candidate.is_null() => {
                        insert(vm, hash, candidate_weak);
                        Some(candidate)
                    }
                    None => None,
                }
            };
            vm.weak_mutex.unlock();
            vm.gc_mutex.unlock();
            self.restore_lock(was_locked);
            if let Some(symbol) = result {
                if !frame.is_null() {
                    self.pop_frame_check(frame);
                }
                return symbol;
            }
            // Miss: build the symbol rooted, then race the probe again;
            // if another thread interned the same content meanwhile we
            // return theirs and ours stays garbage.
            frame = self.push_frame(vm.types().any_ref, 1);
            let symbol = self.alloc_array(vm.types().char_array, bytes.len() as u32);
            if symbol.is_null() {
                self.pop_frame_check(frame);
                return null_mut();
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    symbol.add(std::mem::size_of::<u32>()),
                    bytes.len(),
                );
                *(frame as *mut *mut u8) = symbol;
                candidate = symbol;
                candidate_weak = self.make_weak(symbol);
            }
        }
    }
}
