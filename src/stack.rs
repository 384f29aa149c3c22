//! Lock-free intrusive stack used for every global object-list queue.
//!
//! The head word packs a 48-bit node address with a 16-bit tag that is
//! bumped on every successful CAS, so a node that is popped and pushed
//! back between another thread's load and CAS cannot be mistaken for an
//! unchanged head (ABA). Stable Rust has no double-width CAS; on the
//! virtual address widths we target the tag fits in the unused high bits
//! of a single word.

use std::ptr::null_mut;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::lists::ObjList;

const TAG_SHIFT: u32 = 48;
const ADDR_MASK: u64 = (1 << TAG_SHIFT) - 1;

#[inline(always)]
fn pack(ptr: *mut ObjList, tag: u64) -> u64 {
    debug_assert_eq!(ptr as u64 & !ADDR_MASK, 0, "node address exceeds 48 bits");
    ptr as u64 | (tag << TAG_SHIFT)
}

#[inline(always)]
fn unpack(word: u64) -> (*mut ObjList, u64) {
    ((word & ADDR_MASK) as *mut ObjList, word >> TAG_SHIFT)
}

/// Treiber stack of [ObjList] nodes. A node's first word is its
/// next-pointer; the stack never owns the nodes it links.
pub struct TaggedStack {
    head: CachePadded<AtomicU64>,
    len: AtomicUsize,
}

impl TaggedStack {
    pub const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU64::new(0)),
            len: AtomicUsize::new(0),
        }
    }

    /// Push a single node.
    pub fn push(&self, node: *mut ObjList) {
        debug_assert!(!node.is_null());
        let backoff = Backoff::new();
        let mut cur = self.head.load(Ordering::Relaxed);
        loop {
            let (head, tag) = unpack(cur);
            unsafe {
                (*node).next = head;
            }
            let next = pack(node, tag.wrapping_add(1));
            match self
                .head
                .compare_exchange_weak(cur, next, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(actual) => {
                    cur = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Install a complete chain. The stack must be observed empty at the
    /// moment of the install; this is only used to hand a finished list
    /// across collector phases and anything else is a programmer error.
    pub fn push_all(&self, chain: *mut ObjList) {
        if chain.is_null() {
            return;
        }
        let mut count = 0usize;
        let mut node = chain;
        while !node.is_null() {
            count += 1;
            node = unsafe { (*node).next };
        }
        let cur = self.head.load(Ordering::Relaxed);
        let (head, tag) = unpack(cur);
        assert!(head.is_null(), "push_all on a non-empty stack");
        let installed = self
            .head
            .compare_exchange(
                cur,
                pack(chain, tag.wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok();
        assert!(installed, "push_all raced with another producer");
        self.len.fetch_add(count, Ordering::Relaxed);
    }

    /// Pop one node, or null if the stack was observed empty. The popped
    /// node's next-pointer is cleared.
    pub fn pop(&self) -> *mut ObjList {
        let backoff = Backoff::new();
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (head, tag) = unpack(cur);
            if head.is_null() {
                return null_mut();
            }
            // Nodes are recycled through the reuse stack and never
            // unmapped while the VM lives, so this read cannot fault even
            // if the node was concurrently popped; the tag check below
            // rejects the stale value.
            let next = unsafe { (*head).next };
            match self.head.compare_exchange_weak(
                cur,
                pack(next, tag.wrapping_add(1)),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    unsafe {
                        (*head).next = null_mut();
                    }
                    return head;
                }
                Err(actual) => {
                    cur = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Detach the whole chain, or null if empty.
    pub fn pop_all(&self) -> *mut ObjList {
        let mut cur = self.head.load(Ordering::Acquire);
        loop {
            let (head, tag) = unpack(cur);
            if head.is_null() {
                return null_mut();
            }
            match self.head.compare_exchange_weak(
                cur,
                pack(null_mut(), tag.wrapping_add(1)),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.store(0, Ordering::Relaxed);
                    return head;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Node count, accurate only when no other thread is mid-operation.
    #[inline]
    pub fn approx_len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let (head, _) = unpack(self.head.load(Ordering::Acquire));
        head.is_null()
    }
}

unsafe impl Send for TaggedStack {}
unsafe impl Sync for TaggedStack {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::{ObjList, OBJ_LIST_CAP};
    use rand::seq::SliceRandom;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    fn raw_node() -> usize {
        Box::into_raw(Box::new(ObjList {
            next: null_mut(),
            count: 0,
            objs: [null_mut(); OBJ_LIST_CAP],
        })) as usize
    }

    #[test]
    fn push_pop_single_thread() {
        let stack = TaggedStack::new();
        let a = raw_node();
        let b = raw_node();
        stack.push(a as *mut ObjList);
        stack.push(b as *mut ObjList);
        assert_eq!(stack.approx_len(), 2);
        assert_eq!(stack.pop() as usize, b);
        assert_eq!(stack.pop() as usize, a);
        assert!(stack.pop().is_null());
        assert_eq!(stack.approx_len(), 0);
        unsafe {
            drop(Box::from_raw(a as *mut ObjList));
            drop(Box::from_raw(b as *mut ObjList));
        }
    }

    #[test]
    fn push_all_hands_off_whole_chain() {
        let stack = TaggedStack::new();
        let nodes: Vec<usize> = (0..5).map(|_| raw_node()).collect();
        for &n in &nodes {
            stack.push(n as *mut ObjList);
        }
        let chain = stack.pop_all();
        assert!(stack.pop().is_null());
        let other = TaggedStack::new();
        other.push_all(chain);
        assert_eq!(other.approx_len(), 5);
        let mut seen = 0;
        loop {
            let node = other.pop();
            if node.is_null() {
                break;
            }
            seen += 1;
            unsafe { drop(Box::from_raw(node)) };
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn concurrent_multiset_is_preserved() {
        const PUSHERS: usize = 4;
        const PER_PUSHER: usize = 1000;
        let stack = Arc::new(TaggedStack::new());
        let done = Arc::new(AtomicBool::new(false));
        let popped = Arc::new(Mutex::new(Vec::<usize>::new()));

        let mut nodes: Vec<usize> = (0..PUSHERS * PER_PUSHER).map(|_| raw_node()).collect();
        let pushed: HashSet<usize> = nodes.iter().copied().collect();
        nodes.shuffle(&mut rand::thread_rng());

        let mut handles = Vec::new();
        for chunk in nodes.chunks(PER_PUSHER) {
            let chunk = chunk.to_vec();
            let stack = stack.clone();
            handles.push(std::thread::spawn(move || {
                for node in chunk {
                    stack.push(node as *mut ObjList);
                }
            }));
        }
        let mut poppers = Vec::new();
        for _ in 0..PUSHERS {
            let stack = stack.clone();
            let done = done.clone();
            let popped = popped.clone();
            poppers.push(std::thread::spawn(move || {
                let mut local = Vec::new();
                loop {
                    let node = stack.pop();
                    if node.is_null() {
                        if done.load(Ordering::Acquire) {
                            break;
                        }
                        std::thread::yield_now();
                    } else {
                        local.push(node as usize);
                    }
                }
                popped.lock().unwrap().extend(local);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        done.store(true, Ordering::Release);
        for h in poppers {
            h.join().unwrap();
        }
        let mut all = popped.lock().unwrap().clone();
        loop {
            let node = stack.pop();
            if node.is_null() {
                break;
            }
            all.push(node as usize);
        }
        // Multiset of pops equals multiset of pushes: same count, all
        // distinct, all known.
        assert_eq!(all.len(), pushed.len());
        let unique: HashSet<usize> = all.iter().copied().collect();
        assert_eq!(unique, pushed);
        assert_eq!(stack.approx_len(), 0);
        for node in all {
            unsafe { drop(Box::from_raw(node as *mut ObjList)) };
        }
    }
}
