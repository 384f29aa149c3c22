//! Collector driver.
//!
//! The collector is not a dedicated thread: whichever thread enters
//! [Thread::gc_step] advances the IDLE -> MARK -> SWEEP machine by one
//! step under `gc_mutex`. Mutators left behind are brought forward by
//! the thread barrier, which bumps the global checkpoint counter, takes
//! each thread's own lock in turn, and drains its buffers on its behalf.

use std::sync::atomic::Ordering;

use log::debug;

use crate::thread::Thread;
use crate::trace;
use crate::vm::{Group, Vm, GROUPS};

/// A major cycle runs at least this often so the tenured epoch distance
/// stays far below the 128-epoch aliveness window.
const MAJOR_INTERVAL: u32 = 4;

/// Collector phase. One cycle is IDLE -> MARK -> SWEEP -> IDLE.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Phase {
    Idle,
    Mark,
    Sweep,
}

/// Driver state beyond the phase word; guarded by `gc_mutex`.
pub(crate) struct Driver {
    pub cycle: u64,
    pub major_requested: bool,
    pub since_major: u32,
}

impl Driver {
    pub(crate) fn new() -> Driver {
        Driver {
            cycle: 0,
            major_requested: false,
            since_major: 0,
        }
    }
}

impl Thread {
    /// Advance the collector one step. Returns the phase after the step;
    /// a cycle has finished when this comes back to [Phase::Idle].
    pub fn gc_step(&mut self) -> Phase {
        let vm = unsafe { &*std::sync::Arc::as_ptr(self.vm_arc()) };
        // A blocking take of gc_mutex must not happen while this thread's
        // own lock is held: the barrier inside would wait on the very
        // mutators that are waiting on gc_mutex.
        let was_locked = self.yield_lock();
        vm.gc_mutex.lock();
        let phase = unsafe { gc_step_locked(vm, self as *mut Thread) };
        vm.gc_mutex.unlock();
        self.restore_lock(was_locked);
        phase
    }

    /// Opportunistic collector step at allocation pressure: advances an
    /// in-flight cycle only if the driver lock is free, and never starts
    /// a new cycle.
    pub fn gc_assist(&mut self) {
        let vm = unsafe { &*std::sync::Arc::as_ptr(self.vm_arc()) };
        if !vm.gc_mutex.try_lock() {
            return;
        }
        if vm.phase.load(Ordering::Relaxed) != Phase::Idle {
            unsafe {
                gc_step_locked(vm, self as *mut Thread);
            }
        }
        vm.gc_mutex.unlock();
    }

    /// Make the next cycle a major one.
    pub fn request_major(&mut self) {
        let vm = unsafe { &*std::sync::Arc::as_ptr(self.vm_arc()) };
        let was_locked = self.yield_lock();
        vm.gc_mutex.lock();
        unsafe {
            (*vm.driver.get()).major_requested = true;
        }
        vm.gc_mutex.unlock();
        self.restore_lock(was_locked);
    }

    /// Drive the collector until it returns to idle, starting a cycle if
    /// none is in flight.
    pub fn collect_cycle(&mut self) {
        self.gc_step();
        while self.gc_step() != Phase::Idle {}
    }

    /// Run one full minor cycle (resets the interval policy so the cycle
    /// cannot be upgraded).
    pub fn collect_minor(&mut self) {
        let vm = unsafe { &*std::sync::Arc::as_ptr(self.vm_arc()) };
        let was_locked = self.yield_lock();
        vm.gc_mutex.lock();
        unsafe {
            let driver = &mut *vm.driver.get();
            driver.major_requested = false;
            driver.since_major = 0;
        }
        vm.gc_mutex.unlock();
        self.restore_lock(was_locked);
        self.collect_cycle();
    }

    /// Run one full major cycle.
    pub fn collect_major(&mut self) {
        self.request_major();
        self.collect_cycle();
    }
}

/// One driver step; `gc_mutex` is held by the caller.
pub(crate) unsafe fn gc_step_locked(vm: &Vm, th: *mut Thread) -> Phase {
    match vm.phase.load(Ordering::Relaxed) {
        Phase::Idle => {
            begin_cycle(vm, th);
            Phase::Mark
        }
        Phase::Mark => {
            if trace::gc_mark(vm, th) {
                Phase::Mark
            } else {
                // No queued work: force every thread past the checkpoint
                // so buffered marks and deferred links surface, then look
                // again.
                thread_barrier(vm, th);
                if vm.objs_mark.is_empty() {
                    enter_sweep(vm);
                    Phase::Sweep
                } else {
                    Phase::Mark
                }
            }
        }
        Phase::Sweep => {
            if trace::gc_sweep(vm, th) {
                Phase::Sweep
            } else {
                finish_cycle(vm);
                Phase::Idle
            }
        }
    }
}

unsafe fn begin_cycle(vm: &Vm, th: *mut Thread) {
    let driver = &mut *vm.driver.get();
    driver.cycle += 1;
    let major = driver.major_requested || driver.since_major >= MAJOR_INTERVAL;
    driver.major_requested = false;
    driver.since_major = if major { 0 } else { driver.since_major + 1 };
    vm.cycle_major.store(major, Ordering::Release);

    let gen = vm.gen().bump(major);
    vm.gen.store(gen, Ordering::Release);
    debug!(
        "gc: cycle {} begin ({}) g={} n={}",
        driver.cycle,
        if major { "major" } else { "minor" },
        gen.g,
        gen.n
    );

    // Global roots: every registered descriptor. The intern table holds
    // weak handles only and keeps nothing alive. Thread roots are scanned
    // by the barrier when each thread imports the bumped generation.
    for &ty in (*vm.registry.get()).iter() {
        trace::mark(vm, th, ty as *mut u8, major);
    }
    thread_barrier(vm, th);
    vm.phase.store(Phase::Mark, Ordering::Release);
}

unsafe fn enter_sweep(vm: &Vm) {
    let major = vm.cycle_major.load(Ordering::Relaxed);
    let nursery = Group::Nursery as usize;
    vm.objs_sweep.push_all(vm.objs_alive[nursery].pop_all());
    if major {
        let tenured = Group::Tenured as usize;
        vm.objs_sweep_next
            .push_all(vm.objs_alive[tenured].pop_all());
    }
    debug!(
        "gc: sweep begin, {} + {} lists",
        vm.objs_sweep.approx_len(),
        vm.objs_sweep_next.approx_len()
    );
    vm.phase.store(Phase::Sweep, Ordering::Release);
}

unsafe fn finish_cycle(vm: &Vm) {
    // This cycle's fresh allocations become the next minor sweep's
    // candidates.
    let nursery = Group::Nursery as usize;
    let mut node = vm.objs_alive[Group::Fresh as usize].pop_all();
    while !node.is_null() {
        let next = (*node).next;
        (*node).next = std::ptr::null_mut();
        vm.objs_alive[nursery].push(node);
        node = next;
    }
    let driver = &mut *vm.driver.get();
    let stats = vm.stats();
    debug!(
        "gc: cycle {} end, {} objects live",
        driver.cycle,
        stats.objs_allocated - stats.objs_freed
    );
    vm.phase.store(Phase::Idle, Ordering::Release);
}

/// Synchronize every registered thread past a fresh checkpoint.
///
/// Closes the fence, bumps the counter, then takes each thread's own
/// lock in turn and flushes on its behalf. A mutator that reaches a safe
/// point meanwhile releases its lock and waits on the fence, so the
/// barrier never deadlocks against it and no lock is held across the
/// fence wait.
pub(crate) unsafe fn thread_barrier(vm: &Vm, caller: *mut Thread) {
    vm.thread_mutex.lock();
    vm.thread_fence.close();
    vm.checkpoint_fence.store(true, Ordering::Release);
    vm.checkpoint.fetch_add(1, Ordering::AcqRel);
    for &thread in (*vm.threads.get()).iter() {
        if thread == caller {
            // The caller's lock is either not held (gc_step released it)
            // or held by the caller itself; its buffers are safe to touch.
            synchronize_thread(vm, thread, false);
        } else {
            (*thread).mutex.lock();
            synchronize_thread(vm, thread, false);
            (*thread).mutex.unlock();
        }
    }
    vm.checkpoint_fence.store(false, Ordering::Release);
    vm.thread_fence.open();
    vm.thread_mutex.unlock();
}

/// Bring one thread up to date: import the bumped generation (rescanning
/// the thread's root frames), drain deferred links, and publish buffered
/// marks and alive lists. With `drain` the thread also helps mark to
/// completion, so a mutator arriving at a checkpoint pays its share of
/// the mark work.
pub(crate) unsafe fn synchronize_thread(vm: &Vm, thread: *mut Thread, drain: bool) {
    let gen = vm.gen();
    if (*thread).gen != gen {
        (*thread).gen = gen;
        scan_roots(vm, thread);
    }
    (*thread).flush_links();
    (*thread).marks.flush(&vm.objs_mark);
    for group in 0..GROUPS {
        (*thread).alive[group].flush(&vm.objs_alive[group]);
    }
    (*thread).checkpoint = vm.checkpoint.load(Ordering::Acquire);
    if drain {
        loop {
            while trace::gc_mark(vm, thread) {}
            if (*thread).marks.is_empty() {
                break;
            }
            (*thread).marks.flush(&vm.objs_mark);
        }
    }
}

/// Precisely scan every root frame of a thread using the frame's type.
unsafe fn scan_roots(vm: &Vm, thread: *mut Thread) {
    let major = vm.cycle_major.load(Ordering::Relaxed);
    let frame_count = (*thread).frames.len();
    for i in 0..frame_count {
        let frame = (&(*thread).frames)[i];
        let stride = (*frame.ty).data_size as usize;
        let mut ptr = (*thread).root_bytes.as_ptr().add(frame.offset) as *mut u8;
        for _ in 0..frame.count {
            trace::mark_type(vm, thread, ptr, frame.ty, major);
            ptr = ptr.add(stride);
        }
    }
}
