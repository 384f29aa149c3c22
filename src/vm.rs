//! VM construction and global collector state.
//!
//! One [Vm] is shared by any number of mutator threads. It owns the
//! global work-list stacks the collector phases hand object batches
//! through, the weak/intern tables, the type registry, and the
//! generation/checkpoint counters every thread synchronizes against.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use atomic::Atomic;

use crate::collect::{Driver, Phase};
use crate::header::{Gen, ObjHeader};
use crate::intern::InternTable;
use crate::stack::TaggedStack;
use crate::sync::{Fence, Mutex};
use crate::thread::Thread;
use crate::types::{Field, Str, Type, TypeFlags, TypeInit};
use crate::weak::WeakTable;

/// Survivor groups. Each is a global stack of object lists plus one
/// thread-local fill buffer per mutator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub(crate) enum Group {
    /// Promoted objects, swept only on major cycles.
    Tenured = 0,
    /// Nursery objects from earlier cycles, swept every cycle.
    Nursery = 1,
    /// Objects allocated during the current cycle.
    Fresh = 2,
}

pub(crate) const GROUPS: usize = 3;

/// Payload pointers of the bootstrapped descriptor set.
#[derive(Clone, Copy)]
pub struct Types {
    /// The descriptor type; describes itself.
    pub ty: *mut Type,
    /// Entry of a descriptor's trailing field table.
    pub field: *mut Type,
    pub byte: *mut Type,
    pub u32_: *mut Type,
    /// Length-prefixed byte array backing strings and symbols.
    pub char_array: *mut Type,
    pub string: *mut Type,
    /// Generic reference cell; also the usual root-frame type.
    pub any_ref: *mut Type,
    pub ptr_char: *mut Type,
    pub ptr_type: *mut Type,
    pub error: *mut Type,
}

impl Types {
    const fn null() -> Types {
        Types {
            ty: null_mut(),
            field: null_mut(),
            byte: null_mut(),
            u32_: null_mut(),
            char_array: null_mut(),
            string: null_mut(),
            any_ref: null_mut(),
            ptr_char: null_mut(),
            ptr_type: null_mut(),
            error: null_mut(),
        }
    }
}

pub struct Stats {
    pub(crate) objs_alloc: AtomicUsize,
    pub(crate) objs_freed: AtomicUsize,
    pub(crate) bytes_alloc: AtomicUsize,
    pub(crate) bytes_freed: AtomicUsize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub objs_allocated: usize,
    pub objs_freed: usize,
    pub bytes_allocated: usize,
    pub bytes_freed: usize,
}

impl Stats {
    const fn new() -> Stats {
        Stats {
            objs_alloc: AtomicUsize::new(0),
            objs_freed: AtomicUsize::new(0),
            bytes_alloc: AtomicUsize::new(0),
            bytes_freed: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub(crate) fn count_alloc(&self, bytes: usize) {
        self.objs_alloc.fetch_add(1, Ordering::Relaxed);
        self.bytes_alloc.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn count_free(&self, bytes: usize) {
        self.objs_freed.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Shared heap state. Construct with [Vm::new], attach mutators with
/// [Vm::make_thread](crate::thread::ThreadRef).
pub struct Vm {
    /// Current generation; bumped once per cycle before root marking.
    pub(crate) gen: Atomic<Gen>,
    /// Whether the in-flight cycle traces and sweeps the tenured set.
    pub(crate) cycle_major: AtomicBool,
    /// Monotonic safe-point counter mutators synchronize to.
    pub(crate) checkpoint: AtomicU64,
    /// Raised while the thread barrier runs; checkpointing mutators
    /// release their own lock and wait on `thread_fence`.
    pub(crate) checkpoint_fence: AtomicBool,
    pub(crate) thread_fence: Fence,
    pub(crate) phase: Atomic<Phase>,

    /// Guards the mutator registry.
    pub(crate) thread_mutex: Mutex,
    /// Guards the driver state machine and the type registry.
    pub(crate) gc_mutex: Mutex,
    /// Guards the weak slot table and the intern table.
    pub(crate) weak_mutex: Mutex,

    pub(crate) threads: UnsafeCell<Vec<*mut Thread>>,
    pub(crate) driver: UnsafeCell<Driver>,
    pub(crate) registry: UnsafeCell<Vec<*mut Type>>,
    pub(crate) prim: UnsafeCell<Types>,
    pub(crate) weaks: UnsafeCell<WeakTable>,
    pub(crate) interns: UnsafeCell<InternTable>,

    pub(crate) objs_mark: TaggedStack,
    pub(crate) objs_alive: [TaggedStack; GROUPS],
    pub(crate) objs_sweep: TaggedStack,
    pub(crate) objs_sweep_next: TaggedStack,
    pub(crate) objs_reuse: TaggedStack,

    pub(crate) stats: Stats,
}

unsafe impl Send for Vm {}
unsafe impl Sync for Vm {}

impl Vm {
    /// Construct a VM and bootstrap its descriptor set.
    pub fn new() -> Arc<Vm> {
        let vm = Arc::new(Vm {
            gen: Atomic::new(Gen::FIRST),
            cycle_major: AtomicBool::new(false),
            checkpoint: AtomicU64::new(1),
            checkpoint_fence: AtomicBool::new(false),
            thread_fence: Fence::new(),
            phase: Atomic::new(Phase::Idle),
            thread_mutex: Mutex::new(),
            gc_mutex: Mutex::new(),
            weak_mutex: Mutex::new(),
            threads: UnsafeCell::new(Vec::new()),
            driver: UnsafeCell::new(Driver::new()),
            registry: UnsafeCell::new(Vec::new()),
            prim: UnsafeCell::new(Types::null()),
            weaks: UnsafeCell::new(WeakTable::new()),
            interns: UnsafeCell::new(InternTable::new()),
            objs_mark: TaggedStack::new(),
            objs_alive: [TaggedStack::new(), TaggedStack::new(), TaggedStack::new()],
            objs_sweep: TaggedStack::new(),
            objs_sweep_next: TaggedStack::new(),
            objs_reuse: TaggedStack::new(),
            stats: Stats::new(),
        });
        let mut boot = Vm::make_thread(&vm);
        boot.lock();
        unsafe {
            bootstrap(&vm, &mut boot);
        }
        boot.unlock();
        vm
    }

    #[inline]
    pub(crate) fn gen(&self) -> Gen {
        self.gen.load(Ordering::Acquire)
    }

    /// Bootstrapped descriptor set.
    #[inline]
    pub fn types(&self) -> &Types {
        unsafe { &*self.prim.get() }
    }

    /// Current collector phase; racy outside `gc_mutex`, fine for tests
    /// and logging.
    #[inline]
    pub fn gc_phase(&self) -> Phase {
        self.phase.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            objs_allocated: self.stats.objs_alloc.load(Ordering::Relaxed),
            objs_freed: self.stats.objs_freed.load(Ordering::Relaxed),
            bytes_allocated: self.stats.bytes_alloc.load(Ordering::Relaxed),
            bytes_freed: self.stats.bytes_freed.load(Ordering::Relaxed),
        }
    }

    /// Whether `obj` has been promoted out of the nursery.
    ///
    /// # Safety
    ///
    /// `obj` must be a live managed payload.
    pub unsafe fn is_tenured(&self, obj: *mut u8) -> bool {
        (*ObjHeader::of(obj)).generation().is_tenured()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        unsafe {
            // Every live object sits in exactly one alive or sweep list;
            // mark lists alias those objects so their nodes are dropped
            // without freeing.
            let object_stacks = [
                &self.objs_alive[0],
                &self.objs_alive[1],
                &self.objs_alive[2],
                &self.objs_sweep,
                &self.objs_sweep_next,
            ];
            for stack in object_stacks {
                let mut node = stack.pop_all();
                while !node.is_null() {
                    let next = (*node).next;
                    for i in 0..(*node).count as usize {
                        libc::free((*node).objs[i] as *mut libc::c_void);
                    }
                    drop(Box::from_raw(node));
                    node = next;
                }
            }
            for stack in [&self.objs_mark, &self.objs_reuse] {
                let mut node = stack.pop_all();
                while !node.is_null() {
                    let next = (*node).next;
                    drop(Box::from_raw(node));
                    node = next;
                }
            }
        }
    }
}

/// Register a descriptor as a global root.
pub(crate) unsafe fn register_type(vm: &Vm, ty: *mut Type) {
    vm.gc_mutex.lock();
    (*vm.registry.get()).push(ty);
    vm.gc_mutex.unlock();
}

impl Thread {
    /// Allocate and register a new type descriptor. The descriptor is a
    /// managed object kept alive by the VM type registry.
    pub fn new_type(&mut self, init: &TypeInit) -> *mut Type {
        unsafe {
            let vm = &*std::sync::Arc::as_ptr(self.vm_arc());
            let entries = init.fields.len() + init.suffix.is_some() as usize;
            let payload = self.alloc_array(vm.types().ty, entries as u32);
            if payload.is_null() {
                return null_mut();
            }
            let ty = payload as *mut Type;
            // Rooted until it lands in the registry; registration yields
            // this thread's lock and a cycle may run in between.
            let frame = self.push_frame(vm.types().any_ref, 1);
            *(frame as *mut *mut u8) = payload;
            // alloc_array wrote `count`; fill the rest of the head.
            (*ty).data_size = init.data_size;
            (*ty).elem_size = init.elem_size;
            let has_refs = !init.fields.is_empty()
                || init.suffix.map_or(false, |s| (*s).traced());
            (*ty).flags = TypeFlags::new()
                .with_is_ref(init.is_ref)
                .with_has_refs(has_refs)
                .with_has_suffix(init.suffix.is_some());
            if init.suffix.is_some() {
                assert!(
                    init.data_size >= 4,
                    "suffix types start with their u32 count prefix"
                );
            }
            let slots = payload.add(std::mem::size_of::<Type>()) as *mut Field;
            for (i, f) in init.fields.iter().enumerate() {
                slots.add(i).write(Field {
                    ty: f.ty,
                    offset: f.offset,
                    flags: 0,
                });
            }
            if let Some(elem) = init.suffix {
                slots.add(init.fields.len()).write(Field {
                    ty: elem,
                    offset: 0,
                    flags: 0,
                });
            }
            (*ty).name = self.new_string(init.name);
            let was_locked = self.yield_lock();
            register_type(vm, ty);
            self.restore_lock(was_locked);
            self.pop_frame_check(frame);
            ty
        }
    }
}

/// Build the descriptor set. The descriptor type describes itself, so it
/// is allocated with a null type and patched once it exists; everything
/// here runs on the bootstrap thread before the VM is shared.
unsafe fn bootstrap(vm: &Arc<Vm>, th: &mut Thread) {
    use std::mem::{offset_of, size_of};

    let head = size_of::<Type>();
    let entry = size_of::<Field>();

    unsafe fn alloc_ty(th: &mut Thread, entries: usize) -> *mut Type {
        let payload = th.alloc_untyped(size_of::<Type>() + entries * size_of::<Field>());
        let ty = payload as *mut Type;
        (*ty).count = entries as u32;
        ty
    }

    let t_ty = alloc_ty(th, 2); // name.data field + suffix element entry
    let t_field = alloc_ty(th, 1);
    let t_byte = alloc_ty(th, 0);
    let t_u32 = alloc_ty(th, 0);
    let t_char_array = alloc_ty(th, 1);
    let t_any_ref = alloc_ty(th, 0);
    let t_ptr_char = alloc_ty(th, 0);
    let t_ptr_type = alloc_ty(th, 0);
    let t_string = alloc_ty(th, 1);
    let t_error = alloc_ty(th, 1);

    let all = [
        t_ty,
        t_field,
        t_byte,
        t_u32,
        t_char_array,
        t_any_ref,
        t_ptr_char,
        t_ptr_type,
        t_string,
        t_error,
    ];
    for &t in all.iter() {
        (*ObjHeader::of(t as *mut u8)).ty = t_ty;
    }

    let refs = TypeFlags::new().with_has_refs(true);
    let cell = TypeFlags::new().with_is_ref(true);

    (*t_ty).data_size = head as u32;
    (*t_ty).elem_size = entry as u32;
    (*t_ty).flags = refs.with_has_suffix(true);
    let slots = (t_ty as *mut u8).add(head) as *mut Field;
    slots.write(Field {
        ty: t_ptr_char,
        offset: (offset_of!(Type, name) + offset_of!(Str, data)) as u32,
        flags: 0,
    });
    slots.add(1).write(Field {
        ty: t_field,
        offset: 0,
        flags: 0,
    });

    (*t_field).data_size = entry as u32;
    (*t_field).elem_size = 0;
    (*t_field).flags = refs;
    let slots = (t_field as *mut u8).add(head) as *mut Field;
    slots.write(Field {
        ty: t_ptr_type,
        offset: offset_of!(Field, ty) as u32,
        flags: 0,
    });

    (*t_byte).data_size = 1;
    (*t_u32).data_size = 4;

    (*t_char_array).data_size = 4;
    (*t_char_array).elem_size = 1;
    (*t_char_array).flags = TypeFlags::new().with_has_suffix(true);
    let slots = (t_char_array as *mut u8).add(head) as *mut Field;
    slots.write(Field {
        ty: t_byte,
        offset: 0,
        flags: 0,
    });

    for &t in [t_any_ref, t_ptr_char, t_ptr_type].iter() {
        (*t).data_size = size_of::<*mut u8>() as u32;
        (*t).flags = cell;
    }

    for &t in [t_string, t_error].iter() {
        (*t).data_size = size_of::<Str>() as u32;
        (*t).flags = refs;
        let slots = (t as *mut u8).add(head) as *mut Field;
        slots.write(Field {
            ty: t_ptr_char,
            offset: offset_of!(Str, data) as u32,
            flags: 0,
        });
    }

    *vm.prim.get() = Types {
        ty: t_ty,
        field: t_field,
        byte: t_byte,
        u32_: t_u32,
        char_array: t_char_array,
        string: t_string,
        any_ref: t_any_ref,
        ptr_char: t_ptr_char,
        ptr_type: t_ptr_type,
        error: t_error,
    };

    // Names can only be built once the char array type exists.
    let names = [
        "Type",
        "Field",
        "Byte",
        "U32",
        "CharArray",
        "Ref",
        "PtrChar",
        "PtrType",
        "String",
        "Error",
    ];
    let order = [
        t_ty,
        t_field,
        t_byte,
        t_u32,
        t_char_array,
        t_any_ref,
        t_ptr_char,
        t_ptr_type,
        t_string,
        t_error,
    ];
    for (&t, name) in order.iter().zip(names) {
        (*t).name = th.new_string(name);
    }

    for &t in all.iter() {
        register_type(vm, t);
    }
}
