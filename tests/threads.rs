//! Multi-thread heap stress: several mutators allocating, linking, and
//! lending the collector steps while cycles run concurrently.

use std::sync::Arc;

use ebi::{FieldInit, Type, TypeInit, Vm};

fn make_pair(vm: &Arc<Vm>) -> usize {
    let mut thread = Vm::make_thread(vm);
    thread.lock();
    let refs = vm.types().any_ref;
    let pair = thread.new_type(&TypeInit {
        name: "Pair",
        data_size: 16,
        elem_size: 0,
        is_ref: false,
        fields: &[
            FieldInit { ty: refs, offset: 0 },
            FieldInit { ty: refs, offset: 8 },
        ],
        suffix: None,
    });
    thread.unlock();
    pair as usize
}

#[test]
fn mutators_and_collector_share_the_heap() {
    let _ = env_logger::builder().is_test(true).try_init();
    let vm = Vm::new();
    let pair_addr = make_pair(&vm);

    let mut handles = Vec::new();
    for seed in 0..4u64 {
        let vm = vm.clone();
        handles.push(std::thread::spawn(move || {
            let pair = pair_addr as *mut Type;
            let mut thread = Vm::make_thread(&vm);
            thread.lock();
            let root = thread.push_frame(vm.types().any_ref, 1) as *mut *mut u8;
            let mut kept = thread.alloc(pair);
            assert!(!kept.is_null());
            unsafe {
                *root = kept;
            }
            for i in 0..5000u64 {
                let obj = thread.alloc(pair);
                assert!(!obj.is_null());
                // Every third object extends the rooted chain, the rest
                // are garbage by the next cycle.
                if (i + seed) % 3 == 0 {
                    unsafe {
                        thread.assign_ref(obj, 0, kept);
                        kept = obj;
                        *root = kept;
                    }
                }
                if i % 64 == 0 {
                    thread.checkpoint();
                }
                if i % 512 == 0 {
                    thread.gc_step();
                }
            }
            // Walk the rooted chain; every node must still be intact.
            let mut len = 0usize;
            let mut cursor = kept;
            unsafe {
                while !cursor.is_null() {
                    len += 1;
                    cursor = *(cursor as *mut *mut u8);
                }
            }
            assert!(len > 1000);
            thread.unlock();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // All mutator roots are gone; a couple of majors reclaim the chains.
    let mut thread = Vm::make_thread(&vm);
    thread.lock();
    thread.collect_major();
    thread.collect_major();
    thread.unlock();
    let stats = vm.stats();
    assert!(stats.objs_freed > 10_000, "stats: {:?}", stats);
    assert!(stats.objs_freed <= stats.objs_allocated);
}

#[test]
fn concurrent_interning_agrees_across_threads() {
    let vm = Vm::new();
    let names: Vec<String> = (0..32).map(|i| format!("symbol-{}", i)).collect();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let vm = vm.clone();
        let names = names.clone();
        handles.push(std::thread::spawn(move || {
            let mut thread = Vm::make_thread(&vm);
            thread.lock();
            let roots =
                thread.push_frame(vm.types().any_ref, names.len() as u32) as *mut *mut u8;
            let mut symbols = Vec::new();
            for (i, name) in names.iter().enumerate() {
                let sym = thread.intern(name.as_bytes());
                assert!(!sym.is_null());
                unsafe {
                    *roots.add(i) = sym;
                }
                symbols.push(sym as usize);
            }
            // While rooted, re-interning is pointer-stable even with
            // cycles running.
            for round in 0..8 {
                if round % 2 == 0 {
                    thread.gc_step();
                }
                for (i, name) in names.iter().enumerate() {
                    assert_eq!(thread.intern(name.as_bytes()) as usize, symbols[i]);
                }
                thread.checkpoint();
            }
            thread.unlock();
            // Hold the registration until every thread has compared.
            (thread, symbols)
        }));
    }
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    // Symbols are canonical across threads while any holder lives.
    for (_, symbols) in results.iter().skip(1) {
        assert_eq!(symbols, &results[0].1);
    }
}
