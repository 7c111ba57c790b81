use std::{
    num::NonZeroUsize,
    sync::{Arc, atomic::{AtomicI64, Ordering}},
};

use parking_lot::Mutex;
use runtime::{BufferKey, KernelFault, Runtime, RuntimeConfig, RuntimeErr, Task};

fn runtime(nodes: usize, workers: usize) -> Runtime {
    let config = RuntimeConfig::new(
        NonZeroUsize::new(nodes).unwrap(),
        NonZeroUsize::new(workers),
    );
    Runtime::new(config).unwrap()
}

#[test]
fn diamond_graph_respects_data_dependencies() {
    let rt = runtime(2, 4);
    let (a, b, c, d) = (
        BufferKey::new(0, 0),
        BufferKey::new(1, 0),
        BufferKey::new(2, 0),
        BufferKey::new(3, 0),
    );
    rt.register([(a, 0, 8), (b, 0, 8), (c, 1, 8), (d, 1, 8)])
        .unwrap();

    let cells: Arc<Vec<AtomicI64>> = Arc::new((0..4).map(|_| AtomicI64::new(0)).collect());

    let v = Arc::clone(&cells);
    rt.submit(
        Task::new("init", 0, move || {
            v[0].store(3, Ordering::SeqCst);
            Ok(())
        })
        .write(a),
    )
    .unwrap();

    let v = Arc::clone(&cells);
    rt.submit(
        Task::new("left", 0, move || {
            v[1].store(v[0].load(Ordering::SeqCst) * 2, Ordering::SeqCst);
            Ok(())
        })
        .read(a)
        .write(b),
    )
    .unwrap();

    let v = Arc::clone(&cells);
    rt.submit(
        Task::new("right", 1, move || {
            v[2].store(v[0].load(Ordering::SeqCst) + 1, Ordering::SeqCst);
            Ok(())
        })
        .read(a)
        .write(c),
    )
    .unwrap();

    let v = Arc::clone(&cells);
    let join = rt
        .submit(
            Task::new("join", 1, move || {
                let sum = v[1].load(Ordering::SeqCst) + v[2].load(Ordering::SeqCst);
                v[3].store(sum, Ordering::SeqCst);
                Ok(())
            })
            .reads([b, c])
            .write(d),
        )
        .unwrap();

    join.wait().unwrap();
    assert_eq!(cells[3].load(Ordering::SeqCst), 10);

    rt.wait_for_all().unwrap();
    let stats = rt.stats();
    assert_eq!(stats.submitted, 4);
    assert_eq!(stats.executed, 4);
    // "right" reads `a` from node 0, "join" reads `b` from node 0.
    assert_eq!(stats.transfers, 2);
}

#[test]
fn many_independent_chains_finish() {
    let rt = runtime(1, 8);
    let chains = 16;
    let keys: Vec<_> = (0..chains).map(|t| BufferKey::new(t, 0)).collect();
    rt.register(keys.iter().map(|&k| (k, 0, 4))).unwrap();

    let logs: Arc<Vec<Mutex<Vec<usize>>>> =
        Arc::new((0..chains).map(|_| Mutex::new(Vec::new())).collect());

    for step in 0..20 {
        for (chain, &key) in keys.iter().enumerate() {
            let logs = Arc::clone(&logs);
            rt.submit(
                Task::new("step", 0, move || {
                    logs[chain].lock().push(step);
                    Ok(())
                })
                .write(key),
            )
            .unwrap();
        }
    }

    rt.wait_for_all().unwrap();
    for log in logs.iter() {
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
    }

    rt.unregister(&keys).unwrap();
    assert_eq!(rt.memory(0).allocated, 0);
}

#[test]
fn first_fault_wins_and_is_cleared() {
    let rt = runtime(1, 1);
    let keys = [BufferKey::new(0, 0), BufferKey::new(0, 1)];
    rt.register(keys.iter().map(|&k| (k, 0, 4))).unwrap();

    rt.submit(Task::new("first", 0, || Err(KernelFault::new("one"))).write(keys[0]))
        .unwrap();
    rt.wait_for_all().unwrap_err();
    assert!(!rt.is_poisoned());

    rt.submit(Task::new("second", 0, || Err(KernelFault::new("two"))).write(keys[1]))
        .unwrap();
    match rt.wait_for_all() {
        Err(RuntimeErr::KernelFault { task, fault }) => {
            assert_eq!(task, "second");
            assert_eq!(fault.message(), "two");
        }
        other => panic!("unexpected {other:?}"),
    }
    rt.wait_for_all().unwrap();
}
