//! Concurrent callers against one store

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mne_memory::{Clock, ConsolidationEngine, Config, Content, EdgeKind, Error, NodeId, NodeStore};

/// Clock that, once armed, parks the next caller until released
struct GateClock {
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl GateClock {
    fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            entered: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl Clock for GateClock {
    fn now(&self) -> DateTime<Utc> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        Utc::now()
    }
}

fn populated(n: usize) -> (NodeStore, Vec<NodeId>) {
    let store = NodeStore::new(Config::default().dimensions(2).eviction_threshold(0.3)).unwrap();
    let ids = (0..n)
        .map(|i| {
            let angle = i as f32 * 0.3;
            store
                .create(Content::text(format!("n{}", i)), vec![angle.cos(), angle.sin()], vec![])
                .unwrap()
        })
        .collect();
    (store, ids)
}

#[test]
fn concurrent_touches_are_not_lost() {
    common::init_tracing();
    let (store, ids) = populated(1);
    let id = ids[0];
    let threads = 8;
    let per_thread = 50;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..per_thread {
                    store.touch(id).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let node = store.get(id).unwrap();
    assert_eq!(node.access_count, (threads * per_thread) as u64);
    assert_eq!(node.strength, 1.0);
}

#[test]
fn only_one_sweep_runs_at_a_time() {
    let (store, _) = populated(200);
    let engine = Arc::new(ConsolidationEngine::new(store));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                (0..20)
                    .map(|_| match engine.sweep(Duration::from_secs(1)) {
                        Ok(_) => Ok(()),
                        Err(Error::SweepInProgress) => Err(()),
                        Err(e) => panic!("unexpected sweep error: {}", e),
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let outcomes: Vec<Result<(), ()>> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    assert!(outcomes.iter().any(|o| o.is_ok()));
}

#[test]
fn sweep_is_rejected_while_another_is_mid_run() {
    let clock = Arc::new(GateClock::new());
    let store = NodeStore::with_clock(Config::default().dimensions(2), clock.clone()).unwrap();
    store.create(Content::text("n"), vec![1.0, 0.0], vec![]).unwrap();
    let engine = Arc::new(ConsolidationEngine::new(store));

    // the first sweep parks inside its decay phase
    clock.armed.store(true, Ordering::SeqCst);
    let first = {
        let engine = engine.clone();
        thread::spawn(move || engine.sweep(Duration::from_secs(60)))
    };
    clock.entered.wait();

    let (tx, rx) = mpsc::channel();
    let second = {
        let engine = engine.clone();
        thread::spawn(move || {
            let _ = tx.send(matches!(engine.sweep(Duration::from_secs(60)), Err(Error::SweepInProgress)));
        })
    };
    let rejected = rx.recv_timeout(Duration::from_secs(5));

    clock.release.wait();
    first.join().unwrap().unwrap();
    second.join().unwrap();
    assert_eq!(rejected, Ok(true));

    // once the first sweep is done the next one runs
    engine.sweep(Duration::from_secs(60)).unwrap();
}

#[test]
fn mixed_workload_preserves_graph_invariants() {
    common::init_tracing();
    let (store, ids) = populated(40);
    let engine = Arc::new(ConsolidationEngine::new(store.clone()));
    let ids = Arc::new(ids);

    let linker = {
        let store = store.clone();
        let ids = ids.clone();
        thread::spawn(move || {
            for i in 0..ids.len() {
                let a = ids[i];
                let b = ids[(i * 7 + 3) % ids.len()];
                match store.graph().link(a, b, EdgeKind::CoOccurrence, 0.3) {
                    Ok(_) | Err(Error::NotFound(_)) | Err(Error::Validation(_)) => {}
                    Err(e) => panic!("unexpected link error: {}", e),
                }
            }
        })
    };

    let weakener = {
        let store = store.clone();
        let ids = ids.clone();
        thread::spawn(move || {
            for id in ids.iter().step_by(2) {
                match store.update_strength(*id, -0.4) {
                    Ok(_) | Err(Error::NotFound(_)) => {}
                    Err(e) => panic!("unexpected strength error: {}", e),
                }
            }
        })
    };

    let sweeper = {
        let engine = engine.clone();
        thread::spawn(move || {
            for _ in 0..10 {
                match engine.sweep(Duration::from_secs(10)) {
                    Ok(_) | Err(Error::SweepInProgress) => {}
                    Err(e) => panic!("unexpected sweep error: {}", e),
                }
            }
        })
    };

    linker.join().unwrap();
    weakener.join().unwrap();
    sweeper.join().unwrap();

    engine.sweep(Duration::ZERO).unwrap();
    store.check_consistency().unwrap();
    for node in store.list_active().unwrap() {
        assert!(node.strength >= 0.3);
    }
}
