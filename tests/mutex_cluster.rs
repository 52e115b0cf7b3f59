//! End-to-end mutual-exclusion scenarios over real localhost TCP meshes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use filemesh::mutex::MutexError;

#[test]
fn uncontested_acquire_advances_both_clocks() {
    let nodes = common::start_cluster(2);

    let (tx, rx) = crossbeam::channel::bounded(1);
    nodes[0]
        .engine
        .run_with_mutual_exclusion("f", move |section| {
            section.release();
            let _ = tx.send(());
        })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(10))
        .expect("lock never granted");

    // Request{0} out, peer replies at 1, reply moves us to 2.
    assert_eq!(nodes[0].engine.timestamp(), 2);
    assert_eq!(nodes[1].engine.timestamp(), 1);

    common::stop_cluster(nodes);
}

#[test]
fn cached_permission_reenters_without_another_round_trip() {
    let nodes = common::start_cluster(2);

    for _ in 0..2 {
        let (tx, rx) = crossbeam::channel::bounded(1);
        nodes[0]
            .engine
            .run_with_mutual_exclusion("f", move |section| {
                section.release();
                let _ = tx.send(());
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(10))
            .expect("lock never granted");
    }

    // The second acquire rode the cached permission: no new messages, so
    // neither clock moved past the first exchange.
    assert_eq!(nodes[0].engine.timestamp(), 2);
    thread::sleep(Duration::from_millis(200));
    assert_eq!(nodes[1].engine.timestamp(), 1);

    common::stop_cluster(nodes);
}

#[test]
fn contending_nodes_never_overlap_in_the_critical_section() {
    let nodes = common::start_cluster(3);
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let entries = Arc::new(AtomicUsize::new(0));

    const ROUNDS: usize = 4;
    let mut workers = Vec::new();
    for node in &nodes {
        let engine = Arc::clone(&node.engine);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        let entries = Arc::clone(&entries);
        workers.push(thread::spawn(move || {
            for _ in 0..ROUNDS {
                let (tx, rx) = crossbeam::channel::bounded(1);
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                let entries = Arc::clone(&entries);
                engine
                    .run_with_mutual_exclusion("shared.txt", move |section| {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        entries.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(10));
                        active.fetch_sub(1, Ordering::SeqCst);
                        section.release();
                        let _ = tx.send(());
                    })
                    .unwrap();
                rx.recv_timeout(Duration::from_secs(30))
                    .expect("a contender starved");
            }
        }));
    }
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    assert_eq!(entries.load(Ordering::SeqCst), 3 * ROUNDS);
    assert_eq!(
        peak.load(Ordering::SeqCst),
        1,
        "two nodes were inside the critical section at once"
    );

    common::stop_cluster(nodes);
}

#[test]
fn distinct_files_lock_independently() {
    let nodes = common::start_cluster(2);

    // Node 1 takes "a" and sits on it until told to let go.
    let (entered_tx, entered_rx) = crossbeam::channel::bounded(1);
    let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(1);
    let (done_a_tx, done_a_rx) = crossbeam::channel::bounded(1);
    nodes[0]
        .engine
        .run_with_mutual_exclusion("a", move |section| {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            section.release();
            let _ = done_a_tx.send(());
        })
        .unwrap();
    entered_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("first lock never granted");

    // Node 2 can still take "b" while "a" is held elsewhere.
    let (done_b_tx, done_b_rx) = crossbeam::channel::bounded(1);
    nodes[1]
        .engine
        .run_with_mutual_exclusion("b", move |section| {
            section.release();
            let _ = done_b_tx.send(());
        })
        .unwrap();
    done_b_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("independent file was blocked by an unrelated lock");

    release_tx.send(()).unwrap();
    done_a_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("first lock never released");

    common::stop_cluster(nodes);
}

#[test]
fn second_request_while_one_is_outstanding_is_rejected() {
    let nodes = common::start_cluster(2);

    let (entered_tx, entered_rx) = crossbeam::channel::bounded(1);
    let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(1);
    let (done_tx, done_rx) = crossbeam::channel::bounded(1);
    nodes[0]
        .engine
        .run_with_mutual_exclusion("f", move |section| {
            let _ = entered_tx.send(());
            let _ = release_rx.recv();
            section.release();
            let _ = done_tx.send(());
        })
        .unwrap();
    entered_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("lock never granted");

    let second = nodes[0]
        .engine
        .run_with_mutual_exclusion("g", |_section| {});
    assert!(matches!(second, Err(MutexError::AlreadyInProgress)));

    release_tx.send(()).unwrap();
    done_rx
        .recv_timeout(Duration::from_secs(10))
        .expect("lock never released");

    // The failed call left the engine usable.
    let (tx, rx) = crossbeam::channel::bounded(1);
    nodes[0]
        .engine
        .run_with_mutual_exclusion("g", move |section| {
            section.release();
            let _ = tx.send(());
        })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(10))
        .expect("engine wedged after AlreadyInProgress");

    common::stop_cluster(nodes);
}

#[test]
fn single_node_cluster_grants_immediately() {
    let nodes = common::start_cluster(1);
    let (tx, rx) = crossbeam::channel::bounded(1);
    nodes[0]
        .engine
        .run_with_mutual_exclusion("solo", move |section| {
            section.release();
            let _ = tx.send(());
        })
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5))
        .expect("no peers, yet the lock was withheld");
    common::stop_cluster(nodes);
}
