//! Shared harness: spins up a real cluster of mutex nodes over localhost TCP.
#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use filemesh::config::PeerEntry;
use filemesh::mutex::{DistributedMutex, MutexError};
use filemesh::peer::{NetworkManager, PeerSettings};
use filemesh::pool::WorkerPool;
use filemesh::proto::NodeId;
use filemesh::tempstore::TempStore;

pub const CLUSTER_PASSWORD: &str = "sesame";

/// Distinct free localhost ports. All listeners are held at once so no port
/// repeats, then released for the cluster to rebind.
pub fn free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind probe listener"))
        .collect();
    listeners
        .iter()
        .map(|listener| listener.local_addr().expect("probe addr").port())
        .collect()
}

pub fn settings(id: u8, port: u16, password: &str) -> PeerSettings {
    PeerSettings {
        node_id: NodeId::new(id),
        port,
        password: password.to_string(),
        poll_timeout: Duration::from_secs(5),
        retry_timeout: Duration::from_millis(200),
    }
}

pub fn peer_entries(ports: &[u16]) -> Vec<PeerEntry> {
    ports
        .iter()
        .map(|port| PeerEntry {
            host: "127.0.0.1".to_string(),
            port: *port,
        })
        .collect()
}

pub struct TestNode {
    pub id: NodeId,
    pub engine: Arc<DistributedMutex>,
    pub pool: WorkerPool,
    pub faults: Arc<Mutex<Vec<MutexError>>>,
    _temp_dir: tempfile::TempDir,
}

/// Starts `count` fully meshed nodes and waits for every engine to report
/// ready. Panics if the mesh does not form.
pub fn start_cluster(count: usize) -> Vec<TestNode> {
    let ports = free_ports(count);
    let peers = peer_entries(&ports);

    let mut nodes = Vec::with_capacity(count);
    let mut ready = Vec::with_capacity(count);
    for (index, port) in ports.iter().enumerate() {
        let id = NodeId::new((index + 1) as u8);
        let pool = WorkerPool::start(8);
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let temp = TempStore::new(temp_dir.path().join("scratch"));

        let manager = NetworkManager::new(
            settings(id.get(), *port, CLUSTER_PASSWORD),
            &peers,
            pool.clone(),
            temp.clone(),
        );

        let faults: Arc<Mutex<Vec<MutexError>>> = Arc::new(Mutex::new(Vec::new()));
        let fault_sink = Arc::clone(&faults);
        let engine = Arc::new(DistributedMutex::new(
            id,
            manager,
            pool.clone(),
            temp,
            Arc::new(move |err| fault_sink.lock().unwrap().push(err)),
        ));

        let (tx, rx) = crossbeam::channel::bounded(1);
        engine
            .start(move |result| {
                let _ = tx.send(result);
            })
            .expect("engine start");
        ready.push(rx);

        nodes.push(TestNode {
            id,
            engine,
            pool,
            faults,
            _temp_dir: temp_dir,
        });
    }

    for rx in ready {
        rx.recv_timeout(Duration::from_secs(20))
            .expect("mesh formation timed out")
            .expect("mesh formation failed");
    }
    nodes
}

/// Clean shutdown; asserts no engine faulted during the test body.
pub fn stop_cluster(nodes: Vec<TestNode>) {
    for node in &nodes {
        assert!(
            node.faults.lock().unwrap().is_empty(),
            "node {} faulted: {:?}",
            node.id,
            node.faults.lock().unwrap()
        );
    }
    for node in &nodes {
        node.engine.stop();
    }
    for node in nodes {
        node.pool.shutdown();
    }
}
