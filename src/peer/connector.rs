//! Outbound dialer fan-out.
//!
//! One dial handshake per configured peer location. Successes and failures
//! both flow to a single callback; the network manager decides what a failure
//! means for the mesh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::net::Location;
use crate::pool::WorkerPool;
use crate::tempstore::TempStore;

use super::handshake::{DialOutcome, DialTask, HandshakeError};
use super::PeerSettings;

pub type ConnectionCallback = Arc<dyn Fn(Result<DialOutcome, HandshakeError>) + Send + Sync>;

pub struct Connector {
    inner: Arc<ConnectorInner>,
}

struct ConnectorInner {
    settings: PeerSettings,
    pool: WorkerPool,
    temp: TempStore,
    on_connection: ConnectionCallback,
    pending: Mutex<HashMap<Location, DialTask>>,
}

impl Connector {
    pub fn new(
        settings: PeerSettings,
        pool: WorkerPool,
        temp: TempStore,
        on_connection: ConnectionCallback,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                settings,
                pool,
                temp,
                on_connection,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Begins one dial handshake toward `target`. Dialing the same location
    /// twice is a configuration mistake and reported as an error.
    pub fn connect(&self, target: Location) {
        tracing::info!(peer = %target, "attempting to connect to peer");
        let mut pending = self.inner.pending.lock().expect("connector lock poisoned");
        if pending.contains_key(&target) {
            drop(pending);
            (self.inner.on_connection)(Err(HandshakeError::DuplicateTarget(target)));
            return;
        }

        let inner = Arc::clone(&self.inner);
        let finished_target = target.clone();
        let task = DialTask::spawn(
            self.inner.settings.clone(),
            target.clone(),
            self.inner.pool.clone(),
            self.inner.temp.clone(),
            move |result| {
                inner
                    .pending
                    .lock()
                    .expect("connector lock poisoned")
                    .remove(&finished_target);
                (inner.on_connection)(result);
            },
        );
        pending.insert(target, task);
    }

    /// Cancels every dial still in flight. Their callbacks fire with errors.
    pub fn stop(&self) {
        let pending: Vec<DialTask> = {
            let mut map = self.inner.pending.lock().expect("connector lock poisoned");
            map.drain().map(|(_, task)| task).collect()
        };
        for task in &pending {
            task.cancel();
        }
    }
}
