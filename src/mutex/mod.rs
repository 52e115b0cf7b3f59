//! Distributed mutual exclusion over the peer mesh.
//!
//! Ricart–Agrawala with the Roucairol–Carvalho optimisation. One Lamport
//! clock, one outstanding request at a time, a FIFO queue of deferred peer
//! requests, and a per-peer cache of standing permissions. Permission for a
//! file, once granted by a peer's `Reply`, holds until that peer next sends a
//! `Request` for the same file, which is what lets an uncontested node
//! re-enter its critical section without another round trip.
//!
//! Every clock update and state transition happens under one engine mutex;
//! outbound replies are computed under the mutex and sent after it is
//! released.

mod link;

pub use link::MutexLink;

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::peer::{NetworkError, NetworkManager};
use crate::pool::WorkerPool;
use crate::proto::{
    ErrorText, LockReply, LockRequest, Message, NodeId, Opcode, ServiceError,
};
use crate::tempstore::TempStore;

#[derive(Debug, Error)]
pub enum MutexError {
    #[error("operation already in progress")]
    AlreadyInProgress,
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("peer {peer} reported an error: {message}")]
    PeerFault { peer: NodeId, message: String },
}

/// Invoked when the whole engine fails; there is no recovery path.
pub type ErrorCallback = Arc<dyn Fn(MutexError) + Send + Sync>;

/// The caller's work, run once the lock is held. Call
/// [`CriticalSection::release`] when done.
pub type Operation = Box<dyn FnOnce(CriticalSection) + Send>;

/// Handle held while inside the critical section. Releasing it hands out the
/// deferred replies and lets the next contender in.
pub struct CriticalSection {
    inner: Arc<EngineInner>,
}

impl CriticalSection {
    pub fn release(self) {
        release(&self.inner);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Requesting,
    InCriticalSection,
}

struct OwnRequest {
    file_name: String,
    timestamp: u64,
    operation: Option<Operation>,
}

struct DeferredRequest {
    peer: NodeId,
    request: LockRequest,
}

struct EngineState {
    clock: u64,
    phase: Phase,
    my_request: Option<OwnRequest>,
    deferred: VecDeque<DeferredRequest>,
    /// `permissions[p]` holds every file for which peer `p`'s last word was a
    /// `Reply` we have not since invalidated.
    permissions: BTreeMap<NodeId, HashSet<String>>,
}

/// A reply decided under the engine mutex, sent after it is released.
struct ReplyAction {
    peer: NodeId,
    timestamp: u64,
    file_name: String,
}

pub struct DistributedMutex {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    node_id: NodeId,
    pool: WorkerPool,
    temp: TempStore,
    manager: NetworkManager,
    links: Mutex<Vec<MutexLink>>,
    state: Mutex<EngineState>,
    on_error: ErrorCallback,
    started: AtomicBool,
}

impl DistributedMutex {
    pub fn new(
        node_id: NodeId,
        manager: NetworkManager,
        pool: WorkerPool,
        temp: TempStore,
        on_error: ErrorCallback,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                node_id,
                pool,
                temp,
                manager,
                links: Mutex::new(Vec::new()),
                state: Mutex::new(EngineState {
                    clock: 0,
                    phase: Phase::Waiting,
                    my_request: None,
                    deferred: VecDeque::new(),
                    permissions: BTreeMap::new(),
                }),
                on_error,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Current Lamport clock value.
    pub fn timestamp(&self) -> u64 {
        self.inner.state.lock().expect("engine lock poisoned").clock
    }

    /// Starts the peer network and, once the connected snapshot arrives,
    /// brings up one receive loop per peer. `on_ready` fires with the result
    /// of mesh formation.
    pub fn start(
        &self,
        on_ready: impl FnOnce(Result<(), MutexError>) + Send + 'static,
    ) -> Result<(), MutexError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(MutexError::AlreadyInProgress);
        }
        let inner = Arc::clone(&self.inner);
        self.inner.manager.await_connected(move |result| {
            match result {
                Ok(snapshot) => {
                    attach_links(&inner, snapshot);
                    on_ready(Ok(()));
                }
                Err(err) => on_ready(Err(err.into())),
            }
        });
        self.inner.manager.start()?;
        Ok(())
    }

    /// Stops every receive loop and the peer network underneath.
    pub fn stop(&self) {
        for link in self.links() {
            link.stop();
        }
        self.inner.manager.stop();
    }

    /// Acquires the distributed lock on `file_name` and runs `operation`
    /// inside the critical section. Non-blocking: the operation is invoked
    /// later, from a pool thread, once every needed permission is held.
    ///
    /// At most one request may be outstanding per node; a second call before
    /// the first releases fails with [`MutexError::AlreadyInProgress`].
    /// Callers must wait for `start`'s ready callback before requesting.
    pub fn run_with_mutual_exclusion(
        &self,
        file_name: &str,
        operation: impl FnOnce(CriticalSection) + Send + 'static,
    ) -> Result<(), MutexError> {
        tracing::debug!(file = file_name, "requesting mutual exclusion");
        let links = self.links();
        let (timestamp, missing) = {
            let mut state = self.inner.state.lock().expect("engine lock poisoned");
            if state.my_request.is_some() || state.phase != Phase::Waiting {
                return Err(MutexError::AlreadyInProgress);
            }
            let timestamp = state.clock;
            state.my_request = Some(OwnRequest {
                file_name: file_name.to_string(),
                timestamp,
                operation: Some(Box::new(operation)),
            });
            state.phase = Phase::Requesting;

            // Only peers whose permission we lack hear about this request;
            // everyone else already granted it and has not taken it back.
            let missing: Vec<MutexLink> = links
                .iter()
                .filter(|link| !has_permission(&state, link.peer_id(), file_name))
                .cloned()
                .collect();
            (timestamp, missing)
        };

        for link in &missing {
            tracing::debug!(peer = %link.peer_id(), "sending lock request");
            link.send(LockRequest::new(timestamp, file_name).into_message());
        }

        // Everything may already be cached, in which case entry is immediate.
        check_for_entry(&self.inner);
        Ok(())
    }

    fn links(&self) -> Vec<MutexLink> {
        self.inner.links.lock().expect("engine lock poisoned").clone()
    }
}

fn has_permission(state: &EngineState, peer: NodeId, file_name: &str) -> bool {
    state
        .permissions
        .get(&peer)
        .is_some_and(|files| files.contains(file_name))
}

fn attach_links(inner: &Arc<EngineInner>, snapshot: Vec<crate::peer::PeerLink>) {
    let links: Vec<MutexLink> = snapshot
        .into_iter()
        .map(|peer| MutexLink::new(peer, inner.pool.clone(), inner.temp.clone()))
        .collect();

    let on_message: link::MessageHandler = {
        let inner = Arc::clone(inner);
        Arc::new(move |peer, result| on_message(&inner, peer, result))
    };
    let on_send_error: link::SendErrorHandler = {
        let inner = Arc::clone(inner);
        Arc::new(move |peer, err| report_link_error(&inner, peer, err.to_string()))
    };

    // The link table must be in place before any receive loop can deliver a
    // message, or an early request would find nowhere to send its reply.
    *inner.links.lock().expect("engine lock poisoned") = links.clone();
    for link in &links {
        link.start(Arc::clone(&on_message), Arc::clone(&on_send_error));
    }
}

fn on_message(inner: &Arc<EngineInner>, peer: NodeId, result: Result<Message, ServiceError>) {
    let msg = match result {
        Ok(msg) => msg,
        Err(err) => {
            report_link_error(inner, peer, err.to_string());
            return;
        }
    };

    match msg.opcode {
        Opcode::Error => {
            // A peer announces a failed distributed operation; this mesh has
            // no way back from that.
            let text = ErrorText::from_message(msg)
                .map(|e| e.message)
                .unwrap_or_else(|_| "unreadable error body".to_string());
            tracing::warn!(%peer, "received error from peer: {text}");
            report_link_error(inner, peer, text);
        }
        Opcode::Reply => match LockReply::from_message(msg) {
            Ok(reply) => on_reply(inner, peer, reply),
            Err(err) => report_link_error(inner, peer, err.to_string()),
        },
        Opcode::Request => match LockRequest::from_message(msg) {
            Ok(request) => on_request(inner, peer, request),
            Err(err) => report_link_error(inner, peer, err.to_string()),
        },
        other => {
            tracing::debug!(%peer, ?other, "ignoring unexpected opcode on mutex link");
        }
    }
}

fn on_reply(inner: &Arc<EngineInner>, peer: NodeId, reply: LockReply) {
    tracing::debug!(%peer, file = %reply.file_name, "received reply");
    {
        let mut state = inner.state.lock().expect("engine lock poisoned");
        state.clock = state.clock.max(reply.timestamp).saturating_add(1);
        state
            .permissions
            .entry(peer)
            .or_default()
            .insert(reply.file_name);
    }
    check_for_entry(inner);
}

fn on_request(inner: &Arc<EngineInner>, peer: NodeId, request: LockRequest) {
    tracing::debug!(%peer, file = %request.file_name, "received request");
    let actions = {
        let mut state = inner.state.lock().expect("engine lock poisoned");
        let mut actions = Vec::new();
        handle_request_locked(inner.node_id, &mut state, peer, request, &mut actions);
        actions
    };
    send_replies(inner, actions);
}

/// The decision table. Runs under the engine mutex; replies come back as
/// actions so the sends happen outside it.
fn handle_request_locked(
    my_id: NodeId,
    state: &mut EngineState,
    peer: NodeId,
    request: LockRequest,
    actions: &mut Vec<ReplyAction>,
) {
    state.clock = state.clock.max(request.timestamp).saturating_add(1);

    match state.phase {
        Phase::Waiting => {
            // Not contending: grant immediately. Their request takes back any
            // standing permission they had given us for this file.
            if let Some(files) = state.permissions.get_mut(&peer) {
                files.remove(&request.file_name);
            }
            actions.push(ReplyAction {
                peer,
                timestamp: state.clock,
                file_name: request.file_name,
            });
        }
        Phase::InCriticalSection => {
            state.deferred.push_back(DeferredRequest { peer, request });
        }
        Phase::Requesting => {
            let mine = state
                .my_request
                .as_ref()
                .expect("requesting phase implies an outstanding request");
            if mine.file_name != request.file_name {
                // Different file: no conflict with our request.
                if let Some(files) = state.permissions.get_mut(&peer) {
                    files.remove(&request.file_name);
                }
                actions.push(ReplyAction {
                    peer,
                    timestamp: state.clock,
                    file_name: request.file_name,
                });
            } else if outranks(request.timestamp, peer, mine.timestamp, my_id) {
                // Same file, and they win the total order. Nothing to remove
                // from the cache: had we held their permission, they could
                // not have an older request in flight.
                actions.push(ReplyAction {
                    peer,
                    timestamp: state.clock,
                    file_name: request.file_name,
                });
            } else {
                // Same file, we win: they wait until we release.
                state.deferred.push_back(DeferredRequest { peer, request });
            }
        }
    }
}

/// Strict total order on (timestamp, node id): lower timestamp wins, lower id
/// breaks ties.
fn outranks(their_ts: u64, their_id: NodeId, my_ts: u64, my_id: NodeId) -> bool {
    their_ts < my_ts || (their_ts == my_ts && their_id < my_id)
}

fn check_for_entry(inner: &Arc<EngineInner>) {
    let links = inner.links.lock().expect("engine lock poisoned").clone();
    let operation = {
        let mut state = inner.state.lock().expect("engine lock poisoned");
        if state.phase != Phase::Requesting {
            return;
        }
        let file_name = match &state.my_request {
            Some(request) => request.file_name.clone(),
            None => return,
        };
        let granted = links
            .iter()
            .all(|link| has_permission(&state, link.peer_id(), &file_name));
        if !granted {
            return;
        }
        state.phase = Phase::InCriticalSection;
        state
            .my_request
            .as_mut()
            .and_then(|request| request.operation.take())
    };

    if let Some(operation) = operation {
        // The operation runs on its own pool task: it may block on server
        // round trips, and the link thread that delivered the final reply
        // must get back to reading.
        let section = CriticalSection {
            inner: Arc::clone(inner),
        };
        inner.pool.schedule(move || {
            tracing::debug!("entering the critical section");
            operation(section);
        });
    }
}

fn release(inner: &Arc<EngineInner>) {
    tracing::debug!("releasing mutual exclusion");
    let actions = {
        let mut state = inner.state.lock().expect("engine lock poisoned");
        state.my_request = None;
        state.phase = Phase::Waiting;

        // Replay every deferred request through the decision table, oldest
        // first. The phase is Waiting now, so each gets a reply stamped with
        // the clock as of its replay.
        let mut actions = Vec::new();
        while let Some(deferred) = state.deferred.pop_front() {
            handle_request_locked(
                inner.node_id,
                &mut state,
                deferred.peer,
                deferred.request,
                &mut actions,
            );
        }
        actions
    };
    send_replies(inner, actions);
}

fn send_replies(inner: &Arc<EngineInner>, actions: Vec<ReplyAction>) {
    if actions.is_empty() {
        return;
    }
    let links = inner.links.lock().expect("engine lock poisoned").clone();
    for action in actions {
        let Some(link) = links.iter().find(|link| link.peer_id() == action.peer) else {
            tracing::warn!(peer = %action.peer, "no link for reply");
            continue;
        };
        tracing::debug!(peer = %action.peer, file = %action.file_name, "sending reply");
        link.send(LockReply::new(action.timestamp, action.file_name).into_message());
    }
}

fn report_link_error(inner: &Arc<EngineInner>, peer: NodeId, reason: String) {
    tracing::warn!(%peer, "mutex link failed: {reason}");
    let weak = Arc::downgrade(inner);
    inner.manager.report_error(
        NetworkError::Link { peer, reason },
        move |result| {
            // Recovery is declared but unimplemented; this only ever fires
            // with an error.
            if let Err(err) = result {
                if let Some(inner) = weak.upgrade() {
                    (inner.on_error)(err.into());
                }
            }
        },
    );
}
