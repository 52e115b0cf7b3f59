//! Per-peer link used by the mutual-exclusion engine.
//!
//! Each link drives a perpetual read loop on the peer's inbound socket and
//! serialises outbound messages on the peer's outbound socket. The next read
//! is scheduled only after the current message has been fully handled, so
//! messages from one peer are processed strictly in arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::peer::PeerLink;
use crate::pool::WorkerPool;
use crate::proto::{
    Message, MessageReader, MessageWriter, NodeId, ServiceError, CLIENT_TRANSFER_CHUNK,
};
use crate::tempstore::TempStore;

/// Handles one inbound message (or the read error that ended the loop).
pub type MessageHandler = Arc<dyn Fn(NodeId, Result<Message, ServiceError>) + Send + Sync>;

/// Handles a failed outbound write.
pub type SendErrorHandler = Arc<dyn Fn(NodeId, ServiceError) + Send + Sync>;

#[derive(Clone)]
pub struct MutexLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    peer: PeerLink,
    reader: MessageReader,
    writer: MessageWriter,
    running: AtomicBool,
    outbound: Mutex<Outbound>,
    handlers: Mutex<Option<Handlers>>,
}

#[derive(Default)]
struct Outbound {
    queue: VecDeque<Message>,
    in_flight: bool,
}

#[derive(Clone)]
struct Handlers {
    on_message: MessageHandler,
    on_send_error: SendErrorHandler,
}

impl MutexLink {
    pub fn new(peer: PeerLink, pool: WorkerPool, temp: TempStore) -> Self {
        let reader = MessageReader::new(Arc::clone(&peer.incoming), pool.clone(), temp);
        let writer = MessageWriter::new(Arc::clone(&peer.outgoing), pool, CLIENT_TRANSFER_CHUNK);
        Self {
            inner: Arc::new(LinkInner {
                peer,
                reader,
                writer,
                running: AtomicBool::new(false),
                outbound: Mutex::new(Outbound::default()),
                handlers: Mutex::new(None),
            }),
        }
    }

    pub fn peer_id(&self) -> NodeId {
        self.inner.peer.id
    }

    /// Begins the receive loop. Each message is delivered to `on_message`
    /// before the next read is scheduled; a read error stops the loop after
    /// being delivered.
    pub fn start(&self, on_message: MessageHandler, on_send_error: SendErrorHandler) {
        *self.inner.handlers.lock().expect("link lock poisoned") = Some(Handlers {
            on_message,
            on_send_error,
        });
        self.inner.running.store(true, Ordering::SeqCst);
        schedule_next_read(Arc::clone(&self.inner));
    }

    /// Queues a message for the peer. Writes are serialised: at most one is
    /// in flight, the rest wait their turn in order.
    pub fn send(&self, msg: Message) {
        let dispatch_now = {
            let mut outbound = self.inner.outbound.lock().expect("link lock poisoned");
            if outbound.in_flight {
                outbound.queue.push_back(msg);
                None
            } else {
                outbound.in_flight = true;
                Some(msg)
            }
        };
        if let Some(msg) = dispatch_now {
            dispatch(Arc::clone(&self.inner), msg);
        }
    }

    /// Stops the receive loop. The manager owns the sockets; closing them is
    /// its call, which is also what collapses an in-flight read.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

fn handlers(inner: &LinkInner) -> Option<Handlers> {
    inner.handlers.lock().expect("link lock poisoned").clone()
}

fn schedule_next_read(inner: Arc<LinkInner>) {
    if !inner.running.load(Ordering::SeqCst) {
        return;
    }
    let reader = inner.reader.clone();
    reader.read_message(move |result| {
        let Some(handlers) = handlers(&inner) else {
            return;
        };
        let peer = inner.peer.id;
        match result {
            Ok(msg) => {
                (handlers.on_message)(peer, Ok(msg));
                schedule_next_read(inner);
            }
            Err(err) => {
                inner.running.store(false, Ordering::SeqCst);
                (handlers.on_message)(peer, Err(err));
            }
        }
    });
}

fn dispatch(inner: Arc<LinkInner>, msg: Message) {
    let writer = inner.writer.clone();
    writer.write_message(msg, move |result| {
        if let Err(err) = result {
            {
                let mut outbound = inner.outbound.lock().expect("link lock poisoned");
                outbound.in_flight = false;
                outbound.queue.clear();
            }
            if let Some(handlers) = handlers(&inner) {
                (handlers.on_send_error)(inner.peer.id, err);
            }
            return;
        }
        let next = {
            let mut outbound = inner.outbound.lock().expect("link lock poisoned");
            match outbound.queue.pop_front() {
                Some(next) => Some(next),
                None => {
                    outbound.in_flight = false;
                    None
                }
            }
        };
        if let Some(next) = next {
            dispatch(inner, next);
        }
    });
}
