//! Authentication handshake for new peer links.
//!
//! Two mirrored state machines. The dialer connects, introduces itself with
//! `EstablishConnection{id, password}`, expects the acceptor's own
//! `EstablishConnection{id}` back, and confirms with `Ok`. The acceptor runs
//! the complement. Either side failing a step is fatal for the link; closing
//! the underlying socket cancels whichever state is in flight.

use std::sync::Arc;

use thiserror::Error;

use crate::machine::{Machine, Resume, State, StateRef, Step};
use crate::net::{Dialer, Location, Socket, TransportError};
use crate::pool::WorkerPool;
use crate::proto::{
    EstablishConnection, ErrorText, Message, MessageReader, MessageWriter, NodeId, Opcode,
    ProtoError, ServiceError, CLIENT_TRANSFER_CHUNK,
};
use crate::tempstore::TempStore;

use super::PeerSettings;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("peer presented the wrong password")]
    WrongPassword,
    #[error("no password configured for the peer handshake")]
    MissingPassword,
    #[error("expected {expected:?} during handshake, got {got:?}")]
    UnexpectedOpcode { expected: Opcode, got: Opcode },
    #[error("peer reported an error during handshake: {0}")]
    PeerError(String),
    #[error("already dialing {0}")]
    DuplicateTarget(Location),
    #[error("handshake did not produce a connected socket")]
    NotConnected,
}

impl From<ProtoError> for HandshakeError {
    fn from(err: ProtoError) -> Self {
        HandshakeError::Service(ServiceError::Proto(err))
    }
}

/// Timing-independent comparison of the shared secret.
fn password_matches(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Dialer side
// ---------------------------------------------------------------------------

pub struct DialHandshake {
    settings: PeerSettings,
    target: Location,
    dialer: Arc<Dialer>,
    pool: WorkerPool,
    temp: TempStore,
    socket: Option<Arc<Socket>>,
    reader: Option<MessageReader>,
    writer: Option<MessageWriter>,
    peer_id: Option<NodeId>,
}

/// What a successful dial exports to the network manager.
#[derive(Clone)]
pub struct DialOutcome {
    pub target: Location,
    pub peer_id: NodeId,
    pub socket: Arc<Socket>,
}

impl DialHandshake {
    fn export(&self) -> Result<DialOutcome, HandshakeError> {
        let socket = self.socket.clone().ok_or(HandshakeError::NotConnected)?;
        if socket.is_closed() {
            return Err(HandshakeError::NotConnected);
        }
        let peer_id = self.peer_id.ok_or(HandshakeError::NotConnected)?;
        Ok(DialOutcome {
            target: self.target.clone(),
            peer_id,
            socket,
        })
    }

    fn writer(&self) -> MessageWriter {
        self.writer.clone().expect("writer exists after Connect")
    }

    fn reader(&self) -> MessageReader {
        self.reader.clone().expect("reader exists after Connect")
    }
}

struct Connect;
struct SendEstablish;
struct RecvEstablish;
struct SendOk;
struct DialDone;

static CONNECT: Connect = Connect;
static SEND_ESTABLISH: SendEstablish = SendEstablish;
static RECV_ESTABLISH: RecvEstablish = RecvEstablish;
static SEND_OK: SendOk = SendOk;
static DIAL_DONE: DialDone = DialDone;

impl State<DialHandshake, HandshakeError> for Connect {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn handle(
        &self,
        m: &mut DialHandshake,
        _resume: Resume<DialHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        tracing::debug!(peer = %m.target, "dialing peer");
        let socket = Arc::new(m.dialer.dial(&m.target)?);
        m.reader = Some(MessageReader::new(
            Arc::clone(&socket),
            m.pool.clone(),
            m.temp.clone(),
        ));
        m.writer = Some(MessageWriter::new(
            Arc::clone(&socket),
            m.pool.clone(),
            CLIENT_TRANSFER_CHUNK,
        ));
        m.socket = Some(socket);
        Ok(Step::Continue)
    }

    fn next(&self, _m: &DialHandshake) -> StateRef<DialHandshake, HandshakeError> {
        &SEND_ESTABLISH
    }
}

impl State<DialHandshake, HandshakeError> for SendEstablish {
    fn name(&self) -> &'static str {
        "send-establish"
    }

    fn handle(
        &self,
        m: &mut DialHandshake,
        resume: Resume<DialHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        if m.settings.password.is_empty() {
            return Err(HandshakeError::MissingPassword);
        }
        tracing::debug!(peer = %m.target, "sending handshake");
        let hello = EstablishConnection::new(m.settings.node_id, m.settings.password.clone());
        m.writer().write_message(hello.into_message(), move |result| {
            resume.resume(result.map_err(HandshakeError::from));
        });
        Ok(Step::Pending)
    }

    fn next(&self, _m: &DialHandshake) -> StateRef<DialHandshake, HandshakeError> {
        &RECV_ESTABLISH
    }
}

impl State<DialHandshake, HandshakeError> for RecvEstablish {
    fn name(&self) -> &'static str {
        "recv-establish"
    }

    fn handle(
        &self,
        m: &mut DialHandshake,
        resume: Resume<DialHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        m.reader().read_message(move |result| {
            let outcome = result
                .map_err(HandshakeError::from)
                .and_then(|msg| match msg.opcode {
                    Opcode::EstablishConnection => {
                        let establish = EstablishConnection::from_message(msg)?;
                        resume.with(|m| m.peer_id = Some(establish.id));
                        Ok(())
                    }
                    got => Err(HandshakeError::UnexpectedOpcode {
                        expected: Opcode::EstablishConnection,
                        got,
                    }),
                });
            resume.resume(outcome);
        });
        Ok(Step::Pending)
    }

    fn next(&self, _m: &DialHandshake) -> StateRef<DialHandshake, HandshakeError> {
        &SEND_OK
    }
}

impl State<DialHandshake, HandshakeError> for SendOk {
    fn name(&self) -> &'static str {
        "send-ok"
    }

    fn handle(
        &self,
        m: &mut DialHandshake,
        resume: Resume<DialHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        m.writer().write_message(Message::ok(), move |result| {
            resume.resume(result.map_err(HandshakeError::from));
        });
        Ok(Step::Pending)
    }

    fn next(&self, _m: &DialHandshake) -> StateRef<DialHandshake, HandshakeError> {
        &DIAL_DONE
    }
}

impl State<DialHandshake, HandshakeError> for DialDone {
    fn name(&self) -> &'static str {
        "done"
    }

    fn handle(
        &self,
        m: &mut DialHandshake,
        _resume: Resume<DialHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        tracing::debug!(addr = %m.target, peer = ?m.peer_id, "peer link verified");
        Ok(Step::Continue)
    }

    fn next(&self, _m: &DialHandshake) -> StateRef<DialHandshake, HandshakeError> {
        &DIAL_DONE
    }

    fn is_terminal(&self) -> bool {
        true
    }
}

/// A running dial handshake. Dropping the task does not cancel it; call
/// `cancel` to tear down mid-flight.
pub struct DialTask {
    machine: Machine<DialHandshake, HandshakeError>,
    dialer: Arc<Dialer>,
}

impl DialTask {
    pub fn spawn(
        settings: PeerSettings,
        target: Location,
        pool: WorkerPool,
        temp: TempStore,
        on_done: impl FnOnce(Result<DialOutcome, HandshakeError>) + Send + 'static,
    ) -> Self {
        let dialer = Arc::new(Dialer::new(
            settings.poll_timeout,
            settings.retry_timeout,
            Some(settings.poll_timeout),
        ));
        let instance = DialHandshake {
            settings,
            target,
            dialer: Arc::clone(&dialer),
            pool: pool.clone(),
            temp,
            socket: None,
            reader: None,
            writer: None,
            peer_id: None,
        };
        let machine = Machine::new(instance, &CONNECT);
        let runner = machine.clone();
        let exporter = machine.clone();
        pool.schedule(move || {
            runner.start(move |result| {
                let outcome = result.and_then(|()| exporter.lock_instance().export());
                on_done(outcome);
            });
        });
        Self { machine, dialer }
    }

    /// Closes the socket (cancelling any in-flight state) and stops the
    /// machine. The completion callback still fires exactly once.
    pub fn cancel(&self) {
        self.dialer.cancel();
        if let Some(socket) = self.machine.lock_instance().socket.clone() {
            socket.close();
        }
        self.machine.stop();
    }
}

// ---------------------------------------------------------------------------
// Acceptor side
// ---------------------------------------------------------------------------

pub struct AcceptHandshake {
    settings: PeerSettings,
    origin: Location,
    socket: Arc<Socket>,
    reader: MessageReader,
    writer: MessageWriter,
    client_id: Option<NodeId>,
}

impl AcceptHandshake {
    fn export(&self) -> Result<DialOutcome, HandshakeError> {
        if self.socket.is_closed() {
            return Err(HandshakeError::NotConnected);
        }
        let peer_id = self.client_id.ok_or(HandshakeError::NotConnected)?;
        Ok(DialOutcome {
            target: self.origin.clone(),
            peer_id,
            socket: Arc::clone(&self.socket),
        })
    }
}

struct Init;
struct AwaitEstablish;
struct AnswerEstablish;
struct RecvOk;
struct AcceptDone;

static INIT: Init = Init;
static AWAIT_ESTABLISH: AwaitEstablish = AwaitEstablish;
static ANSWER_ESTABLISH: AnswerEstablish = AnswerEstablish;
static RECV_OK: RecvOk = RecvOk;
static ACCEPT_DONE: AcceptDone = AcceptDone;

impl State<AcceptHandshake, HandshakeError> for Init {
    fn name(&self) -> &'static str {
        "init"
    }

    fn handle(
        &self,
        m: &mut AcceptHandshake,
        _resume: Resume<AcceptHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        if m.settings.password.is_empty() {
            return Err(HandshakeError::MissingPassword);
        }
        Ok(Step::Continue)
    }

    fn next(&self, _m: &AcceptHandshake) -> StateRef<AcceptHandshake, HandshakeError> {
        &AWAIT_ESTABLISH
    }
}

impl State<AcceptHandshake, HandshakeError> for AwaitEstablish {
    fn name(&self) -> &'static str {
        "await-establish"
    }

    fn handle(
        &self,
        m: &mut AcceptHandshake,
        resume: Resume<AcceptHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        tracing::debug!(origin = %m.origin, "waiting for handshake");
        let expected = m.settings.password.clone();
        m.reader.read_message(move |result| {
            let outcome = result
                .map_err(HandshakeError::from)
                .and_then(|msg| match msg.opcode {
                    Opcode::EstablishConnection => {
                        let establish = EstablishConnection::from_message(msg)?;
                        if !password_matches(&establish.password, &expected) {
                            return Err(HandshakeError::WrongPassword);
                        }
                        resume.with(|m| m.client_id = Some(establish.id));
                        Ok(())
                    }
                    Opcode::Error => {
                        let text = ErrorText::from_message(msg)
                            .map(|e| e.message)
                            .unwrap_or_else(|_| "unreadable error body".to_string());
                        Err(HandshakeError::PeerError(text))
                    }
                    got => Err(HandshakeError::UnexpectedOpcode {
                        expected: Opcode::EstablishConnection,
                        got,
                    }),
                });
            resume.resume(outcome);
        });
        Ok(Step::Pending)
    }

    fn next(&self, _m: &AcceptHandshake) -> StateRef<AcceptHandshake, HandshakeError> {
        &ANSWER_ESTABLISH
    }
}

impl State<AcceptHandshake, HandshakeError> for AnswerEstablish {
    fn name(&self) -> &'static str {
        "answer-establish"
    }

    fn handle(
        &self,
        m: &mut AcceptHandshake,
        resume: Resume<AcceptHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        // The password field stays empty in the reply; the dialer initiated
        // and has already proven itself.
        let reply = EstablishConnection::new(m.settings.node_id, "");
        m.writer.write_message(reply.into_message(), move |result| {
            resume.resume(result.map_err(HandshakeError::from));
        });
        Ok(Step::Pending)
    }

    fn next(&self, _m: &AcceptHandshake) -> StateRef<AcceptHandshake, HandshakeError> {
        &RECV_OK
    }
}

impl State<AcceptHandshake, HandshakeError> for RecvOk {
    fn name(&self) -> &'static str {
        "recv-ok"
    }

    fn handle(
        &self,
        m: &mut AcceptHandshake,
        resume: Resume<AcceptHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        m.reader.read_message(move |result| {
            let outcome = result
                .map_err(HandshakeError::from)
                .and_then(|msg| match msg.opcode {
                    Opcode::Ok => Ok(()),
                    got => Err(HandshakeError::UnexpectedOpcode {
                        expected: Opcode::Ok,
                        got,
                    }),
                });
            resume.resume(outcome);
        });
        Ok(Step::Pending)
    }

    fn next(&self, _m: &AcceptHandshake) -> StateRef<AcceptHandshake, HandshakeError> {
        &ACCEPT_DONE
    }
}

impl State<AcceptHandshake, HandshakeError> for AcceptDone {
    fn name(&self) -> &'static str {
        "done"
    }

    fn handle(
        &self,
        m: &mut AcceptHandshake,
        _resume: Resume<AcceptHandshake, HandshakeError>,
    ) -> Result<Step, HandshakeError> {
        tracing::debug!(origin = %m.origin, peer = ?m.client_id, "inbound peer link verified");
        Ok(Step::Continue)
    }

    fn next(&self, _m: &AcceptHandshake) -> StateRef<AcceptHandshake, HandshakeError> {
        &ACCEPT_DONE
    }

    fn is_terminal(&self) -> bool {
        true
    }
}

/// A running accept-side handshake.
pub struct AcceptTask {
    machine: Machine<AcceptHandshake, HandshakeError>,
}

impl AcceptTask {
    pub fn spawn(
        settings: PeerSettings,
        origin: Location,
        socket: Arc<Socket>,
        pool: WorkerPool,
        temp: TempStore,
        on_done: impl FnOnce(Result<DialOutcome, HandshakeError>) + Send + 'static,
    ) -> Self {
        let reader = MessageReader::new(Arc::clone(&socket), pool.clone(), temp);
        let writer = MessageWriter::new(Arc::clone(&socket), pool.clone(), CLIENT_TRANSFER_CHUNK);
        let instance = AcceptHandshake {
            settings,
            origin,
            socket,
            reader,
            writer,
            client_id: None,
        };
        let machine = Machine::new(instance, &INIT);
        let runner = machine.clone();
        let exporter = machine.clone();
        pool.schedule(move || {
            runner.start(move |result| {
                let outcome = result.and_then(|()| exporter.lock_instance().export());
                on_done(outcome);
            });
        });
        Self { machine }
    }

    pub fn cancel(&self) {
        self.machine.lock_instance().socket.close();
        self.machine.stop();
    }
}
