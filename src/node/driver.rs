//! Randomised read/write workload.
//!
//! Waits a random interval, then either reads the last line of a random file
//! from one random server, or appends a stamped line to a random file on
//! every server. Both run inside the distributed critical section for that
//! file, so concurrent nodes never interleave their appends.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::Sender;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::mutex::DistributedMutex;
use crate::proto::{AppendLine, ErrorText, NodeId, Opcode, ReadFile, TextResponse};

use super::{FaultCell, NodeError, ServerSession};

const MIN_WAIT_MS: u64 = 500;
const MAX_WAIT_MS: u64 = 5000;
const FAULT_POLL: Duration = Duration::from_millis(100);

pub fn spawn(
    engine: Arc<DistributedMutex>,
    sessions: Vec<ServerSession>,
    files: Vec<String>,
    node_id: NodeId,
    operations: Option<u64>,
    faults: FaultCell,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("workload-driver".to_string())
        .spawn(move || run(engine, sessions, files, node_id, operations, faults))
        .expect("spawn workload driver")
}

fn run(
    engine: Arc<DistributedMutex>,
    sessions: Vec<ServerSession>,
    files: Vec<String>,
    node_id: NodeId,
    operations: Option<u64>,
    faults: FaultCell,
) {
    let mut rng = rand::thread_rng();
    let mut completed = 0u64;

    loop {
        if faults.is_tripped() {
            return;
        }
        if operations.is_some_and(|limit| completed >= limit) {
            tracing::info!(completed, "workload finished");
            faults.trip(None);
            return;
        }

        if !pause(&faults, rng.gen_range(MIN_WAIT_MS..=MAX_WAIT_MS)) {
            return;
        }

        let file = files.choose(&mut rng).expect("file list non-empty").clone();
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);

        let result = if rng.gen_bool(0.5) {
            let server = sessions
                .choose(&mut rng)
                .expect("session list non-empty")
                .clone();
            begin_read(&engine, server, file, done_tx)
        } else {
            begin_write(&engine, &sessions, file, node_id, done_tx)
        };

        if let Err(err) = result {
            faults.trip(Some(err.into()));
            return;
        }

        // The lock may never be granted if the mesh dies underneath us, so
        // keep an eye on the fault cell while waiting.
        let outcome = loop {
            match done_rx.recv_timeout(FAULT_POLL) {
                Ok(result) => break Some(result),
                Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                    if faults.is_tripped() {
                        break None;
                    }
                }
                Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break None,
            }
        };
        match outcome {
            Some(Ok(())) => completed += 1,
            Some(Err(err)) => {
                faults.trip(Some(err));
                return;
            }
            None => return,
        }
    }
}

/// Sleeps in short slices so a fault elsewhere ends the pause early. Returns
/// false if the node is going down.
fn pause(faults: &FaultCell, total_ms: u64) -> bool {
    let mut remaining = Duration::from_millis(total_ms);
    while !remaining.is_zero() {
        if faults.is_tripped() {
            return false;
        }
        let slice = remaining.min(FAULT_POLL);
        thread::sleep(slice);
        remaining -= slice;
    }
    !faults.is_tripped()
}

fn begin_read(
    engine: &Arc<DistributedMutex>,
    server: ServerSession,
    file: String,
    done: Sender<Result<(), crate::Error>>,
) -> Result<(), crate::mutex::MutexError> {
    tracing::debug!(%file, server = %server.location, "beginning mutually exclusive read");
    engine.run_with_mutual_exclusion(&file.clone(), move |cs| {
        let outcome = read_last_line(&server, &file);
        if outcome.is_ok() {
            cs.release();
        }
        // A failed server operation leaves the lock held: the file state is
        // now suspect, and this node is about to take the mesh down with it.
        let _ = done.send(outcome);
    })
}

fn read_last_line(server: &ServerSession, file: &str) -> Result<(), crate::Error> {
    server
        .writer
        .write_blocking(ReadFile::new(file).into_message())?;
    let msg = server.reader.read_blocking()?;
    match msg.opcode {
        Opcode::Response => {
            let response = TextResponse::from_message(msg).map_err(crate::Error::Proto)?;
            tracing::info!(%file, line = %response.text, "read last line");
            Ok(())
        }
        Opcode::Error => Err(server_fault(server, msg)),
        got => Err(NodeError::UnexpectedResponse {
            server: server.location.clone(),
            got,
        }
        .into()),
    }
}

fn begin_write(
    engine: &Arc<DistributedMutex>,
    sessions: &[ServerSession],
    file: String,
    node_id: NodeId,
    done: Sender<Result<(), crate::Error>>,
) -> Result<(), crate::mutex::MutexError> {
    tracing::debug!(%file, "beginning mutually exclusive write");
    let sessions = sessions.to_vec();
    let stamp_engine = Arc::clone(engine);
    engine.run_with_mutual_exclusion(&file.clone(), move |cs| {
        let line = format!("({}, {})", node_id, stamp_engine.timestamp());
        tracing::info!(%file, %line, "appending under the distributed lock");
        let outcome = append_everywhere(&sessions, &file, &line);
        if outcome.is_ok() {
            cs.release();
        }
        let _ = done.send(outcome);
    })
}

/// The appended line must land on every server, in this critical section, or
/// the replicas diverge. All-or-nothing: any failure is fatal for the node.
fn append_everywhere(
    sessions: &[ServerSession],
    file: &str,
    line: &str,
) -> Result<(), crate::Error> {
    for server in sessions {
        server
            .writer
            .write_blocking(AppendLine::new(file, line).into_message()?)?;
    }
    for server in sessions {
        let msg = server.reader.read_blocking()?;
        match msg.opcode {
            Opcode::Ok => {}
            Opcode::Error => return Err(server_fault(server, msg)),
            got => {
                return Err(NodeError::UnexpectedResponse {
                    server: server.location.clone(),
                    got,
                }
                .into());
            }
        }
    }
    Ok(())
}

fn server_fault(server: &ServerSession, msg: crate::proto::Message) -> crate::Error {
    let message = ErrorText::from_message(msg)
        .map(|e| e.message)
        .unwrap_or_else(|_| "unreadable error body".to_string());
    NodeError::ServerFault {
        server: server.location.clone(),
        message,
    }
    .into()
}
