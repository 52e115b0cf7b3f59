//! File-server round trips over the wire protocol.

use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use filemesh::net::Socket;
use filemesh::pool::WorkerPool;
use filemesh::proto::{
    AppendLine, ErrorText, Message, MessageReader, MessageWriter, Opcode, ReadFile, TextResponse,
    CLIENT_TRANSFER_CHUNK,
};
use filemesh::server::FileServer;
use filemesh::tempstore::TempStore;

struct Fixture {
    handle: Option<filemesh::server::FileServerHandle>,
    pool: WorkerPool,
    temp: TempStore,
    _root: tempfile::TempDir,
    _scratch: tempfile::TempDir,
}

impl Fixture {
    fn start() -> Self {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("alpha.txt"), "first\nsecond\n").unwrap();
        std::fs::write(root.path().join("beta.txt"), "only\n").unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let pool = WorkerPool::start(4);
        let temp = TempStore::new(scratch.path().join("scratch"));

        let server = FileServer::new(root.path(), 0, pool.clone(), temp.clone()).unwrap();
        let handle = server.start().unwrap();
        Self {
            handle: Some(handle),
            pool,
            temp,
            _root: root,
            _scratch: scratch,
        }
    }

    fn connect(&self) -> (MessageReader, MessageWriter) {
        let addr = self.handle.as_ref().unwrap().local_addr();
        let stream = TcpStream::connect(addr).unwrap();
        let socket =
            Arc::new(Socket::from_stream(stream, Some(Duration::from_secs(5))).unwrap());
        (
            MessageReader::new(Arc::clone(&socket), self.pool.clone(), self.temp.clone()),
            MessageWriter::new(socket, self.pool.clone(), CLIENT_TRANSFER_CHUNK),
        )
    }

    fn finish(mut self) {
        self.handle.take().unwrap().shutdown();
        self.pool.shutdown();
    }
}

#[test]
fn enquiry_lists_visible_files() {
    let fixture = Fixture::start();
    let (reader, writer) = fixture.connect();

    writer.write_blocking(Message::enquiry()).unwrap();
    let msg = reader.read_blocking().unwrap();
    let response = TextResponse::from_message(msg).unwrap();
    assert_eq!(response.text, "alpha.txt, beta.txt");

    fixture.finish();
}

#[test]
fn read_returns_the_last_line() {
    let fixture = Fixture::start();
    let (reader, writer) = fixture.connect();

    writer
        .write_blocking(ReadFile::new("alpha.txt").into_message())
        .unwrap();
    let response = TextResponse::from_message(reader.read_blocking().unwrap()).unwrap();
    assert_eq!(response.text, "second");

    fixture.finish();
}

#[test]
fn write_appends_and_reads_back() {
    let fixture = Fixture::start();
    let (reader, writer) = fixture.connect();

    writer
        .write_blocking(AppendLine::new("beta.txt", "(1, 9)").into_message().unwrap())
        .unwrap();
    assert_eq!(reader.read_blocking().unwrap().opcode, Opcode::Ok);

    writer
        .write_blocking(ReadFile::new("beta.txt").into_message())
        .unwrap();
    let response = TextResponse::from_message(reader.read_blocking().unwrap()).unwrap();
    assert_eq!(response.text, "(1, 9)");

    fixture.finish();
}

#[test]
fn multiple_clients_are_served_concurrently() {
    let fixture = Fixture::start();
    let (reader_a, writer_a) = fixture.connect();
    let (reader_b, writer_b) = fixture.connect();

    writer_a
        .write_blocking(ReadFile::new("alpha.txt").into_message())
        .unwrap();
    writer_b
        .write_blocking(ReadFile::new("beta.txt").into_message())
        .unwrap();

    let a = TextResponse::from_message(reader_a.read_blocking().unwrap()).unwrap();
    let b = TextResponse::from_message(reader_b.read_blocking().unwrap()).unwrap();
    assert_eq!(a.text, "second");
    assert_eq!(b.text, "only");

    fixture.finish();
}

#[test]
fn traversal_names_get_an_error_reply() {
    let fixture = Fixture::start();
    let (reader, writer) = fixture.connect();

    writer
        .write_blocking(ReadFile::new("../escape").into_message())
        .unwrap();
    let msg = reader.read_blocking().unwrap();
    assert_eq!(msg.opcode, Opcode::Error);
    let error = ErrorText::from_message(msg).unwrap();
    assert!(error.message.contains("invalid file access"));

    fixture.finish();
}

#[test]
fn shutdown_request_is_acknowledged_then_closed() {
    let fixture = Fixture::start();
    let (reader, writer) = fixture.connect();

    writer.write_blocking(Message::shutdown()).unwrap();
    assert_eq!(reader.read_blocking().unwrap().opcode, Opcode::Ok);

    // The server hangs up after acknowledging.
    assert!(reader.read_blocking().is_err());

    fixture.finish();
}
