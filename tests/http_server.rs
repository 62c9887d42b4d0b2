use ostium::http::{HttpRequest, HttpRequestHandler, HttpServer, Responder};
use ostium::{Application, Runtime};

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// The canned response of the end-to-end scenarios, byte for byte.
const NOT_FOUND: &[u8] =
    b"HTTP 404 Not Found\r\nContent-Length: 35\r\n\r\n<HTML><BODY>Not Found</BODY></HTML>";

struct Quiet;

impl Application for Quiet {}

struct StaticHandler(&'static [u8]);

impl HttpRequestHandler for StaticHandler {
    fn request(&self, responder: &mut Responder, request: &HttpRequest<'_>) {
        responder.respond_with_static(request, self.0);
    }
}

struct FileHandler(PathBuf);

impl HttpRequestHandler for FileHandler {
    fn request(&self, responder: &mut Responder, request: &HttpRequest<'_>) {
        if responder.respond_with_file(request, &self.0).is_err() {
            responder.drop_request(request);
        }
    }
}

fn start_server(
    handler: Box<dyn HttpRequestHandler>,
    idle_timeout: Duration,
) -> (Arc<Runtime>, SocketAddr, JoinHandle<i32>) {
    let runtime =
        Arc::new(Runtime::with_idle_timeout(idle_timeout).expect("Failed to create runtime"));

    let server = HttpServer::bind(runtime.reactor(), "127.0.0.1:0", handler)
        .expect("Failed to bind server");
    let addr = server.local_addr();

    let loop_runtime = runtime.clone();
    let handle = thread::spawn(move || loop_runtime.run(&mut Quiet).expect("Run failed"));

    (runtime, addr, handle)
}

fn stop_server(runtime: Arc<Runtime>, handle: JoinHandle<i32>) {
    runtime.stop(0);
    handle.join().expect("Loop thread panicked");
}

#[test]
fn static_response_and_close() {
    let (runtime, addr, handle) =
        start_server(Box::new(StaticHandler(NOT_FOUND)), Duration::from_secs(30));

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .expect("Failed to send request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .expect("Failed to read response");

    // Exactly the handler's bytes, then EOF: no keep-alive was asked for.
    assert_eq!(response, NOT_FOUND);

    stop_server(runtime, handle);
}

#[test]
fn keep_alive_serves_a_second_request() {
    let (runtime, addr, handle) =
        start_server(Box::new(StaticHandler(NOT_FOUND)), Duration::from_secs(30));

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("Failed to set timeout");

    for _ in 0..2 {
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
            .expect("Failed to send request");

        let mut response = vec![0u8; NOT_FOUND.len()];
        client
            .read_exact(&mut response)
            .expect("Failed to read response");
        assert_eq!(response, NOT_FOUND);
    }

    stop_server(runtime, handle);
}

#[test]
fn garbage_flood_is_closed_without_a_response() {
    let (runtime, addr, handle) =
        start_server(Box::new(StaticHandler(NOT_FOUND)), Duration::from_secs(30));

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("Failed to set timeout");

    // 8300 bytes without a CRLFCRLF anywhere; the write itself may fail
    // once the server has already torn the connection down.
    let garbage = vec![b'G'; 8300];
    let _ = client.write_all(&garbage);

    let mut buffer = [0u8; 64];
    match client.read(&mut buffer) {
        Ok(0) => {}
        Ok(n) => panic!("expected no response bytes, got {n}"),
        Err(_) => {
            // Reset instead of FIN also proves the close.
        }
    }

    stop_server(runtime, handle);
}

/// Builds a request whose header block is exactly `total` bytes long.
fn padded_request(total: usize) -> Vec<u8> {
    let prefix = b"GET / HTTP/1.1\r\nHost: x\r\nX-Pad: ";
    let suffix = b"\r\n\r\n";

    let pad = total - prefix.len() - suffix.len();
    let mut request = Vec::with_capacity(total);
    request.extend_from_slice(prefix);
    request.extend(std::iter::repeat(b'a').take(pad));
    request.extend_from_slice(suffix);

    assert_eq!(request.len(), total);
    request
}

#[test]
fn header_block_filling_the_buffer_exactly_is_accepted() {
    let (runtime, addr, handle) =
        start_server(Box::new(StaticHandler(NOT_FOUND)), Duration::from_secs(30));

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client
        .write_all(&padded_request(8192))
        .expect("Failed to send request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .expect("Failed to read response");
    assert_eq!(response, NOT_FOUND);

    stop_server(runtime, handle);
}

#[test]
fn header_block_one_byte_over_the_buffer_is_rejected() {
    let (runtime, addr, handle) =
        start_server(Box::new(StaticHandler(NOT_FOUND)), Duration::from_secs(30));

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("Failed to set timeout");
    let _ = client.write_all(&padded_request(8193));

    let mut buffer = [0u8; 64];
    match client.read(&mut buffer) {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("expected close without a response, got {n} bytes"),
    }

    stop_server(runtime, handle);
}

#[test]
fn a_header_marker_split_across_writes_is_found() {
    let (runtime, addr, handle) =
        start_server(Box::new(StaticHandler(NOT_FOUND)), Duration::from_secs(30));

    let mut client = TcpStream::connect(addr).expect("Failed to connect");

    // First segment ends with CRLF, second begins with CRLF.
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n")
        .expect("Failed to send first segment");
    client.flush().expect("Failed to flush");
    thread::sleep(Duration::from_millis(100));
    client
        .write_all(b"\r\n")
        .expect("Failed to send second segment");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .expect("Failed to read response");
    assert_eq!(response, NOT_FOUND);

    stop_server(runtime, handle);
}

#[test]
fn more_connections_than_one_accept_batch() {
    let (runtime, addr, handle) =
        start_server(Box::new(StaticHandler(NOT_FOUND)), Duration::from_secs(30));

    // Well past the per-event accept budget of 16.
    let mut clients = Vec::new();
    for _ in 0..40 {
        clients.push(TcpStream::connect(addr).expect("Failed to connect"));
    }

    for client in &mut clients {
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .expect("Failed to send request");
    }

    for client in &mut clients {
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .expect("Failed to set timeout");

        let mut response = Vec::new();
        client
            .read_to_end(&mut response)
            .expect("Failed to read response");
        assert_eq!(response, NOT_FOUND);
    }

    stop_server(runtime, handle);
}

#[test]
fn idle_connection_is_closed_by_the_timeout() {
    let (runtime, addr, handle) =
        start_server(Box::new(StaticHandler(NOT_FOUND)), Duration::from_secs(1));

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("Failed to set timeout");

    let started = Instant::now();
    let mut buffer = [0u8; 16];
    let n = client.read(&mut buffer).expect("Failed to read");

    assert_eq!(n, 0, "server should close an idle connection");
    // Within idle timeout plus one wheel second, with a little slack.
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "idle close took {:?}",
        started.elapsed()
    );

    stop_server(runtime, handle);
}

fn file_fixture(size: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().expect("Failed to create fixture");

    let pattern: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    file.write_all(&pattern).expect("Failed to write fixture");
    file.flush().expect("Failed to flush fixture");

    file
}

#[test]
fn file_response_is_byte_exact() {
    const SIZE: usize = 3 * 1024 * 1024;

    let fixture = file_fixture(SIZE);
    let (runtime, addr, handle) = start_server(
        Box::new(FileHandler(fixture.path().to_path_buf())),
        Duration::from_secs(30),
    );

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client
        .write_all(b"GET /f HTTP/1.1\r\nHost: z\r\n\r\n")
        .expect("Failed to send request");

    let mut response = Vec::new();
    client
        .read_to_end(&mut response)
        .expect("Failed to read response");

    let header =
        b"HTTP/1.1 200 Okay\r\nContent-Length: 3145728\r\nConnection: keep-alive\r\n\r\n";
    assert_eq!(response.len(), header.len() + SIZE);
    assert_eq!(&response[..header.len()], header);

    let body = &response[header.len()..];
    assert!(
        body.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8),
        "file bytes corrupted in transit"
    );

    stop_server(runtime, handle);
}

#[test]
fn keep_alive_file_responses_reuse_the_socket() {
    const SIZE: usize = 64 * 1024;

    let fixture = file_fixture(SIZE);
    let (runtime, addr, handle) = start_server(
        Box::new(FileHandler(fixture.path().to_path_buf())),
        Duration::from_secs(30),
    );

    let mut client = TcpStream::connect(addr).expect("Failed to connect");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("Failed to set timeout");

    let header = b"HTTP/1.1 200 Okay\r\nContent-Length: 65536\r\nConnection: keep-alive\r\n\r\n";

    for _ in 0..2 {
        client
            .write_all(b"GET /f HTTP/1.1\r\nHost: z\r\nConnection: keep-alive\r\n\r\n")
            .expect("Failed to send request");

        let mut got_header = vec![0u8; header.len()];
        client
            .read_exact(&mut got_header)
            .expect("Failed to read response header");
        assert_eq!(got_header, header);

        let mut body = vec![0u8; SIZE];
        client.read_exact(&mut body).expect("Failed to read body");
        assert!(body.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));
    }

    stop_server(runtime, handle);
}
