//! Integration tests for prontrd socket communication.
//!
//! Runs a real server on a temporary socket in a background thread and talks
//! to it with raw `UnixStream` clients.

use prontrd::device::{PowerSettle, SimulatedDevice, PSU_POWER};
use prontrd::protocol::{Request, Response};
use prontrd::{PropertyClient, PropertyServer, ServerOptions, ShutdownHandle};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// ============================================================================
// Test Helpers
// ============================================================================

/// A server running on a background thread. Stopped and joined on drop.
struct TestServer {
    socket_path: PathBuf,
    device: SimulatedDevice,
    shutdown: ShutdownHandle,
    handle: Option<thread::JoinHandle<()>>,
    _dir: TempDir,
}

impl TestServer {
    fn start() -> Self {
        Self::start_with(ServerOptions {
            poll_interval: Duration::from_millis(10),
            ..ServerOptions::default()
        })
    }

    fn start_with(options: ServerOptions) -> Self {
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("prontrd.sock");

        let device = SimulatedDevice::new();
        let settle = PowerSettle {
            timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(5),
        };
        let table = device.table(settle).unwrap();
        let mut server = PropertyServer::with_options(table, &socket_path, options);
        let shutdown = server.shutdown_handle();

        let handle = thread::spawn(move || {
            server.serve().unwrap();
        });

        wait_for_socket(&socket_path);

        Self {
            socket_path,
            device,
            shutdown,
            handle: Some(handle),
            _dir: dir,
        }
    }

    fn connect(&self) -> Conn {
        Conn::open(&self.socket_path)
    }

    fn stop(&mut self) {
        self.shutdown.request();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.request();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn wait_for_socket(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if UnixStream::connect(path).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("server did not start listening on {}", path.display());
}

/// A raw client connection reading newline-terminated responses.
struct Conn {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

impl Conn {
    fn open(path: &Path) -> Self {
        let stream = UnixStream::connect(path).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    fn recv_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line
    }

    fn recv_json(&mut self) -> Value {
        let line = self.recv_line();
        assert!(line.ends_with('\n'), "response not newline-terminated: {line:?}");
        serde_json::from_str(&line).unwrap()
    }

    fn request(&mut self, json: &str) -> Value {
        self.send_raw(json.as_bytes());
        self.recv_json()
    }
}

// ============================================================================
// End-to-End Scenarios
// ============================================================================

#[test]
fn test_read_idle_printer_state() {
    let server = TestServer::start();
    let mut conn = server.connect();

    conn.send_raw(br#"{"command":"read","property":"printer_state"}"#);
    assert_eq!(
        conn.recv_line(),
        "{\"command\":\"response\",\"property\":\"printer_state\",\"value\":\"IDLE\"}\n"
    );
}

#[test]
fn test_power_off_refused_while_printing() {
    let server = TestServer::start();
    server.device.force_psu_power(true);
    server.device.set_printer_state("PRINTING");

    let mut conn = server.connect();
    let response = conn.request(r#"{"command":"write","property":"psu_power","value":false}"#);

    assert_eq!(
        response,
        json!({"command": "response", "property": "psu_power", "value": true})
    );
    assert!(server.device.psu_power());
}

#[test]
fn test_write_unknown_property() {
    let server = TestServer::start();
    let mut conn = server.connect();

    conn.send_raw(br#"{"command":"write","property":"ghost_property","value":1}"#);
    assert_eq!(conn.recv_line(), "{\"command\":\"error\"}\n");
    assert!(!server.device.psu_power());
    assert_eq!(server.device.printer_state(), "IDLE");
}

// ============================================================================
// Property Behaviour
// ============================================================================

#[test]
fn test_write_applies_and_reads_back() {
    let server = TestServer::start();
    let mut conn = server.connect();

    let response = conn.request(r#"{"command":"write","property":"psu_power","value":true}"#);
    assert_eq!(response["value"], json!(true));
    assert!(server.device.psu_power());

    let response = conn.request(r#"{"command":"read","property":"psu_power"}"#);
    assert_eq!(response["value"], json!(true));
}

#[test]
fn test_power_off_allowed_when_idle() {
    let server = TestServer::start();
    server.device.force_psu_power(true);

    let mut conn = server.connect();
    let response = conn.request(r#"{"command":"write","property":"psu_power","value":false}"#);
    assert_eq!(response["value"], json!(false));
    assert!(!server.device.psu_power());
}

#[test]
fn test_power_fault_reports_prior_state() {
    let server = TestServer::start();
    server.device.set_power_fault(true);

    let mut conn = server.connect();
    let response = conn.request(r#"{"command":"write","property":"psu_power","value":true}"#);
    assert_eq!(
        response,
        json!({"command": "response", "property": "psu_power", "value": false})
    );
}

#[test]
fn test_led_color_write() {
    let server = TestServer::start();
    let mut conn = server.connect();

    let response = conn.request(
        r#"{"command":"write","property":"led_idle_color","value":{"red":0,"green":128,"blue":255}}"#,
    );
    assert_eq!(response["value"], json!({"red": 0, "green": 128, "blue": 255}));

    let response = conn.request(r#"{"command":"read","property":"led_idle_color"}"#);
    assert_eq!(response["value"], json!({"red": 0, "green": 128, "blue": 255}));
}

#[test]
fn test_type_mismatch_is_error() {
    let server = TestServer::start();
    let mut conn = server.connect();

    let response = conn.request(r#"{"command":"write","property":"printer_state","value":"MELTING"}"#);
    assert_eq!(response, json!({"command": "error"}));
    assert_eq!(server.device.printer_state(), "IDLE");
}

#[test]
fn test_get_and_set_aliases() {
    let server = TestServer::start();
    let mut conn = server.connect();

    let response = conn.request(r#"{"command":"set","property":"led_state","value":"HEATING"}"#);
    assert_eq!(response["value"], json!("HEATING"));

    let response = conn.request(r#"{"command":"get","property":"led_state"}"#);
    assert_eq!(response["value"], json!("HEATING"));
}

// ============================================================================
// Connection Handling
// ============================================================================

#[test]
fn test_malformed_request_keeps_connection_open() {
    let server = TestServer::start();
    let mut conn = server.connect();

    let response = conn.request("{\"command\": not json}\n");
    assert_eq!(response, json!({"command": "error"}));

    let response = conn.request(r#"{"command":"read","property":"led_state"}"#);
    assert_eq!(response["command"], json!("response"));
}

#[test]
fn test_unterminated_request_after_malformed_is_answered() {
    let server = TestServer::start();
    let mut conn = server.connect();

    assert_eq!(conn.request("{bad"), json!({"command": "error"}));

    let response = conn.request(r#"{"command":"read","property":"printer_state"}"#);
    assert_eq!(
        response,
        json!({"command": "response", "property": "printer_state", "value": "IDLE"})
    );
}

#[test]
fn test_multiline_malformed_request_gets_one_error() {
    let server = TestServer::start();
    let mut conn = server.connect();

    assert_eq!(conn.request("{\"command\":\n,}\n"), json!({"command": "error"}));

    let response = conn.request(r#"{"command":"read","property":"led_state"}"#);
    assert_eq!(response["property"], json!("led_state"));
}

#[test]
fn test_missing_fields_are_errors() {
    let server = TestServer::start();
    let mut conn = server.connect();

    for request in [
        r#"{"property":"psu_power"}"#,
        r#"{"command":"read"}"#,
        r#"{"command":"toggle","property":"psu_power"}"#,
        r#"{"command":"write","property":"psu_power"}"#,
        r#"[1,2,3]"#,
    ] {
        assert_eq!(conn.request(request), json!({"command": "error"}), "{request}");
    }
}

#[test]
fn test_pipelined_requests_answered_in_order() {
    let server = TestServer::start();
    let mut conn = server.connect();

    conn.send_raw(
        concat!(
            r#"{"command":"write","property":"printer_state","value":"HEATING"}"#,
            "\n",
            r#"{"command":"read","property":"printer_state"}"#,
            "\n",
            r#"{"command":"read","property":"ghost"}"#,
            "\n",
            r#"{"command":"read","property":"psu_power"}"#,
            "\n",
        )
        .as_bytes(),
    );

    assert_eq!(conn.recv_json()["value"], json!("HEATING"));
    assert_eq!(conn.recv_json()["value"], json!("HEATING"));
    assert_eq!(conn.recv_json(), json!({"command": "error"}));
    assert_eq!(conn.recv_json()["property"], json!("psu_power"));
}

#[test]
fn test_request_split_across_writes() {
    let server = TestServer::start();
    let mut conn = server.connect();

    conn.send_raw(br#"{"command":"read","#);
    thread::sleep(Duration::from_millis(30));
    conn.send_raw(br#""property":"printer_state"}"#);

    assert_eq!(conn.recv_json()["value"], json!("IDLE"));
}

#[test]
fn test_oversized_request_is_error() {
    let server = TestServer::start();
    let mut conn = server.connect();

    let padding = "a".repeat(4096);
    let request = format!(r#"{{"command":"read","property":"{padding}"}}"#);
    conn.send_raw(request.as_bytes());
    conn.send_raw(b"\n");

    assert_eq!(conn.recv_json(), json!({"command": "error"}));

    let response = conn.request(r#"{"command":"read","property":"psu_power"}"#);
    assert_eq!(response["command"], json!("response"));
}

#[test]
fn test_responses_do_not_cross_connections() {
    let server = TestServer::start();
    let mut a = server.connect();
    let mut b = server.connect();

    a.send_raw(br#"{"command":"read","property":"printer_state"}"#);
    b.send_raw(br#"{"command":"read","property":"led_idle_color"}"#);

    assert_eq!(b.recv_json()["property"], json!("led_idle_color"));
    assert_eq!(a.recv_json()["property"], json!("printer_state"));

    // nothing else is pending for either connection
    for conn in [&mut a, &mut b] {
        conn.stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; 64];
        let err = conn.reader.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ));
    }
}

#[test]
fn test_closed_connection_does_not_disturb_others() {
    let server = TestServer::start();
    let mut survivor = server.connect();

    for _ in 0..5 {
        let conn = server.connect();
        drop(conn);
    }

    // a client that closes with a request still in flight
    let mut abrupt = server.connect();
    abrupt.send_raw(br#"{"command":"read","property":"psu_power"}"#);
    drop(abrupt);

    let response = survivor.request(r#"{"command":"read","property":"printer_state"}"#);
    assert_eq!(response["value"], json!("IDLE"));
}

#[test]
fn test_many_concurrent_clients() {
    let server = TestServer::start();
    let path = server.socket_path.clone();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let path = path.clone();
            thread::spawn(move || {
                let mut conn = Conn::open(&path);
                for _ in 0..10 {
                    let state = if i % 2 == 0 { "COMPLETE" } else { "IDLE" };
                    let response = conn.request(&format!(
                        r#"{{"command":"write","property":"led_state","value":"{state}"}}"#
                    ));
                    assert_eq!(response["property"], json!("led_state"));
                    assert_eq!(response["value"], json!(state));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_shutdown_removes_socket_and_closes_clients() {
    let mut server = TestServer::start();
    let mut conn = server.connect();
    let path = server.socket_path.clone();

    // make sure the connection has been accepted before stopping
    let response = conn.request(r#"{"command":"read","property":"psu_power"}"#);
    assert_eq!(response["command"], json!("response"));

    server.stop();

    assert!(!path.exists());
    assert_eq!(conn.recv_line(), "");
}

#[test]
fn test_stale_socket_is_replaced() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("prontrd.sock");

    // leave a socket file behind with nobody listening
    drop(std::os::unix::net::UnixListener::bind(&socket_path).unwrap());
    assert!(socket_path.exists());

    let table = SimulatedDevice::new().table(PowerSettle::default()).unwrap();
    let mut server = PropertyServer::new(table, &socket_path);
    let shutdown = server.shutdown_handle();
    let handle = thread::spawn(move || server.serve());

    wait_for_socket(&socket_path);
    let response = PropertyClient::new(&socket_path).read(PSU_POWER).unwrap();
    assert_eq!(response.json_value(), Some(&json!(false)));

    shutdown.request();
    handle.join().unwrap().unwrap();
}

#[test]
fn test_client_session_reuses_connection() {
    let server = TestServer::start();
    let client = PropertyClient::new(&server.socket_path);
    let mut session = client.connect().unwrap();

    let response = session.write(PSU_POWER, json!(true)).unwrap();
    assert_eq!(response.json_value(), Some(&json!(true)));

    let response = session.send(&Request::read("ghost_property")).unwrap();
    assert!(response.is_error());

    let response: Response = session.read(PSU_POWER).unwrap();
    assert_eq!(response.property(), PSU_POWER);
}

#[test]
fn test_slow_reader_is_dropped_when_queue_bound_hit() {
    let server = TestServer::start_with(ServerOptions {
        poll_interval: Duration::from_millis(10),
        max_pending_responses: Some(4),
        ..ServerOptions::default()
    });

    // never reads; responses pile up once the socket buffer fills
    let mut flood = server.connect();
    flood
        .stream
        .set_write_timeout(Some(Duration::from_millis(200)))
        .unwrap();
    let request = format!(
        "{}\n",
        r#"{"command":"read","property":"led_idle_color"}"#
    );
    for _ in 0..20_000 {
        if flood.stream.write_all(request.as_bytes()).is_err() {
            break;
        }
    }

    let mut other = server.connect();
    let response = other.request(r#"{"command":"read","property":"psu_power"}"#);
    assert_eq!(response["command"], json!("response"));
}
