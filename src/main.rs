use std::io;
use std::net::TcpListener;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;

use wicket::parser::{self, Env};
use wicket::socket::poll_writable;
use wicket::{Connection, LogEvents, PlainSocket, Reactor, Settings, SocketError};

const PORT: u16 = 8080;
const WORKERS: usize = 4;
const FIRST_DATA_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

fn main() -> io::Result<()> {
    env_logger::init();

    let settings = Settings::default();
    let (pool_tx, pool_rx) = mpsc::channel::<Connection>();
    let reactor = Reactor::new(Box::new(pool_tx.clone()), Box::new(LogEvents), settings)?;
    let handle = Arc::new(reactor.run_in_thread()?);

    let pool_rx = Arc::new(Mutex::new(pool_rx));
    for i in 0..WORKERS {
        let rx = pool_rx.clone();
        let handle = handle.clone();
        thread::Builder::new()
            .name(format!("wicket-worker-{}", i))
            .spawn(move || loop {
                let conn = {
                    let rx = rx.lock();
                    rx.recv()
                };
                match conn {
                    Ok(conn) => handle_request(conn, &handle),
                    Err(_) => break,
                }
            })?;
    }

    let mut proto_env = Env::default();
    proto_env.insert("SERVER_PORT".to_string(), PORT.to_string());

    let listener = TcpListener::bind(("0.0.0.0", PORT))?;
    info!("wicket listening on http://0.0.0.0:{}", PORT);

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let socket = match PlainSocket::from_tcp(stream) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("could not prepare socket: {}", e);
                continue;
            }
        };
        let mut conn = Connection::with_settings(Box::new(socket), Some(proto_env.clone()), settings);

        // Fast path: the request may already be sitting in the kernel
        // buffer; skip the reactor round-trip if so.
        match conn.eagerly_finish() {
            Ok(true) => {
                let _ = pool_tx.send(conn);
            }
            Ok(false) => {
                conn.set_timeout(FIRST_DATA_TIMEOUT);
                handle.add(conn);
            }
            Err(e) => {
                warn!("client failed before first request: {}", e);
                conn.close();
            }
        }
    }

    Ok(())
}

/// Application side of the pipeline: answer the assembled request, then
/// either keep the connection going or close it.
fn handle_request(mut conn: Connection, handle: &wicket::Handle) {
    loop {
        let body = match conn.body_mut().read_all() {
            Ok(body) => body,
            Err(_) => {
                conn.write_server_error();
                conn.close();
                return;
            }
        };
        let keep_alive = wants_keep_alive(conn.env());
        let response = render_response(conn.env(), body.len(), keep_alive);

        if !write_response(&mut conn, &response) || !keep_alive {
            conn.close();
            return;
        }

        match conn.reset(true) {
            // Pipelined request already assembled; answer it right away.
            Ok(true) => continue,
            Ok(false) => {
                conn.set_timeout(KEEPALIVE_TIMEOUT);
                handle.add(conn);
                return;
            }
            Err(e) => {
                warn!("keep-alive reset failed: {}", e);
                conn.write_bad_request();
                conn.close();
                return;
            }
        }
    }
}

fn wants_keep_alive(env: &Env) -> bool {
    let http_11 = env
        .get(parser::SERVER_PROTOCOL)
        .map_or(false, |v| v == "HTTP/1.1");
    match env.get("HTTP_CONNECTION") {
        Some(value) if value.eq_ignore_ascii_case("close") => false,
        Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
        _ => http_11,
    }
}

fn render_response(env: &Env, body_len: usize, keep_alive: bool) -> Vec<u8> {
    let method = env.get(parser::REQUEST_METHOD).map_or("?", |v| v.as_str());
    let path = env.get(parser::REQUEST_PATH).map_or("?", |v| v.as_str());
    let payload = format!("{} {} ({} body bytes)\n", method, path, body_len);
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{}",
        payload.len(),
        if keep_alive { "keep-alive" } else { "close" },
        payload
    )
    .into_bytes()
}

fn write_response(conn: &mut Connection, bytes: &[u8]) -> bool {
    let fd = match conn.raw_fd() {
        Some(fd) => fd,
        None => return false,
    };
    let mut offset = 0;
    while offset < bytes.len() {
        let sock = match conn.socket_mut() {
            Some(sock) => sock,
            None => return false,
        };
        match sock.write(&bytes[offset..]) {
            Ok(0) => return false,
            Ok(n) => offset += n,
            Err(SocketError::WouldBlock) => match poll_writable(fd, Some(Duration::from_secs(1))) {
                Ok(true) => continue,
                _ => return false,
            },
            Err(_) => return false,
        }
    }
    true
}
