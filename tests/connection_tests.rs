use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use wicket::error::Error;
use wicket::parser;
use wicket::{Connection, PlainSocket, Settings};

fn pair_with(settings: Settings) -> (Connection, UnixStream) {
    let (server, client) = UnixStream::pair().expect("socketpair");
    server.set_nonblocking(true).expect("nonblocking");
    let conn = Connection::with_settings(Box::new(PlainSocket::new(server)), None, settings);
    (conn, client)
}

fn pair() -> (Connection, UnixStream) {
    pair_with(Settings::default())
}

/// Steps the connection until it reports ready, or gives up.
fn drive(conn: &mut Connection) -> Result<bool, Error> {
    for _ in 0..64 {
        if conn.try_to_finish()? {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod header_assembly_tests {
    use super::*;

    #[test]
    fn test_simple_get_becomes_ready_with_empty_body() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        assert!(drive(&mut conn).unwrap(), "connection should become ready");
        assert!(conn.is_ready());
        assert_eq!(conn.env().get("HTTP_HOST").unwrap(), "x");
        assert_eq!(conn.env().get(parser::REQUEST_METHOD).unwrap(), "GET");
        assert!(conn.body_mut().read_all().unwrap().is_empty());
        assert_eq!(conn.requests_served(), 1);
    }

    #[test]
    fn test_no_content_length_needs_no_extra_read() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET /x HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap();

        // A single feed must be enough: header complete, body empty.
        assert!(conn.try_to_finish().unwrap());
        assert!(conn.body_mut().read_all().unwrap().is_empty());
    }

    #[test]
    fn test_header_over_limit_fails_before_body() {
        let settings = Settings {
            max_header_bytes: 64,
            ..Settings::default()
        };
        let (mut conn, mut client) = pair_with(settings);
        let mut request = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(128));
        client.write_all(&request).unwrap();

        assert!(matches!(drive(&mut conn), Err(Error::HeaderTooLarge)));
        assert!(!conn.is_ready());
    }

    #[test]
    fn test_eof_during_header_is_a_connection_error() {
        let (mut conn, client) = pair();
        drop(client);
        assert!(matches!(conn.try_to_finish(), Err(Error::Connection(_))));
    }

    #[test]
    fn test_malformed_request_line_is_a_parse_error() {
        let (mut conn, mut client) = pair();
        client.write_all(b"NOT A REQUEST\r\n\r\n").unwrap();
        assert!(matches!(drive(&mut conn), Err(Error::Parse(_))));
    }
}

#[cfg(test)]
mod body_assembly_tests {
    use super::*;

    #[test]
    fn test_body_buffered_with_header_completes_immediately() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"PUT / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .unwrap();

        // Everything is in one chunk, so the first feed finishes it.
        assert!(conn.try_to_finish().unwrap());
        assert_eq!(conn.body_mut().read_all().unwrap(), b"hello");
        assert!(!conn.body_mut().is_spooled());
    }

    #[test]
    fn test_split_body_needs_a_second_feed() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"PUT / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello")
            .unwrap();

        assert!(!drive(&mut conn).unwrap(), "body is still incomplete");
        assert!(!conn.is_ready());

        client.write_all(b"world").unwrap();
        assert!(drive(&mut conn).unwrap());
        assert_eq!(conn.body_mut().read_all().unwrap(), b"helloworld");
    }

    #[test]
    fn test_one_byte_at_a_time_matches_one_shot() {
        let request: &[u8] = b"PUT /u HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello";

        let (mut one_shot, mut client) = pair();
        client.write_all(request).unwrap();
        assert!(drive(&mut one_shot).unwrap());

        let (mut trickled, mut client) = pair();
        for byte in request {
            client.write_all(&[*byte]).unwrap();
            if drive(&mut trickled).unwrap() {
                break;
            }
        }

        assert!(trickled.is_ready());
        assert_eq!(trickled.env(), one_shot.env());
        assert_eq!(
            trickled.body_mut().read_all().unwrap(),
            one_shot.body_mut().read_all().unwrap()
        );
    }

    #[test]
    fn test_one_call_drains_a_multi_chunk_burst() {
        let settings = Settings {
            chunk_size: 1024,
            ..Settings::default()
        };
        let (mut conn, mut client) = pair_with(settings);
        let body = vec![b'y'; 8 * 1024];
        let mut request =
            format!("PUT / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
        request.extend_from_slice(&body);
        client.write_all(&request).unwrap();

        // Everything is already buffered, so one call must read past the
        // chunk limit repeatedly and assemble the whole request.
        assert!(conn.try_to_finish().unwrap());
        assert_eq!(conn.body_mut().read_all().unwrap(), body);
    }

    #[test]
    fn test_large_body_spools_to_disk() {
        let settings = Settings {
            max_body_bytes: 8,
            ..Settings::default()
        };
        let (mut conn, mut client) = pair_with(settings);
        let payload = vec![b'z'; 32];
        client
            .write_all(b"PUT / HTTP/1.1\r\nContent-Length: 32\r\n\r\nabc")
            .unwrap();

        assert!(!drive(&mut conn).unwrap());
        assert!(conn.body_mut().is_spooled(), "large body should spool");

        client.write_all(&payload[3..]).unwrap();
        assert!(drive(&mut conn).unwrap());
        let mut expected = b"abc".to_vec();
        expected.extend_from_slice(&payload[3..]);
        assert_eq!(conn.body_mut().read_all().unwrap(), expected);
    }

    #[test]
    fn test_small_body_never_touches_disk() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"PUT / HTTP/1.1\r\nContent-Length: 12\r\n\r\nhello")
            .unwrap();
        assert!(!drive(&mut conn).unwrap());
        assert!(!conn.body_mut().is_spooled());

        client.write_all(b" world!").unwrap();
        assert!(drive(&mut conn).unwrap());
        assert!(!conn.body_mut().is_spooled());
        assert_eq!(conn.body_mut().read_all().unwrap(), b"hello world!");
    }

    #[test]
    fn test_peer_closing_mid_body_is_premature_eof() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"PUT / HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello")
            .unwrap();
        assert!(!drive(&mut conn).unwrap());

        drop(client);
        assert!(matches!(conn.try_to_finish(), Err(Error::PrematureEof)));
        // Ready so the caller can respond and close, but truncated.
        assert!(conn.is_ready());
    }
}

#[cfg(test)]
mod keep_alive_tests {
    use super::*;

    #[test]
    fn test_pipelined_request_completes_without_socket_read() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: b\r\n\r\n")
            .unwrap();

        assert!(drive(&mut conn).unwrap());
        assert_eq!(conn.env().get(parser::REQUEST_PATH).unwrap(), "/one");

        // Closing the peer proves reset() never reads the socket: an
        // attempted read would surface as a connection error.
        drop(client);
        assert!(conn.reset(false).unwrap());
        assert_eq!(conn.env().get(parser::REQUEST_PATH).unwrap(), "/two");
        assert_eq!(conn.requests_served(), 2);
        assert_eq!(conn.resets(), 1);
    }

    #[test]
    fn test_body_residue_carries_the_next_request() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"PUT / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /next HTTP/1.1\r\n\r\n")
            .unwrap();

        assert!(drive(&mut conn).unwrap());
        assert_eq!(conn.body_mut().read_all().unwrap(), b"hello");

        drop(client);
        assert!(conn.reset(false).unwrap());
        assert_eq!(conn.env().get(parser::REQUEST_METHOD).unwrap(), "GET");
        assert_eq!(conn.env().get(parser::REQUEST_PATH).unwrap(), "/next");
    }

    #[test]
    fn test_reset_fast_check_picks_up_queued_request() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET /first HTTP/1.1\r\n\r\n")
            .unwrap();
        assert!(drive(&mut conn).unwrap());

        // The second request arrives while the first is being handled.
        client.write_all(b"GET /second HTTP/1.1\r\n\r\n").unwrap();
        assert!(conn.reset(true).unwrap());
        assert_eq!(conn.env().get(parser::REQUEST_PATH).unwrap(), "/second");
    }

    #[test]
    fn test_reset_restores_prototype_env() {
        let mut proto = parser::Env::default();
        proto.insert("SERVER_PORT".to_string(), "8080".to_string());

        let (server, mut client) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        let mut conn = Connection::new(Box::new(PlainSocket::new(server)), Some(proto));

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        assert!(drive(&mut conn).unwrap());
        assert_eq!(conn.env().get("HTTP_HOST").unwrap(), "x");

        assert!(!conn.reset(false).unwrap());
        assert!(conn.env().get("HTTP_HOST").is_none(), "headers cleared");
        assert_eq!(conn.env().get("SERVER_PORT").unwrap(), "8080");
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_eagerly_finish_without_data_reports_not_ready() {
        let (mut conn, _client) = pair();
        assert!(!conn.eagerly_finish().unwrap());
        assert!(!conn.is_ready());
    }

    #[test]
    fn test_eagerly_finish_with_queued_request() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: q\r\n\r\n")
            .unwrap();
        assert!(conn.eagerly_finish().unwrap());
        assert!(conn.is_ready());
    }

    #[test]
    fn test_finish_blocks_until_complete() {
        let (mut conn, mut client) = pair();
        client
            .write_all(b"PUT / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc")
            .unwrap();
        conn.finish().unwrap();
        assert!(conn.is_ready());
        assert_eq!(conn.body_mut().read_all().unwrap(), b"abc");
    }

    #[test]
    fn test_socket_mut_gives_writable_access() {
        use std::io::Read;

        let (mut conn, mut client) = pair();
        let sock = conn.socket_mut().expect("socket still attached");
        sock.write(b"raw").unwrap();
        conn.close();

        let mut out = String::new();
        client.read_to_string(&mut out).unwrap();
        assert_eq!(out, "raw");
    }

    #[test]
    fn test_hijack_detaches_the_socket() {
        let (mut conn, _client) = pair();
        let socket = conn.hijack();
        assert!(socket.is_some());
        assert!(conn.is_hijacked());
        assert!(conn.raw_fd().is_none());
        assert!(matches!(conn.try_to_finish(), Err(Error::Hijacked)));
        assert!(matches!(conn.reset(false), Err(Error::Hijacked)));
        // Canned writers must stay safe on a hijacked connection.
        conn.write_bad_request();
    }

    #[test]
    fn test_set_timeout_arms_a_future_deadline() {
        let (mut conn, _client) = pair();
        assert!(conn.timeout_at().is_none());
        conn.set_timeout(Duration::from_secs(1));
        let deadline = conn.timeout_at().expect("deadline armed");
        assert!(deadline > Instant::now());
    }

    #[test]
    fn test_close_records_finish_time() {
        let (mut conn, _client) = pair();
        assert!(conn.finished_at().is_none());
        conn.close();
        assert!(conn.finished_at().is_some());
        assert!(conn.raw_fd().is_none());
    }

    #[test]
    fn test_canned_writers_reach_the_peer() {
        use std::io::Read;

        let (mut conn, mut client) = pair();
        conn.write_bad_request();
        conn.close();

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Connection: close"));
    }
}
