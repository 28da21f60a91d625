//! Integration tests exercising the seed scenarios from SPEC_FULL.md §8
//! against a real daemon instance bound to a dedicated test port, talking
//! to it over an actual TCP loopback connection (no mocked sockets).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use rembash::config::Config;
use rembash::listener::Daemon;

/// Spawns a daemon on its own port in a background thread and gives the
/// listener a moment to bind before returning the port. Each test uses a
/// distinct port to avoid colliding with other tests in the same run.
fn spawn_daemon(port: u16) {
    let mut config = Config::default();
    config.port = port;
    config.worker_threads = 2;
    std::thread::spawn(move || {
        let daemon = Daemon::bootstrap(config).expect("daemon should bootstrap cleanly");
        daemon.run();
    });
    std::thread::sleep(Duration::from_millis(100));
}

fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect should succeed");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

fn read_line(stream: &mut TcpStream) -> String {
    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).expect("read should succeed");
    String::from_utf8_lossy(&buf[..n]).to_string()
}

#[test]
fn happy_path_handshake_and_echo() {
    spawn_daemon(14070);
    let mut stream = connect(14070);

    assert_eq!(read_line(&mut stream), "<rembash>\n");
    stream.write_all(b"cs407rembash\n").unwrap();
    assert_eq!(read_line(&mut stream), "<ok>\n");

    stream.write_all(b"echo hi\n").unwrap();
    let mut seen = String::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    while !seen.contains("hi") && Instant::now() < deadline {
        seen.push_str(&read_line(&mut stream));
    }
    assert!(seen.contains("hi"), "expected shell echo to contain 'hi', got {seen:?}");
}

#[test]
fn wrong_secret_is_rejected() {
    spawn_daemon(14071);
    let mut stream = connect(14071);

    assert_eq!(read_line(&mut stream), "<rembash>\n");
    stream.write_all(b"nope\n").unwrap();
    assert_eq!(read_line(&mut stream), "<error>\n");

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    assert_eq!(n, 0, "server should close the connection after <error>");
}

#[test]
fn echoing_the_challenge_back_is_rejected() {
    spawn_daemon(14072);
    let mut stream = connect(14072);

    assert_eq!(read_line(&mut stream), "<rembash>\n");
    stream.write_all(b"<rembash>\n").unwrap();
    assert_eq!(read_line(&mut stream), "<error>\n");
}

#[test]
fn silent_client_is_disconnected_after_handshake_timeout() {
    let mut config = Config::default();
    config.port = 14073;
    config.handshake_timeout_ms = 300;
    config.worker_threads = 2;
    std::thread::spawn(move || {
        let daemon = Daemon::bootstrap(config).expect("daemon should bootstrap cleanly");
        daemon.run();
    });
    std::thread::sleep(Duration::from_millis(100));

    let mut stream = connect(14073);
    assert_eq!(read_line(&mut stream), "<rembash>\n");

    let start = Instant::now();
    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf).unwrap_or(0);
    let elapsed = start.elapsed();

    assert_eq!(n, 0, "idle client should be disconnected, not sent more data");
    assert!(elapsed < Duration::from_secs(2), "timeout should fire close to the configured deadline");
}

#[test]
fn concurrent_sessions_do_not_cross_talk() {
    spawn_daemon(14074);

    let mut streams: Vec<TcpStream> = (0..8).map(|_| connect(14074)).collect();
    for stream in &mut streams {
        assert_eq!(read_line(stream), "<rembash>\n");
        stream.write_all(b"cs407rembash\n").unwrap();
        assert_eq!(read_line(stream), "<ok>\n");
    }

    for (i, stream) in streams.iter_mut().enumerate() {
        let cmd = format!("echo marker-{i}\n");
        stream.write_all(cmd.as_bytes()).unwrap();
    }

    for (i, stream) in streams.iter_mut().enumerate() {
        let expected = format!("marker-{i}");
        let mut seen = String::new();
        let deadline = Instant::now() + Duration::from_secs(3);
        while !seen.contains(&expected) && Instant::now() < deadline {
            seen.push_str(&read_line(stream));
        }
        assert!(seen.contains(&expected), "session {i} did not see its own marker, saw {seen:?}");
    }
}

#[test]
fn shell_exit_closes_the_client_socket() {
    spawn_daemon(14075);
    let mut stream = connect(14075);

    assert_eq!(read_line(&mut stream), "<rembash>\n");
    stream.write_all(b"cs407rembash\n").unwrap();
    assert_eq!(read_line(&mut stream), "<ok>\n");

    stream.write_all(b"exit\n").unwrap();

    let mut buf = [0u8; 256];
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if Instant::now() > deadline {
                    panic!("shell exit did not close the client socket in time");
                }
            }
            Err(_) => break,
        }
    }
}
