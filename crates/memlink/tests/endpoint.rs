//! End-to-end engine scenarios over live channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use memlink::{ConfigError, Endpoint, Role, StartError};

fn unique(tag: &str) -> String {
    format!("memlink-ep-{tag}-{}", std::process::id())
}

/// Poll `endpoint` for a message until `timeout` runs out.
fn receive_within(endpoint: &Endpoint, timeout: Duration) -> Option<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(message) = endpoint.receive() {
            return Some(message);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

fn started_pair(tag: &str) -> (Endpoint, Endpoint) {
    let name = unique(tag);
    let server = Endpoint::with_config(&name, Role::Server);
    server.start().unwrap();
    let client = Endpoint::with_config(&name, Role::Client);
    client.start().unwrap();
    (server, client)
}

#[test]
fn client_message_reaches_the_server() {
    let (server, client) = started_pair("echo");

    assert!(client.send(&b"hello"[..]));
    let received = receive_within(&server, Duration::from_millis(500));
    assert_eq!(received.as_deref(), Some(&b"hello"[..]));

    client.stop();
    server.stop();
}

#[test]
fn server_answers_the_client() {
    let (server, client) = started_pair("answer");

    assert!(client.send(&b"hello"[..]));
    assert_eq!(
        receive_within(&server, Duration::from_millis(500)).as_deref(),
        Some(&b"hello"[..])
    );

    assert!(server.send(&b"world"[..]));
    assert_eq!(
        receive_within(&client, Duration::from_millis(500)).as_deref(),
        Some(&b"world"[..])
    );

    client.stop();
    server.stop();
}

#[test]
fn burst_arrives_complete_and_in_order() {
    let (server, client) = started_pair("burst");

    for i in 0..100 {
        assert!(client.send(format!("m{i}").into_bytes()));
    }

    let mut received = Vec::with_capacity(100);
    let deadline = Instant::now() + Duration::from_secs(5);
    while received.len() < 100 && Instant::now() < deadline {
        match server.receive() {
            Some(message) => received.push(message),
            None => thread::sleep(Duration::from_millis(2)),
        }
    }

    let expected: Vec<Vec<u8>> = (0..100).map(|i| format!("m{i}").into_bytes()).collect();
    assert_eq!(received, expected);
    assert_eq!(server.receive(), None);

    client.stop();
    server.stop();
}

#[test]
fn stop_completes_promptly_under_load() {
    let (server, client) = started_pair("load");
    let spamming = AtomicBool::new(true);

    let spamming = &spamming;
    thread::scope(|scope| {
        // Two senders per peer, emitting as fast as the queues accept.
        for endpoint in [&server, &client] {
            for _ in 0..2 {
                scope.spawn(move || {
                    let mut i = 0u32;
                    while spamming.load(Ordering::Relaxed) {
                        endpoint.send(format!("spam {i}").into_bytes());
                        i = i.wrapping_add(1);
                    }
                });
            }
        }

        thread::sleep(Duration::from_millis(100));

        let begin = Instant::now();
        client.stop();
        let client_stop = begin.elapsed();
        let begin = Instant::now();
        server.stop();
        let server_stop = begin.elapsed();

        spamming.store(false, Ordering::Relaxed);

        assert!(
            client_stop < Duration::from_millis(500),
            "client stop took {client_stop:?}"
        );
        assert!(
            server_stop < Duration::from_millis(500),
            "server stop took {server_stop:?}"
        );
    });

    assert!(!server.is_running());
    assert!(!client.is_running());
}

#[test]
fn concurrent_stops_coalesce() {
    let (server, client) = started_pair("race");

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| server.stop());
        }
    });
    assert!(!server.is_running());

    // Later calls are no-ops.
    server.stop();
    client.stop();
}

#[test]
fn configure_is_frozen_while_running() {
    let name = unique("frozen");
    let server = Endpoint::with_config(&name, Role::Server);
    server.start().unwrap();

    assert!(matches!(
        server.configure("somewhere-else", Role::Client),
        Err(ConfigError::Running)
    ));
    assert!(server.is_running());

    server.stop();
    assert!(server.configure(&name, Role::Server).is_ok());
}

#[test]
fn idle_endpoint_rejects_traffic() {
    let endpoint = Endpoint::new();
    assert!(!endpoint.is_running());
    assert!(!endpoint.send(&b"nope"[..]));
    assert_eq!(endpoint.receive(), None);
}

#[test]
fn start_requires_a_channel_name() {
    let endpoint = Endpoint::new();
    assert!(matches!(endpoint.start(), Err(StartError::EmptyName)));
    assert!(!endpoint.is_running());
}

#[test]
fn second_start_is_rejected() {
    let server = Endpoint::with_config(&unique("double"), Role::Server);
    server.start().unwrap();
    assert!(matches!(server.start(), Err(StartError::AlreadyRunning)));
    server.stop();
}

#[test]
fn server_can_restart_on_the_same_channel() {
    let name = unique("restart");
    let server = Endpoint::with_config(&name, Role::Server);

    server.start().unwrap();
    server.stop();
    assert!(!server.is_running());

    server.start().unwrap();
    assert!(server.is_running());
    server.stop();
}

#[test]
fn client_start_fails_without_a_server() {
    let client = Endpoint::with_config(&unique("alone"), Role::Client);
    assert!(matches!(client.start(), Err(StartError::Attach(_))));
    assert!(!client.is_running());
}
