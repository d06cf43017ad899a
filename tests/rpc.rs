//! End-to-end tests over the shared-memory channel: a real client
//! `Connection` talking to a real `channel::server::serve` thread, with no
//! process boundary in between (the wire protocol doesn't care).

use std::sync::Arc;
use std::time::Duration;

use shmrpc::channel::client::Connection;
use shmrpc::channel::server;
use shmrpc::codec::{Codec, Payload};
use shmrpc::error::{ChannelError, RemoteException};
use shmrpc::resource::ResourceManager;
use shmrpc::worker::{MethodTable, Worker, WorkerEvent};

/// Bring up a client connection plus a server thread serving `methods` for
/// that one connection, using a fresh port per test so parallel test runs
/// don't collide on shared-memory names.
fn connect_with_server(port: u16, methods: MethodTable) -> (Connection, std::thread::JoinHandle<()>) {
    let client = Connection::connect(port).unwrap();

    let resource_manager = Arc::new(ResourceManager::new(port));
    let pid = std::process::id() as i32;
    let qid = resource_manager
        .client_connections()
        .unwrap()
        .list()
        .into_iter()
        .find(|&(p, _)| p == pid)
        .expect("client registered its own connection")
        .1;

    resource_manager.server_pids().unwrap().register(pid);

    let methods = Arc::new(methods);
    let (events_tx, _events_rx) = crossbeam_channel::unbounded::<WorkerEvent>();
    let handle = std::thread::spawn(move || {
        let _ = server::serve(resource_manager, methods, pid, qid, events_tx, || false);
    });

    (client, handle)
}

fn echo_methods() -> MethodTable {
    let mut table = MethodTable::new();
    table.register("echo", Codec::Raw, |payload| Ok(payload));
    table
}

#[test]
fn echo_round_trip() {
    let (mut client, server_thread) = connect_with_server(49500, echo_methods());

    let reply = client
        .call(
            b"echo",
            Codec::Raw,
            &Payload::Bytes(b"hello, world".to_vec()),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

    match reply {
        Payload::Bytes(b) => assert_eq!(b, b"hello, world"),
        _ => panic!("expected a bytes payload back"),
    }

    drop(client);
    server_thread.join().unwrap();
}

#[test]
fn repeated_calls_on_one_connection_do_not_deadlock() {
    // A regression guard for the reply-signal race: the server must never
    // re-consume the permit the client's completion handshake is waiting
    // on, or the second call on this connection would block forever.
    let (mut client, server_thread) = connect_with_server(49506, echo_methods());

    for i in 0..5u8 {
        let reply = client
            .call(
                b"echo",
                Codec::Raw,
                &Payload::Bytes(vec![i]),
                Some(Duration::from_secs(5)),
            )
            .unwrap();
        match reply {
            Payload::Bytes(b) => assert_eq!(b, vec![i]),
            _ => panic!("expected a bytes payload back"),
        }
    }

    drop(client);
    server_thread.join().unwrap();
}

#[test]
fn heartbeat_echoes_args_without_reaching_the_method_table() {
    let (mut client, server_thread) = connect_with_server(49507, MethodTable::new());

    let reply = client
        .call(
            b"heartbeat",
            Codec::Raw,
            &Payload::Bytes(b"still alive".to_vec()),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

    match reply {
        Payload::Bytes(b) => assert_eq!(b, b"still alive"),
        _ => panic!("expected a bytes payload back"),
    }

    drop(client);
    server_thread.join().unwrap();
}

#[test]
fn shutdown_replies_then_requests_worker_shutdown() {
    let (mut client, server_thread) = connect_with_server(49508, echo_methods());

    let reply = client
        .call(
            b"shutdown",
            Codec::Raw,
            &Payload::Bytes(vec![]),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

    match reply {
        Payload::Bytes(b) => assert!(b.is_empty()),
        _ => panic!("expected an empty bytes payload back"),
    }
    assert!(Worker::shutdown_requested());

    drop(client);
    server_thread.join().unwrap();
}

#[test]
fn json_codec_round_trip() {
    let mut methods = MethodTable::new();
    methods.register("double", Codec::Json, |payload| match payload {
        Payload::Json(serde_json::Value::Number(n)) => {
            let n = n.as_i64().unwrap_or(0);
            Ok(Payload::Json(serde_json::json!(n * 2)))
        }
        _ => Err(RemoteException::TypeError("expected a number".to_string())),
    });

    let (mut client, server_thread) = connect_with_server(49501, methods);

    let reply = client
        .call(
            b"double",
            Codec::Json,
            &Payload::Json(serde_json::json!(21)),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

    match reply {
        Payload::Json(v) => assert_eq!(v, serde_json::json!(42)),
        _ => panic!("expected a json payload back"),
    }

    drop(client);
    server_thread.join().unwrap();
}

#[test]
fn oversized_request_and_response_force_buffer_resize() {
    // The handler echoes back a much larger payload than it received, so
    // the server's write_response path has to grow the buffer too.
    let mut methods = MethodTable::new();
    methods.register("inflate", Codec::Raw, |payload| match payload {
        Payload::Bytes(b) => {
            let factor = 20_000 / b.len().max(1);
            Ok(Payload::Bytes(b.repeat(factor.max(1))))
        }
        other => Ok(other),
    });

    let (mut client, server_thread) = connect_with_server(49502, methods);

    let big_request = vec![7u8; 10_000];
    let reply = client
        .call(
            b"inflate",
            Codec::Raw,
            &Payload::Bytes(big_request.clone()),
            Some(Duration::from_secs(5)),
        )
        .unwrap();

    match reply {
        Payload::Bytes(b) => {
            assert!(b.len() >= 20_000);
            assert!(b.iter().all(|&byte| byte == 7));
        }
        _ => panic!("expected a bytes payload back"),
    }

    drop(client);
    server_thread.join().unwrap();
}

#[test]
fn unknown_method_surfaces_as_remote_exception() {
    let (mut client, server_thread) = connect_with_server(49503, MethodTable::new());

    let result = client.call(
        b"does_not_exist",
        Codec::Raw,
        &Payload::Bytes(vec![]),
        Some(Duration::from_secs(5)),
    );

    match result {
        Err(ChannelError::Remote(RemoteException::UnknownMethod(name))) => {
            assert_eq!(name, "does_not_exist");
        }
        other => panic!("expected UnknownMethod, got {other:?}"),
    }

    drop(client);
    server_thread.join().unwrap();
}

#[test]
fn handler_error_round_trips_as_typed_remote_exception() {
    let mut methods = MethodTable::new();
    methods.register("fail", Codec::Raw, |_payload| {
        Err(RemoteException::ValueError("bad input".to_string()))
    });

    let (mut client, server_thread) = connect_with_server(49504, methods);

    let result = client.call(b"fail", Codec::Raw, &Payload::Bytes(vec![]), Some(Duration::from_secs(5)));
    match result {
        Err(ChannelError::Remote(RemoteException::ValueError(msg))) => assert_eq!(msg, "bad input"),
        other => panic!("expected ValueError, got {other:?}"),
    }

    drop(client);
    server_thread.join().unwrap();
}

#[test]
fn dropping_the_connection_lets_the_server_thread_exit() {
    let (client, server_thread) = connect_with_server(49505, echo_methods());

    // No call is ever made; dropping the client alone must be enough to
    // unblock the server thread via the lock's `Destroyed` state.
    drop(client);
    server_thread.join().unwrap();
}
