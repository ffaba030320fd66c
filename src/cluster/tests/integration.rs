// Copyright 2023 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end coverage against an in-process server speaking the binary
//! protocol: connect, optional SASL handshake, set/get round trips,
//! vbucket round-tripping, and the quit handshake on shutdown.

use cluster::*;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const HEADER_LEN: usize = 24;
const TIMEOUT: Duration = Duration::from_secs(5);

static OPAQUE: AtomicU32 = AtomicU32::new(1);

fn next_opaque() -> u32 {
    OPAQUE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
struct ServerState {
    data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    last_vbucket: Mutex<Option<u16>>,
    quits: AtomicUsize,
    require_auth: bool,
}

struct Server {
    addr: SocketAddr,
    state: Arc<ServerState>,
}

fn start_server(require_auth: bool) -> Server {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState {
        require_auth,
        ..Default::default()
    });

    let shared = state.clone();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let state = shared.clone();
            std::thread::spawn(move || serve_connection(stream, state));
        }
    });

    Server { addr, state }
}

fn respond(
    stream: &mut TcpStream,
    opcode: u8,
    status: u16,
    opaque: u32,
    extras: &[u8],
    value: &[u8],
) -> std::io::Result<()> {
    let total = (extras.len() + value.len()) as u32;
    let mut frame = Vec::with_capacity(HEADER_LEN + total as usize);
    frame.push(0x81);
    frame.push(opcode);
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.push(extras.len() as u8);
    frame.push(0);
    frame.extend_from_slice(&status.to_be_bytes());
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(&opaque.to_be_bytes());
    frame.extend_from_slice(&0u64.to_be_bytes());
    frame.extend_from_slice(extras);
    frame.extend_from_slice(value);
    stream.write_all(&frame)
}

fn serve_connection(mut stream: TcpStream, state: Arc<ServerState>) {
    let mut authed = !state.require_auth;

    loop {
        let mut header = [0u8; HEADER_LEN];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        if header[0] != 0x80 {
            return;
        }

        let opcode = header[1];
        let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let extras_len = header[4] as usize;
        let vbucket = u16::from_be_bytes([header[6], header[7]]);
        let total = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);

        let mut body = vec![0u8; total];
        if stream.read_exact(&mut body).is_err() {
            return;
        }
        let key = body[extras_len..extras_len + key_len].to_vec();
        let value = body[extras_len + key_len..].to_vec();

        let result = match opcode {
            // sasl auth: mechanism in the key, credentials in the value
            0x21 => {
                if key == b"PLAIN" && value == b"\0user\0pass" {
                    authed = true;
                    respond(&mut stream, opcode, 0x0000, opaque, &[], &[])
                } else {
                    respond(&mut stream, opcode, 0x0020, opaque, &[], &[])
                }
            }
            _ if !authed => respond(&mut stream, opcode, 0x0020, opaque, &[], &[]),
            // set
            0x01 => {
                *state.last_vbucket.lock().unwrap() = Some(vbucket);
                state.data.lock().unwrap().insert(key, value);
                respond(&mut stream, opcode, 0x0000, opaque, &[], &[])
            }
            // get
            0x00 => {
                *state.last_vbucket.lock().unwrap() = Some(vbucket);
                let stored = state.data.lock().unwrap().get(&key).cloned();
                match stored {
                    Some(value) => respond(
                        &mut stream,
                        opcode,
                        0x0000,
                        opaque,
                        &[0xde, 0xad, 0xbe, 0xef],
                        &value,
                    ),
                    None => respond(&mut stream, opcode, 0x0001, opaque, &[], &[]),
                }
            }
            // quit
            0x07 => {
                state.quits.fetch_add(1, Ordering::SeqCst);
                let _ = respond(&mut stream, opcode, 0x0000, opaque, &[], &[]);
                return;
            }
            // noop
            0x0a => respond(&mut stream, opcode, 0x0000, opaque, &[], &[]),
            _ => respond(&mut stream, opcode, 0x0081, opaque, &[], &[]),
        };

        if result.is_err() {
            return;
        }
    }
}

/// Run one operation to completion, retrying submission refusals while
/// the pool warms up or is momentarily empty.
fn op(
    cluster: &Cluster,
    opcode: Opcode,
    key: &[u8],
    value: Option<&[u8]>,
) -> (Status, Option<Vec<u8>>) {
    let deadline = Instant::now() + TIMEOUT;

    loop {
        let (tx, rx) = mpsc::channel();
        let mut request = OpRequest::new(opcode, key, next_opaque()).on_complete(Box::new(
            move |status, value| {
                let _ = tx.send((status, value));
            },
        ));
        if let Some(value) = value {
            request = request
                .with_extras(vec![0u8; 8])
                .with_value(value.to_vec());
        }

        cluster.submit(Arc::new(request));

        let outcome = rx.recv_timeout(TIMEOUT).expect("no completion");
        if outcome.0 != Status::InternalError || Instant::now() >= deadline {
            return outcome;
        }

        // the pool refused (still connecting, or every transport busy)
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn wait_ready(cluster: &Cluster) {
    let (status, _) = op(cluster, Opcode::NoOp, &[], None);
    assert_eq!(status, Status::NoError, "cluster never became ready");
}

#[test]
fn set_and_get() {
    let server = start_server(false);
    let cluster = ClusterBuilder::new()
        .endpoint(server.addr)
        .pool_size(2)
        .build()
        .expect("failed to build cluster");

    wait_ready(&cluster);

    let (status, _) = op(&cluster, Opcode::Set, b"Hello", Some(b"World"));
    assert_eq!(status, Status::NoError);

    let (status, value) = op(&cluster, Opcode::Get, b"Hello", None);
    assert_eq!(status, Status::NoError);
    assert_eq!(value.as_deref(), Some(&b"World"[..]));
}

#[test]
fn get_miss() {
    let server = start_server(false);
    let cluster = ClusterBuilder::new()
        .endpoint(server.addr)
        .build()
        .expect("failed to build cluster");

    wait_ready(&cluster);

    let (status, value) = op(&cluster, Opcode::Get, b"missing", None);
    assert_eq!(status, Status::KeyNotFound);
    assert_eq!(value, None);
}

#[test]
fn many_round_trips() {
    let server = start_server(false);
    let cluster = ClusterBuilder::new()
        .endpoint(server.addr)
        .pool_size(2)
        .build()
        .expect("failed to build cluster");

    wait_ready(&cluster);

    for i in 0..32 {
        let key = format!("key-{i}");
        let value = format!("value-{i}");
        let (status, _) = op(&cluster, Opcode::Set, key.as_bytes(), Some(value.as_bytes()));
        assert_eq!(status, Status::NoError);
    }

    for i in 0..32 {
        let key = format!("key-{i}");
        let (status, value) = op(&cluster, Opcode::Get, key.as_bytes(), None);
        assert_eq!(status, Status::NoError);
        assert_eq!(value, Some(format!("value-{i}").into_bytes()));
    }
}

#[test]
fn sasl_handshake() {
    let server = start_server(true);
    let cluster = ClusterBuilder::new()
        .endpoint(server.addr)
        .authenticator(Arc::new(PlainAuthenticator::new("user", "pass")))
        .build()
        .expect("failed to build cluster");

    wait_ready(&cluster);

    let (status, _) = op(&cluster, Opcode::Set, b"secured", Some(b"1"));
    assert_eq!(status, Status::NoError);

    let (status, value) = op(&cluster, Opcode::Get, b"secured", None);
    assert_eq!(status, Status::NoError);
    assert_eq!(value.as_deref(), Some(&b"1"[..]));
}

#[test]
fn sasl_rejection_disposes_transports() {
    let server = start_server(true);
    let cluster = ClusterBuilder::new()
        .endpoint(server.addr)
        .authenticator(Arc::new(PlainAuthenticator::new("user", "wrong")))
        .build()
        .expect("failed to build cluster");

    // authentication never completes, so no transport joins the pool and
    // submissions fail with the synthetic status
    let (tx, rx) = mpsc::channel();
    let request = Arc::new(
        OpRequest::new(Opcode::Get, &b"key"[..], next_opaque()).on_complete(Box::new(
            move |status, _| {
                let _ = tx.send(status);
            },
        )),
    );
    cluster.submit(request);
    assert_eq!(
        rx.recv_timeout(TIMEOUT).expect("no completion"),
        Status::InternalError
    );
}

#[test]
fn vbucket_round_trips_to_server() {
    let server = start_server(false);
    let map = VBucketMap::new((0..8).map(|_| vec![0]).collect()).unwrap();
    let cluster = ClusterBuilder::new()
        .endpoint(server.addr)
        .locator(LocatorPolicy::VBucket(map))
        .build()
        .expect("failed to build cluster");

    // key "Hello" hashes to 30673; 30673 % 8 = 1
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let (status, _) = op(&cluster, Opcode::Set, b"Hello", Some(b"World"));
        if status == Status::NoError || Instant::now() >= deadline {
            assert_eq!(status, Status::NoError);
            break;
        }
    }

    assert_eq!(*server.state.last_vbucket.lock().unwrap(), Some(1));
}

#[test]
fn shutdown_sends_quit() {
    let server = start_server(false);
    let cluster = ClusterBuilder::new()
        .endpoint(server.addr)
        .pool_size(2)
        .build()
        .expect("failed to build cluster");

    wait_ready(&cluster);

    cluster.shutdown();

    assert!(server.state.quits.load(Ordering::SeqCst) >= 1);
}
