//! Shared helpers for building request frames and driving an `Engine`
//! through one request/reply pair at a time, without going through the
//! raw stdio framing `Engine::run` uses.
#![allow(dead_code)]

use sftp3d::protocol::MAX_PACKET;
use sftp3d::wire::{Reader, Writer};
use sftp3d::{Engine, MessageType, SFTP_VERSION};

/// Builds one request payload (no length header) via a closure that
/// writes into a `Writer` backed by a full-size scratch buffer.
pub fn build(write: impl FnOnce(&mut Writer<'_>)) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_PACKET];
    let mut w = Writer::new(&mut buf);
    write(&mut w);
    let n = w.position();
    buf.truncate(n);
    buf
}

/// Sends one request payload through `engine` and returns the reply
/// bytes (empty if the request produced no reply).
pub fn send(engine: &mut Engine, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; MAX_PACKET + 4];
    let n = engine
        .handle_request(payload, &mut out)
        .expect("request should not be fatal");
    out.truncate(n);
    out
}

/// Builds a fresh engine and completes the INIT/VERSION handshake.
pub fn handshaken_engine() -> Engine {
    let mut engine = Engine::new();
    let req = build(|w| {
        w.put_byte(MessageType::Init as u8).unwrap();
        w.put_u32(SFTP_VERSION).unwrap();
    });
    let reply = send(&mut engine, &req);
    let mut r = Reader::new(&reply);
    assert_eq!(r.get_byte().unwrap(), MessageType::Version as u8);
    assert_eq!(r.get_u32().unwrap(), SFTP_VERSION);
    engine
}

/// Opens a reply's header and returns `(opcode, request_id, Reader)`
/// positioned right after the request id.
pub fn open_reply(reply: &[u8]) -> (u8, u32, Reader<'_>) {
    let mut r = Reader::new(reply);
    let opcode = r.get_byte().unwrap();
    let id = r.get_u32().unwrap();
    (opcode, id, r)
}

/// Asserts a reply is a `STATUS` packet carrying the given code, and
/// returns the request id it echoed.
pub fn assert_status(reply: &[u8], expected: sftp3d::StatusCode) -> u32 {
    let (opcode, id, mut r) = open_reply(reply);
    assert_eq!(opcode, MessageType::Status as u8, "expected a STATUS reply");
    let code = r.get_u32().unwrap();
    assert_eq!(code, expected as u32);
    id
}
