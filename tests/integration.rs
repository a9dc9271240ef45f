//! End-to-end tests over real localhost sockets.
//!
//! The transport-vs-transport tests run a bound `TcpTransport` against a
//! `Session`; the raw-peer tests speak the wire format directly with a
//! plain tokio stream to exercise protocol-violation and teardown paths.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use wiremux::protocol::{WireHeader, HEADER_SIZE, MAX_RPC_LEN};
use wiremux::{Buffer, ServiceLocator, Session, TcpTransport, TransportError};

/// Bind a server transport on a dynamic port and open a session to it.
async fn transport_and_session() -> (Arc<TcpTransport>, Session) {
    let locator = ServiceLocator::parse("tcp:host=127.0.0.1,port=0").unwrap();
    let transport = Arc::new(TcpTransport::bind(&locator).await.unwrap());
    let advertised = ServiceLocator::parse(transport.service_locator()).unwrap();
    let session = transport.get_session(&advertised).unwrap();
    (transport, session)
}

/// Deterministic, boundary-unfriendly payload bytes.
fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

async fn read_frame(stream: &mut TcpStream) -> (WireHeader, Vec<u8>) {
    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes).await.unwrap();
    let header = WireHeader::decode(&header_bytes).unwrap();
    let mut body = vec![0u8; header.len as usize];
    stream.read_exact(&mut body).await.unwrap();
    (header, body)
}

async fn write_frame(stream: &mut TcpStream, nonce: u64, payload: &[u8]) {
    let header = WireHeader::new(nonce, payload.len() as u32).encode();
    stream.write_all(&header).await.unwrap();
    stream.write_all(payload).await.unwrap();
}

#[tokio::test]
async fn simple_echo() {
    let (transport, session) = transport_and_session().await;

    let handle = session.call(Buffer::from_slice(&[0x41, 0x42, 0x43])).unwrap();
    assert_eq!(handle.nonce(), 1);

    let rpc = transport.server_recv().await.unwrap();
    assert_eq!(rpc.nonce(), 1);
    assert_eq!(*rpc.request(), [0x41, 0x42, 0x43][..]);
    let echoed = rpc.request().to_bytes();
    rpc.send_reply(Buffer::from_bytes(echoed));

    let reply = handle.response().await.unwrap();
    assert_eq!(reply, [0x41, 0x42, 0x43][..]);
}

#[tokio::test]
async fn pipelined_requests_complete_out_of_order() {
    let (transport, session) = transport_and_session().await;

    let h1 = session.call(Buffer::from_slice(b"a")).unwrap();
    let h2 = session.call(Buffer::from_slice(b"bb")).unwrap();
    let h3 = session.call(Buffer::from_slice(b"ccc")).unwrap();

    let mut rpcs = Vec::new();
    for _ in 0..3 {
        rpcs.push(transport.server_recv().await.unwrap());
    }
    // Requests arrive in submission order with increasing nonces.
    let nonces: Vec<u64> = rpcs.iter().map(|r| r.nonce()).collect();
    assert_eq!(nonces, vec![1, 2, 3]);

    // Reply in the order 2, 1, 3.
    for want in [2u64, 1, 3] {
        let pos = rpcs.iter().position(|r| r.nonce() == want).unwrap();
        let rpc = rpcs.remove(pos);
        let echoed = rpc.request().to_bytes();
        rpc.send_reply(Buffer::from_bytes(echoed));
    }

    assert_eq!(h1.response().await.unwrap(), b"a"[..]);
    assert_eq!(h2.response().await.unwrap(), b"bb"[..]);
    assert_eq!(h3.response().await.unwrap(), b"ccc"[..]);
}

#[tokio::test]
async fn large_request_spans_many_partial_writes() {
    let (transport, session) = transport_and_session().await;

    let payload = patterned(512 * 1024);
    let handle = session.call(Buffer::from_slice(&payload)).unwrap();

    let rpc = transport.server_recv().await.unwrap();
    assert_eq!(rpc.request().len(), payload.len());
    assert_eq!(rpc.request().to_bytes().as_ref(), payload.as_slice());
    let echoed = rpc.request().to_bytes();
    rpc.send_reply(Buffer::from_bytes(echoed));

    let reply = handle.response().await.unwrap();
    assert_eq!(reply.to_bytes().as_ref(), payload.as_slice());
}

#[tokio::test]
async fn roundtrip_length_grid() {
    let (transport, session) = transport_and_session().await;

    let lengths = [0usize, 1, 12, 13, 8191, 8192, 8193, MAX_RPC_LEN as usize];
    for (i, &len) in lengths.iter().enumerate() {
        let payload = patterned(len);
        let handle = session.call(Buffer::from_slice(&payload)).unwrap();
        assert_eq!(handle.nonce(), (i + 1) as u64);

        let rpc = transport.server_recv().await.unwrap();
        assert_eq!(rpc.request().len(), len);
        let echoed = rpc.request().to_bytes();
        rpc.send_reply(Buffer::from_bytes(echoed));

        let reply = handle.response().await.unwrap();
        assert_eq!(reply.len(), len);
        assert_eq!(reply.to_bytes().as_ref(), payload.as_slice());
    }
}

#[tokio::test]
async fn oversized_response_poisons_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_frame(&mut stream).await;

        // Answer with a length one past the cap; the receiver drains the
        // capped body and then gives up on the connection.
        let evil = WireHeader::new(header.nonce, MAX_RPC_LEN + 1).encode();
        stream.write_all(&evil).await.unwrap();
        let filler = vec![0u8; 64 * 1024];
        let mut remaining = MAX_RPC_LEN as usize;
        while remaining > 0 {
            let n = filler.len().min(remaining);
            if stream.write_all(&filler[..n]).await.is_err() {
                break;
            }
            remaining -= n;
        }
    });

    let locator = ServiceLocator::parse(&format!("tcp:host=127.0.0.1,port={port}")).unwrap();
    let transport = TcpTransport::client_only();
    let session = transport.get_session(&locator).unwrap();

    let handle = session.call(Buffer::from_slice(b"hello")).unwrap();
    match handle.response().await {
        Err(TransportError::Protocol(msg)) => assert!(msg.contains("cap")),
        other => panic!("expected Protocol error, got {:?}", other.map(|_| ())),
    }

    assert!(session.error_info().is_some());
    assert!(matches!(
        session.call(Buffer::from_slice(b"again")),
        Err(TransportError::SessionPoisoned(_))
    ));
    peer.await.unwrap();
}

#[tokio::test]
async fn peer_close_mid_response_poisons_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_frame(&mut stream).await;

        // A header promising ten body bytes, then nothing.
        let partial = WireHeader::new(header.nonce, 10).encode();
        stream.write_all(&partial).await.unwrap();
        stream.flush().await.unwrap();
    });

    let locator = ServiceLocator::parse(&format!("tcp:host=127.0.0.1,port={port}")).unwrap();
    let transport = TcpTransport::client_only();
    let session = transport.get_session(&locator).unwrap();

    let handle = session.call(Buffer::from_slice(b"hello")).unwrap();
    match handle.response().await {
        Err(TransportError::PeerClosed) | Err(TransportError::Io(_)) => {}
        other => panic!(
            "expected a connection-terminated error, got {:?}",
            other.map(|_| ())
        ),
    }

    assert!(session.error_info().is_some());
    assert!(matches!(
        session.call(Buffer::from_slice(b"again")),
        Err(TransportError::SessionPoisoned(_))
    ));
    peer.await.unwrap();
}

#[tokio::test]
async fn unsolicited_response_nonce_is_discarded() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let (first, body) = read_frame(&mut stream).await;
        // A response nobody asked for, then the real one.
        write_frame(&mut stream, first.nonce + 1000, b"to nobody").await;
        write_frame(&mut stream, first.nonce, &body).await;

        let (second, body) = read_frame(&mut stream).await;
        write_frame(&mut stream, second.nonce, &body).await;
    });

    let locator = ServiceLocator::parse(&format!("tcp:host=127.0.0.1,port={port}")).unwrap();
    let transport = TcpTransport::client_only();
    let session = transport.get_session(&locator).unwrap();

    let h1 = session.call(Buffer::from_slice(b"first")).unwrap();
    assert_eq!(h1.response().await.unwrap(), b"first"[..]);

    // The stray frame did not disturb the session.
    assert!(session.error_info().is_none());
    let h2 = session.call(Buffer::from_slice(b"second")).unwrap();
    assert_eq!(h2.response().await.unwrap(), b"second"[..]);
    peer.await.unwrap();
}

#[tokio::test]
async fn cancelled_rpc_leaves_session_framed() {
    let (transport, session) = transport_and_session().await;

    let h1 = session.call(Buffer::from_slice(b"cancel me")).unwrap();
    let cancelled_nonce = h1.nonce();

    // Wait until the request is fully delivered, so cancellation detaches
    // it from the in-flight set rather than mid-transmission.
    let rpc = transport.server_recv().await.unwrap();
    assert_eq!(rpc.nonce(), cancelled_nonce);
    h1.cancel();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // A late reply to the cancelled nonce is drained and discarded.
    rpc.send_reply(Buffer::from_slice(b"late"));

    // The session keeps working.
    let h2 = session.call(Buffer::from_slice(b"still alive")).unwrap();
    let rpc = transport.server_recv().await.unwrap();
    let echoed = rpc.request().to_bytes();
    rpc.send_reply(Buffer::from_bytes(echoed));
    assert_eq!(h2.response().await.unwrap(), b"still alive"[..]);
    assert!(session.error_info().is_none());
}

#[tokio::test]
async fn concurrent_sessions_are_independent() {
    let (transport, session_a) = transport_and_session().await;
    let advertised = ServiceLocator::parse(transport.service_locator()).unwrap();
    let session_b = transport.get_session(&advertised).unwrap();

    let ha = session_a.call(Buffer::from_slice(b"from a")).unwrap();
    let hb = session_b.call(Buffer::from_slice(b"from b")).unwrap();

    // Nonces are per-session; both start at 1.
    assert_eq!(ha.nonce(), 1);
    assert_eq!(hb.nonce(), 1);

    for _ in 0..2 {
        let rpc = transport.server_recv().await.unwrap();
        let echoed = rpc.request().to_bytes();
        rpc.send_reply(Buffer::from_bytes(echoed));
    }

    assert_eq!(ha.response().await.unwrap(), b"from a"[..]);
    assert_eq!(hb.response().await.unwrap(), b"from b"[..]);
}

#[tokio::test]
async fn try_server_recv_sees_queued_request() {
    let (transport, session) = transport_and_session().await;

    assert!(transport.try_server_recv().unwrap().is_none());

    let handle = session.call(Buffer::from_slice(b"poll me")).unwrap();

    // Poll until the request finishes arriving.
    let rpc = loop {
        if let Some(rpc) = transport.try_server_recv().unwrap() {
            break rpc;
        }
        tokio::task::yield_now().await;
    };
    let echoed = rpc.request().to_bytes();
    rpc.send_reply(Buffer::from_bytes(echoed));
    assert_eq!(handle.response().await.unwrap(), b"poll me"[..]);
}
