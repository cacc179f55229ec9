//! Integration tests: a session against scripted servers on localhost.
//!
//! Each fake server speaks the server side of the frame protocol through
//! the same `FrameCodec` the client uses.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use oscar_core::message::{IcbmSubtype, OserviceSubtype, family};
use oscar_core::rendezvous::{IncomingRendezvous, RendezvousKind, RendezvousMessage};
use oscar_core::service::redirect::Redirect;
use oscar_core::{
    ByteReader, ByteWriter, CancelReason, Capability, Channel, Cookie, DefaultTextCodec, Frame,
    FrameCodec, OscarConfig, OscarError, ServiceKey, Session, SessionEvent, Snac, TcpConnector,
    TlvBlock, UserInfo,
};

const WAIT: Duration = Duration::from_secs(5);
const BOS_FAMILIES: [u16; 2] = [family::OSERVICE, family::ICBM];

// ── Helpers ──────────────────────────────────────────────────────

async fn ephemeral_listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Server end of one connection.
struct FakeServer {
    framed: Framed<TcpStream, FrameCodec>,
    next_id: u32,
}

impl FakeServer {
    /// Accept a client, run the open handshake, and return the token it
    /// presented.
    async fn accept(listener: &TcpListener) -> (Self, Bytes) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed
            .send(Frame::new(Channel::Negotiate, vec![0, 0, 0, 1]))
            .await
            .unwrap();
        let hello = framed.next().await.unwrap().unwrap();
        assert_eq!(hello.channel, Channel::Negotiate);
        let mut r = ByteReader::new(&hello.body);
        assert_eq!(r.read_u32().unwrap(), 1);
        let token = TlvBlock::parse(r.read_rest())
            .read(0x0006)
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        (
            Self {
                framed,
                next_id: 0x8000_0000,
            },
            token,
        )
    }

    async fn send(&mut self, snac: Snac) {
        self.framed.send(Frame::data(&snac)).await.unwrap();
    }

    async fn push(&mut self, family: u16, subtype: u16, body: impl Into<Bytes>) {
        self.next_id += 1;
        let snac = Snac::new(family, subtype, self.next_id, body);
        self.send(snac).await;
    }

    /// Next frame that is not a keepalive.
    async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let frame = timeout(WAIT, self.framed.next()).await.ok()??.ok()?;
            if frame.channel != Channel::KeepAlive {
                return Some(frame);
            }
        }
    }

    async fn next_snac(&mut self) -> Snac {
        let frame = self.next_frame().await.expect("connection ended");
        assert_eq!(frame.channel, Channel::Data);
        Snac::parse(&frame.body).unwrap()
    }

    /// Skip ahead to the next sub-message of `family`/`subtype`.
    async fn expect(&mut self, family: u16, subtype: u16) -> Snac {
        loop {
            let snac = self.next_snac().await;
            if snac.family() == family && snac.subtype() == subtype {
                return snac;
            }
        }
    }

    /// Announce `families` and answer the rate exchange.
    async fn bring_online(&mut self, families: &[u16]) {
        let mut w = ByteWriter::new();
        for f in families {
            w.write_u16(*f);
        }
        self.push(family::OSERVICE, OserviceSubtype::HostOnline as u16, w.into_bytes())
            .await;

        self.expect(family::OSERVICE, OserviceSubtype::RateParamsQuery as u16)
            .await;
        self.push(
            family::OSERVICE,
            OserviceSubtype::RateParamsReply as u16,
            rate_reply(),
        )
        .await;
        let ack = self
            .expect(family::OSERVICE, OserviceSubtype::RateParamsSubAdd as u16)
            .await;
        assert_eq!(ack.body.as_ref(), &[0x00, 0x01]);
        let online = self
            .expect(family::OSERVICE, OserviceSubtype::ClientOnline as u16)
            .await;
        assert_eq!(online.body.len(), families.len() * 8);
    }
}

/// One generous rate class, no memberships.
fn rate_reply() -> Bytes {
    let mut w = ByteWriter::new();
    w.write_u16(1).write_u16(1);
    for value in [80u32, 2500, 2000, 1500, 800, 6000, 6000, 0] {
        w.write_u32(value);
    }
    w.write_u8(0);
    w.into_bytes()
}

async fn signed_on() -> (Session, FakeServer, TcpListener) {
    let (listener, addr) = ephemeral_listener().await;
    let server = tokio::spawn(async move {
        let (mut server, token) = FakeServer::accept(&listener).await;
        assert_eq!(token.as_ref(), b"login-token");
        server.bring_online(&BOS_FAMILIES).await;
        (server, listener)
    });
    let mut session = Session::connect(
        OscarConfig::default(),
        Arc::new(TcpConnector),
        "Me",
        &addr,
        Some(&b"login-token"[..]),
    )
    .await
    .unwrap();
    let (server, listener) = server.await.unwrap();

    match timeout(WAIT, session.next_event()).await.unwrap() {
        Some(SessionEvent::ServiceReady { service, families }) => {
            assert_eq!(service, ServiceKey::Family(family::OSERVICE));
            assert_eq!(families, BOS_FAMILIES.to_vec());
        }
        other => panic!("expected ServiceReady, got {other:?}"),
    }
    (session, server, listener)
}

// ── Framing ──────────────────────────────────────────────────────

#[tokio::test]
async fn literal_frame_on_the_wire() {
    let (listener, addr) = ephemeral_listener().await;
    let client = tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        framed.next().await.unwrap().unwrap()
    });
    let (mut stream, _) = listener.accept().await.unwrap();
    tokio::io::AsyncWriteExt::write_all(
        &mut stream,
        &[0x2A, 0x02, 0x00, 0x01, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF],
    )
    .await
    .unwrap();

    let frame = client.await.unwrap();
    assert_eq!(frame.channel, Channel::Data);
    assert_eq!(frame.sequence, 1);
    assert_eq!(frame.body.as_ref(), &[0xDE, 0xAD, 0xBE, 0xEF]);
}

// ── Sign-on ──────────────────────────────────────────────────────

#[tokio::test]
async fn sign_on_reaches_service_ready() {
    let (session, _server, _listener) = signed_on().await;
    assert_eq!(session.screen_name(), "Me");
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn wrong_version_fails_connect() {
    let (listener, addr) = ephemeral_listener().await;
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, FrameCodec::new());
        let _ = framed
            .send(Frame::new(Channel::Negotiate, vec![0, 0, 0, 9]))
            .await;
        let _ = framed.next().await;
    });
    let result = Session::connect(
        OscarConfig::default(),
        Arc::new(TcpConnector),
        "Me",
        &addr,
        None,
    )
    .await;
    assert!(matches!(result, Err(OscarError::ProtocolViolation(_))));
}

#[tokio::test]
async fn shutdown_sends_close_frame() {
    let (session, mut server, _listener) = signed_on().await;
    session.shutdown().await.unwrap();
    let frame = server.next_frame().await.expect("close frame");
    assert_eq!(frame.channel, Channel::Close);
    assert!(server.next_frame().await.is_none());
}

// ── Requests ─────────────────────────────────────────────────────

#[tokio::test]
async fn request_resolves_with_server_reply() {
    let (session, mut server, _listener) = signed_on().await;
    let outbox = session.outbox().clone();
    let pending = tokio::spawn(async move {
        outbox
            .request(
                ServiceKey::Family(family::ICBM),
                family::ICBM,
                0x0004,
                Bytes::from_static(&[0, 0]),
            )
            .await
    });

    let asked = server.expect(family::ICBM, 0x0004).await;
    server
        .send(Snac::new(family::ICBM, 0x0005, asked.request_id(), vec![7, 7]))
        .await;

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.subtype(), 0x0005);
    assert_eq!(reply.body.as_ref(), &[7, 7]);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn error_reply_becomes_server_error() {
    let (mut session, mut server, _listener) = signed_on().await;
    let outbox = session.outbox().clone();
    let pending = tokio::spawn(async move {
        outbox
            .request(ServiceKey::Family(family::ICBM), family::ICBM, 0x0004, Bytes::new())
            .await
    });

    let asked = server.expect(family::ICBM, 0x0004).await;
    server
        .send(Snac::new(family::ICBM, 0x0001, asked.request_id(), vec![0x00, 0x04]))
        .await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(OscarError::ServerError {
            family: family::ICBM,
            code: 4
        })
    ));
    // Consumed by the continuation, so no protocol-error event.
    assert!(timeout(Duration::from_millis(100), session.next_event()).await.is_err());
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn request_fails_when_its_connection_drops() {
    let (mut session, mut server, _listener) = signed_on().await;
    let outbox = session.outbox().clone();
    let pending = tokio::spawn(async move {
        outbox
            .request(ServiceKey::Family(family::ICBM), family::ICBM, 0x0004, Bytes::new())
            .await
    });

    server.expect(family::ICBM, 0x0004).await;
    drop(server);

    let result = timeout(WAIT, pending).await.expect("request never resolved");
    assert!(matches!(result.unwrap(), Err(OscarError::ServiceUnavailable(_))));
    match timeout(WAIT, session.next_event()).await.unwrap() {
        Some(SessionEvent::ConnectionLost { service, .. }) => {
            assert_eq!(service, ServiceKey::Family(family::OSERVICE));
        }
        other => panic!("expected ConnectionLost, got {other:?}"),
    }
    session.shutdown().await.unwrap();
}

// ── Redirects ────────────────────────────────────────────────────

#[tokio::test]
async fn redirect_flushes_queue_in_order() {
    let (session, mut bos, _listener) = signed_on().await;
    let (target, target_addr) = ephemeral_listener().await;
    let service = ServiceKey::Family(0x0013);

    let mut sent = Vec::new();
    for subtype in 1..=3u16 {
        let id = session
            .outbox()
            .send(service.clone(), 0x0013, subtype, vec![subtype as u8])
            .unwrap();
        sent.push(id);
    }

    let request = bos
        .expect(family::OSERVICE, OserviceSubtype::ServiceRequest as u16)
        .await;
    assert_eq!(request.body.as_ref(), &[0x00, 0x13]);
    let redirect = Redirect {
        family: 0x0013,
        address: target_addr,
        token: Bytes::from_static(b"cookie-13"),
    };
    bos.send(Snac::new(
        family::OSERVICE,
        OserviceSubtype::ServiceResponse as u16,
        request.request_id(),
        redirect.encode(),
    ))
    .await;

    let (mut server, token) = FakeServer::accept(&target).await;
    assert_eq!(token.as_ref(), b"cookie-13");
    let mut seen = Vec::new();
    for _ in 0..3 {
        let snac = server.next_snac().await;
        assert_eq!(snac.family(), 0x0013);
        seen.push((snac.subtype(), snac.request_id()));
    }
    let expected: Vec<_> = (1..=3u16).zip(sent).collect();
    assert_eq!(seen, expected);

    // Later traffic goes straight to the attached connection.
    session.outbox().send(service, 0x0013, 9, Bytes::new()).unwrap();
    assert_eq!(server.next_snac().await.subtype(), 9);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn refused_redirect_fails_queued_requests() {
    let (mut session, mut bos, _listener) = signed_on().await;
    let service = ServiceKey::Family(0x0013);
    let outbox = session.outbox().clone();
    let pending = tokio::spawn({
        let service = service.clone();
        async move { outbox.request(service, 0x0013, 0x0002, Bytes::new()).await }
    });

    let request = bos
        .expect(family::OSERVICE, OserviceSubtype::ServiceRequest as u16)
        .await;
    bos.send(Snac::new(
        family::OSERVICE,
        OserviceSubtype::Error as u16,
        request.request_id(),
        vec![0x00, 0x05],
    ))
    .await;

    assert!(matches!(
        pending.await.unwrap(),
        Err(OscarError::ServiceUnavailable(_))
    ));
    match timeout(WAIT, session.next_event()).await.unwrap() {
        Some(SessionEvent::ServiceUnavailable {
            service: failed,
            undeliverable,
            ..
        }) => {
            assert_eq!(failed, service);
            assert_eq!(undeliverable.len(), 1);
        }
        other => panic!("expected ServiceUnavailable, got {other:?}"),
    }
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_redirect_target_fails_open_service() {
    let (session, mut bos, _listener) = signed_on().await;
    let (closed, closed_addr) = ephemeral_listener().await;
    drop(closed);

    let outbox = session.outbox().clone();
    let opening =
        tokio::spawn(async move { outbox.open_service(ServiceKey::Family(0x0010)).await });
    let request = bos
        .expect(family::OSERVICE, OserviceSubtype::ServiceRequest as u16)
        .await;
    let redirect = Redirect {
        family: 0x0010,
        address: closed_addr,
        token: Bytes::new(),
    };
    bos.send(Snac::new(
        family::OSERVICE,
        OserviceSubtype::ServiceResponse as u16,
        request.request_id(),
        redirect.encode(),
    ))
    .await;

    assert!(timeout(WAIT, opening).await.unwrap().unwrap().is_err());
    session.shutdown().await.unwrap();
}

// ── Sign-off ─────────────────────────────────────────────────────

#[tokio::test]
async fn server_logoff_is_reported() {
    let (mut session, mut server, _listener) = signed_on().await;
    let mut tlvs = oscar_core::TlvWriter::new();
    tlvs.write_u16(0x0009, 1)
        .write_str(0x000B, "http://example.invalid/why");
    server
        .framed
        .send(Frame::new(Channel::Close, tlvs.serialize()))
        .await
        .unwrap();

    match timeout(WAIT, session.next_event()).await.unwrap() {
        Some(SessionEvent::LoggedOff { service, code, url }) => {
            assert_eq!(service, ServiceKey::Family(family::OSERVICE));
            assert_eq!(code, 1);
            assert_eq!(url, "http://example.invalid/why");
        }
        other => panic!("expected LoggedOff, got {other:?}"),
    }
    session.shutdown().await.unwrap();
}

// ── Rendezvous ───────────────────────────────────────────────────

#[tokio::test]
async fn unsupported_invitation_is_declined_over_icbm() {
    let (session, mut server, _listener) = signed_on().await;
    let incoming = IncomingRendezvous {
        sender: UserInfo::new("Pal"),
        message: RendezvousMessage::new(
            RendezvousKind::Propose,
            Cookie([9; 8]),
            Capability::FILE_TRANSFER,
        ),
    };
    server
        .push(
            family::ICBM,
            IcbmSubtype::ChannelMsgToClient as u16,
            incoming.to_icbm(&DefaultTextCodec).unwrap(),
        )
        .await;

    let reply = server
        .expect(family::ICBM, IcbmSubtype::ChannelMsgToHost as u16)
        .await;
    let mut r = ByteReader::new(&reply.body);
    assert_eq!(Cookie::read(&mut r).unwrap(), Cookie([9; 8]));
    assert_eq!(r.read_u16().unwrap(), 0x0002);
    assert_eq!(r.read_name().unwrap(), "Pal");
    let tlvs = TlvBlock::parse(r.read_rest());
    let block = tlvs.read(0x0005).unwrap();
    let message = RendezvousMessage::parse_block(block, &DefaultTextCodec).unwrap();
    assert_eq!(message.kind, RendezvousKind::Cancel);
    assert_eq!(CancelReason::from(message.error_code), CancelReason::NotAcceptable);
    assert_eq!(session.rendezvous().live_negotiations(), 0);
    session.shutdown().await.unwrap();
}

// ── Chat ─────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_room_over_redirect() {
    let (session, mut bos, _listener) = signed_on().await;
    let (target, target_addr) = ephemeral_listener().await;

    let rooms = Arc::clone(session.chat());
    let joining = tokio::spawn(async move { rooms.join("aol://2719:10-4-lobby").await });

    let request = bos
        .expect(family::OSERVICE, OserviceSubtype::ServiceRequest as u16)
        .await;
    assert_eq!(&request.body[..2], &[0x00, 0x0E]);
    let redirect = Redirect {
        family: family::CHAT,
        address: target_addr,
        token: Bytes::from_static(b"room"),
    };
    bos.send(Snac::new(
        family::OSERVICE,
        OserviceSubtype::ServiceResponse as u16,
        request.request_id(),
        redirect.encode(),
    ))
    .await;

    let (mut room_server, token) = FakeServer::accept(&target).await;
    assert_eq!(token.as_ref(), b"room");
    let mut handle = timeout(WAIT, joining).await.unwrap().unwrap().unwrap();
    room_server.bring_online(&[family::OSERVICE, family::CHAT]).await;

    let mut users = ByteWriter::new();
    UserInfo::new("Alice").write(&mut users);
    room_server.push(family::CHAT, 0x0003, users.into_bytes()).await;
    assert_eq!(
        timeout(WAIT, handle.next_event()).await.unwrap(),
        Some(oscar_core::ChatEvent::Joined("Alice".into()))
    );
    assert_eq!(handle.members(), vec!["Alice"]);

    handle.send_message("hello room").unwrap();
    let posted = room_server.expect(family::CHAT, 0x0005).await;
    assert_eq!(&posted.body[8..10], &[0x00, 0x03]);

    handle.leave().unwrap();
    let frame = room_server.next_frame().await.expect("close frame");
    assert_eq!(frame.channel, Channel::Close);
    session.shutdown().await.unwrap();
}
