use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch};

use crate::narwhal::net;
use crate::narwhal::telemetry::SharedRelays;
use crate::narwhal::tunnel::{
    auth::AuthRegistry,
    control::{self, ServerShared, SessionOptions},
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    /// uid -> port rule
    pub users: HashMap<String, String>,
    pub session: SessionOptions,
}

pub struct Server {
    listen_addr: String,
    shared: Arc<ServerShared>,
}

impl Server {
    pub fn new(opts: ServerOptions, relays: SharedRelays) -> anyhow::Result<Self> {
        if opts.listen_addr.trim().is_empty() {
            anyhow::bail!("tunnel: server listen_addr is required");
        }
        let registry = Arc::new(AuthRegistry::new(opts.users));
        Ok(Self {
            listen_addr: opts.listen_addr,
            shared: Arc::new(ServerShared {
                registry,
                relays,
                opts: opts.session,
            }),
        })
    }

    pub fn registry(&self) -> Arc<AuthRegistry> {
        self.shared.registry.clone()
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = net::normalize_bind_addr(&self.listen_addr);
        let ln = TcpListener::bind(addr.as_ref())
            .await
            .with_context(|| format!("tunnel: bind {addr}"))?;
        tracing::info!(addr = %addr, bind_host = %self.shared.opts.bind_host, "tunnel: server listening");
        self.serve(ln, shutdown).await
    }

    /// Accept loop on an already bound listener. Accept errors are logged
    /// and retried; only shutdown ends the loop.
    pub async fn serve(&self, ln: TcpListener, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = ln.accept() => match accepted {
                    Ok((conn, peer)) => {
                        tracing::debug!(peer = %peer, "tunnel: connection accepted");
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            control::serve_connection(conn, peer, shared).await;
                        });
                    }
                    Err(err) => {
                        tracing::warn!(err = %err, "tunnel: accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        tracing::info!("tunnel: server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        time::{sleep, timeout},
    };

    use super::*;
    use crate::narwhal::telemetry::RelayRegistry;
    use crate::narwhal::tunnel::protocol::{
        Code, DataConnTicket, Frame, ProtocolError, ReplyCode, read_frame, write_frame,
    };

    const WAIT: Duration = Duration::from_secs(3);

    struct Harness {
        addr: SocketAddr,
        registry: Arc<AuthRegistry>,
        _stop: watch::Sender<bool>,
    }

    async fn start(users: &[(&str, &str)], tweak: impl FnOnce(&mut SessionOptions)) -> Harness {
        let mut session = SessionOptions {
            bind_host: "127.0.0.1".to_string(),
            handshake_timeout: Duration::from_secs(2),
            pairing_timeout: Duration::from_secs(2),
            ..SessionOptions::default()
        };
        tweak(&mut session);
        let opts = ServerOptions {
            listen_addr: "127.0.0.1:0".to_string(),
            users: users
                .iter()
                .map(|(u, r)| (u.to_string(), r.to_string()))
                .collect(),
            session,
        };
        let server = Server::new(opts, Arc::new(RelayRegistry::new())).unwrap();
        let registry = server.registry();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (stop, rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(ln, rx).await });
        Harness {
            addr,
            registry,
            _stop: stop,
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn next(s: &mut TcpStream) -> Result<Frame, ProtocolError> {
        timeout(WAIT, read_frame(s)).await.expect("frame in time")
    }

    async fn authed(h: &Harness, uid: &str) -> (TcpStream, String) {
        let mut ctrl = TcpStream::connect(h.addr).await.unwrap();
        write_frame(&mut ctrl, &Frame::auth(uid).unwrap()).await.unwrap();
        let reply = next(&mut ctrl).await.unwrap();
        assert_eq!(reply.code(), Code::ReplyAuthContext);
        let token = reply.payload_str();
        (ctrl, token)
    }

    async fn bind(ctrl: &mut TcpStream, port: u16) -> Option<ReplyCode> {
        write_frame(ctrl, &Frame::bind(port)).await.unwrap();
        next(ctrl).await.unwrap().reply()
    }

    async fn notified(ctrl: &mut TcpStream) -> DataConnTicket {
        let f = next(ctrl).await.unwrap();
        assert_eq!(f.code(), Code::Notify);
        DataConnTicket::parse(&f.payload_str())
    }

    async fn data_conn(h: &Harness, ticket: &DataConnTicket) -> TcpStream {
        let mut data = TcpStream::connect(h.addr).await.unwrap();
        write_frame(&mut data, &Frame::new_data_conn(ticket).unwrap())
            .await
            .unwrap();
        data
    }

    async fn assert_closed(s: &mut TcpStream) {
        let mut buf = [0u8; 16];
        match timeout(WAIT, s.read(&mut buf)).await.expect("closed in time") {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("expected close, read {n} bytes"),
        }
    }

    async fn eventually(mut f: impl FnMut() -> bool) -> bool {
        for _ in 0..150 {
            if f() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn exchange(public: &mut TcpStream, data: &mut TcpStream, tag: &[u8]) {
        public.write_all(tag).await.unwrap();
        let mut got = vec![0u8; tag.len()];
        timeout(WAIT, data.read_exact(&mut got)).await.unwrap().unwrap();
        assert_eq!(got, tag);
    }

    #[tokio::test]
    async fn unknown_uid_is_rejected_and_closed() {
        let h = start(&[("alice", "0")], |_| {}).await;
        let mut ctrl = TcpStream::connect(h.addr).await.unwrap();
        write_frame(&mut ctrl, &Frame::auth("ghost").unwrap()).await.unwrap();
        assert_eq!(next(&mut ctrl).await.unwrap().reply(), Some(ReplyCode::AuthFailed));
        assert!(matches!(next(&mut ctrl).await, Err(ProtocolError::Closed)));
        assert_eq!(h.registry.len(), 0);
    }

    #[tokio::test]
    async fn bind_notify_pair_and_relay() {
        let h = start(&[("alice", "0")], |_| {}).await;
        let (mut ctrl, token) = authed(&h, "alice").await;
        assert_eq!(token.len(), 32);
        let port = free_port();
        assert_eq!(bind(&mut ctrl, port).await, Some(ReplyCode::Ok));
        assert_eq!(h.registry.snapshot()[0].bound_port, Some(port));

        let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let ticket = notified(&mut ctrl).await;
        assert_eq!(ticket.context, token);
        assert!(ticket.pairing_id.is_some());

        let mut data = data_conn(&h, &ticket).await;
        exchange(&mut public, &mut data, b"hello from the internet").await;
        exchange(&mut data, &mut public, b"pong").await;

        // One public connection, one notification.
        assert!(timeout(Duration::from_millis(200), read_frame(&mut ctrl)).await.is_err());

        drop(public);
        assert_closed(&mut data).await;
    }

    #[tokio::test]
    async fn closing_control_releases_queued_public_connections() {
        let h = start(&[("alice", "0")], |_| {}).await;
        let (mut ctrl, _token) = authed(&h, "alice").await;
        let port = free_port();
        assert_eq!(bind(&mut ctrl, port).await, Some(ReplyCode::Ok));

        let mut publics = Vec::new();
        for _ in 0..3 {
            publics.push(TcpStream::connect(("127.0.0.1", port)).await.unwrap());
            notified(&mut ctrl).await;
        }
        drop(ctrl);

        for p in &mut publics {
            assert_closed(p).await;
        }
        let registry = h.registry.clone();
        assert!(eventually(|| registry.len() == 0).await);
        // The port is released with the session.
        assert!(eventually(|| std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()).await);
    }

    #[tokio::test]
    async fn pairing_timeout_closes_public_connection() {
        let h = start(&[("alice", "0")], |o| o.pairing_timeout = Duration::from_millis(150)).await;
        let (mut ctrl, _token) = authed(&h, "alice").await;
        let port = free_port();
        assert_eq!(bind(&mut ctrl, port).await, Some(ReplyCode::Ok));

        let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let ticket = notified(&mut ctrl).await;
        assert_closed(&mut public).await;

        // The slot is gone; a late data connection is closed.
        let mut late = data_conn(&h, &ticket).await;
        assert_closed(&mut late).await;
    }

    #[tokio::test]
    async fn port_outside_rule_is_invalid_port() {
        let h = start(&[("alice", "22,80")], |_| {}).await;
        let (mut ctrl, _token) = authed(&h, "alice").await;
        assert_eq!(bind(&mut ctrl, free_port()).await, Some(ReplyCode::InvalidPort));
        assert!(matches!(next(&mut ctrl).await, Err(ProtocolError::Closed)));
        let registry = h.registry.clone();
        assert!(eventually(|| registry.len() == 0).await);
    }

    #[tokio::test]
    async fn port_zero_is_invalid_port() {
        let h = start(&[("bob", "0")], |_| {}).await;
        let (mut ctrl, _token) = authed(&h, "bob").await;
        assert_eq!(bind(&mut ctrl, 0).await, Some(ReplyCode::InvalidPort));
    }

    #[tokio::test]
    async fn bind_payload_must_be_two_bytes() {
        let h = start(&[("bob", "0")], |_| {}).await;
        let port = free_port();
        let be = port.to_be_bytes();
        for payload in [vec![be[1]], vec![0, 0, be[0], be[1]]] {
            let (mut ctrl, _token) = authed(&h, "bob").await;
            write_frame(&mut ctrl, &Frame::new(Code::Bind, payload).unwrap())
                .await
                .unwrap();
            assert_eq!(next(&mut ctrl).await.unwrap().reply(), Some(ReplyCode::InvalidPort));
            assert!(matches!(next(&mut ctrl).await, Err(ProtocolError::Closed)));
        }
        // Nothing was bound.
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn port_in_use_is_invalid_port() {
        let h = start(&[("bob", "0")], |_| {}).await;
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();
        let (mut ctrl, _token) = authed(&h, "bob").await;
        assert_eq!(bind(&mut ctrl, port).await, Some(ReplyCode::InvalidPort));
        assert!(matches!(next(&mut ctrl).await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn stale_context_is_closed_silently() {
        let h = start(&[("alice", "0")], |_| {}).await;
        let mut data = data_conn(&h, &DataConnTicket::new("not-a-context", Some(1))).await;
        assert!(matches!(next(&mut data).await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn bind_before_auth_is_invalid_cmd() {
        let h = start(&[("alice", "0")], |_| {}).await;
        let mut ctrl = TcpStream::connect(h.addr).await.unwrap();
        assert_eq!(bind(&mut ctrl, free_port()).await, Some(ReplyCode::InvalidCmd));
        assert!(matches!(next(&mut ctrl).await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn second_auth_is_invalid_cmd() {
        let h = start(&[("alice", "0")], |_| {}).await;
        let (mut ctrl, _token) = authed(&h, "alice").await;
        write_frame(&mut ctrl, &Frame::auth("alice").unwrap()).await.unwrap();
        assert_eq!(next(&mut ctrl).await.unwrap().reply(), Some(ReplyCode::InvalidCmd));
        assert!(matches!(next(&mut ctrl).await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn silent_client_hits_handshake_timeout() {
        let h = start(&[("alice", "0")], |o| o.handshake_timeout = Duration::from_millis(100)).await;
        let mut ctrl = TcpStream::connect(h.addr).await.unwrap();
        assert!(matches!(next(&mut ctrl).await, Err(ProtocolError::Closed)));
    }

    #[tokio::test]
    async fn close_is_acknowledged_and_tears_down() {
        let h = start(&[("alice", "0")], |_| {}).await;
        let (mut ctrl, token) = authed(&h, "alice").await;
        assert_eq!(bind(&mut ctrl, free_port()).await, Some(ReplyCode::Ok));
        assert!(h.registry.lookup(&token).is_some());

        write_frame(&mut ctrl, &Frame::close()).await.unwrap();
        assert_eq!(next(&mut ctrl).await.unwrap().reply(), Some(ReplyCode::ConnClose));
        assert!(matches!(next(&mut ctrl).await, Err(ProtocolError::Closed)));
        let registry = h.registry.clone();
        assert!(eventually(|| registry.lookup(&token).is_none()).await);
    }

    #[tokio::test]
    async fn ticket_without_id_pairs_oldest_first() {
        let h = start(&[("alice", "0")], |_| {}).await;
        let (mut ctrl, token) = authed(&h, "alice").await;
        let port = free_port();
        assert_eq!(bind(&mut ctrl, port).await, Some(ReplyCode::Ok));

        let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        notified(&mut ctrl).await;
        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        notified(&mut ctrl).await;

        let bare = DataConnTicket::new(token.as_str(), None);
        let mut d1 = data_conn(&h, &bare).await;
        exchange(&mut d1, &mut first, b"one").await;
        let mut d2 = data_conn(&h, &bare).await;
        exchange(&mut d2, &mut second, b"two").await;
    }

    #[tokio::test]
    async fn ticket_ids_pair_out_of_order() {
        let h = start(&[("alice", "0")], |_| {}).await;
        let (mut ctrl, _token) = authed(&h, "alice").await;
        let port = free_port();
        assert_eq!(bind(&mut ctrl, port).await, Some(ReplyCode::Ok));

        let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let t1 = notified(&mut ctrl).await;
        let mut second = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let t2 = notified(&mut ctrl).await;
        assert_ne!(t1.pairing_id, t2.pairing_id);

        let mut d2 = data_conn(&h, &t2).await;
        exchange(&mut d2, &mut second, b"second").await;
        let mut d1 = data_conn(&h, &t1).await;
        exchange(&mut d1, &mut first, b"first").await;
    }

    #[tokio::test]
    async fn full_pairing_queue_drops_extra_public_connections() {
        let h = start(&[("alice", "0")], |o| o.pairing_capacity = 1).await;
        let (mut ctrl, _token) = authed(&h, "alice").await;
        let port = free_port();
        assert_eq!(bind(&mut ctrl, port).await, Some(ReplyCode::Ok));

        let _waiting = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        notified(&mut ctrl).await;
        let mut extra = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert_closed(&mut extra).await;
        assert!(timeout(Duration::from_millis(200), read_frame(&mut ctrl)).await.is_err());
    }
}
