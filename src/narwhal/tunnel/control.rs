use std::{net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, watch},
    time,
};

use crate::narwhal::telemetry::{self, SharedRelays};
use crate::narwhal::tunnel::{
    auth::{AuthRegistry, Session},
    bind::{BindListener, BindOptions, DEFAULT_PAIRING_CAPACITY, PendingBind},
    protocol::{self, Code, DataConnTicket, Frame, ProtocolError, ReplyCode},
    relay::DEFAULT_BUFFER_BYTES,
};

/// Where a connection is in its lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Init,
    Authenticating,
    Authenticated,
    Bound,
    DataConnection,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unknown uid {uid:?}")]
    Auth { uid: String },
    #[error("uid {uid:?} may not bind port {port}")]
    PortDenied { uid: String, port: i64 },
    #[error("bind port {port}: {source}")]
    PortInUse {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("data connection names an unknown auth context")]
    StaleContext,
    #[error("{code:?} not allowed while {role:?}")]
    IllegalFrame { code: Code, role: Role },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("public listener stopped")]
    ListenerLost,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub bind_host: String,
    pub handshake_timeout: Duration,
    pub pairing_timeout: Duration,
    pub pairing_capacity: usize,
    pub buffer_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            handshake_timeout: Duration::from_secs(5),
            pairing_timeout: Duration::from_secs(10),
            pairing_capacity: DEFAULT_PAIRING_CAPACITY,
            buffer_size: DEFAULT_BUFFER_BYTES,
        }
    }
}

/// State every accepted connection needs.
#[derive(Debug)]
pub struct ServerShared {
    pub registry: Arc<AuthRegistry>,
    pub relays: SharedRelays,
    pub opts: SessionOptions,
}

/// Serialized writer for a control connection. The session loop and the
/// public listener both send frames on it.
#[derive(Debug, Clone)]
pub struct ControlWriter {
    inner: Arc<Mutex<OwnedWriteHalf>>,
}

impl ControlWriter {
    pub fn new(w: OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(w)),
        }
    }

    pub async fn send(&self, frame: &Frame) -> Result<(), ProtocolError> {
        let mut w = self.inner.lock().await;
        protocol::write_frame(&mut *w, frame).await
    }

    pub async fn shutdown(&self) {
        let mut w = self.inner.lock().await;
        let _ = w.shutdown().await;
    }

    fn into_inner(self) -> Option<OwnedWriteHalf> {
        Arc::try_unwrap(self.inner).ok().map(Mutex::into_inner)
    }
}

enum Step {
    Continue,
    Exit(Exit),
}

enum Exit {
    Closed,
    Handoff {
        owner: Arc<Session>,
        pairing_id: Option<u32>,
    },
}

// Releases everything a session owns, once, on any exit path.
struct Teardown {
    sid: String,
    registry: Arc<AuthRegistry>,
    context: Option<String>,
    session: Option<Arc<Session>>,
    listener: Option<BindListener>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.close();
            tracing::debug!(sid = %self.sid, port = listener.port(), "tunnel: public listener closed");
        }
        if let Some(context) = self.context.take() {
            self.registry.remove(&context);
        }
        if let Some(session) = self.session.take() {
            let dropped = session.pairing().close();
            tracing::info!(
                sid = %self.sid,
                uid = %session.uid,
                port = ?session.bound_port(),
                dropped_pending = dropped,
                sessions = self.registry.len(),
                "tunnel: session torn down"
            );
        }
    }
}

pub struct ControlConnection {
    sid: String,
    peer: SocketAddr,
    role: Role,
    uid: String,
    reader: OwnedReadHalf,
    writer: ControlWriter,
    listener_lost: Option<watch::Receiver<bool>>,
    shared: Arc<ServerShared>,
    teardown: Teardown,
}

impl ControlConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr, shared: Arc<ServerShared>) -> Self {
        let sid = telemetry::new_id("s");
        let (reader, writer) = stream.into_split();
        let teardown = Teardown {
            sid: sid.clone(),
            registry: shared.registry.clone(),
            context: None,
            session: None,
            listener: None,
        };
        Self {
            sid,
            peer,
            role: Role::Init,
            uid: String::new(),
            reader,
            writer: ControlWriter::new(writer),
            listener_lost: None,
            shared,
            teardown,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn advance(&mut self, next: Role) {
        debug_assert!(next > self.role, "role went from {:?} to {:?}", self.role, next);
        if next > self.role {
            self.role = next;
        }
    }

    async fn next_frame(&mut self) -> Result<Frame, SessionError> {
        if self.role >= Role::Bound {
            let read = protocol::read_frame(&mut self.reader);
            return match self.listener_lost.as_mut() {
                Some(lost) => tokio::select! {
                    res = read => Ok(res?),
                    _ = lost.changed() => Err(SessionError::ListenerLost),
                },
                None => Ok(read.await?),
            };
        }
        match time::timeout(
            self.shared.opts.handshake_timeout,
            protocol::read_frame(&mut self.reader),
        )
        .await
        {
            Ok(res) => Ok(res?),
            Err(_) => Err(SessionError::Timeout("handshake")),
        }
    }

    async fn drive(&mut self) -> Result<Exit, SessionError> {
        loop {
            let frame = self.next_frame().await?;
            if let Step::Exit(exit) = self.dispatch(frame).await? {
                return Ok(exit);
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<Step, SessionError> {
        match (self.role, frame.code()) {
            (Role::Init, Code::Auth) => self.on_auth(&frame).await,
            (Role::Init, Code::NewDataConn) => self.on_new_data_conn(&frame),
            (Role::Authenticated, Code::Bind) => self.on_bind(&frame).await,
            (Role::Init | Role::Authenticated | Role::Bound, Code::Close) => self.on_close().await,
            (role, code) => {
                let _ = self
                    .writer
                    .send(&Frame::reply_code(ReplyCode::InvalidCmd))
                    .await;
                Err(SessionError::IllegalFrame { code, role })
            }
        }
    }

    async fn on_auth(&mut self, frame: &Frame) -> Result<Step, SessionError> {
        self.advance(Role::Authenticating);
        let uid = frame.payload_str();
        if !self.shared.registry.authenticate(&uid) {
            metrics::counter!("narwhal_auth_failures_total").increment(1);
            self.writer
                .send(&Frame::reply_code(ReplyCode::AuthFailed))
                .await?;
            return Err(SessionError::Auth { uid });
        }

        let context = AuthRegistry::generate_context();
        let session = Arc::new(Session::new(
            self.sid.clone(),
            uid.clone(),
            self.peer.to_string(),
            self.shared.opts.pairing_capacity,
        ));
        self.shared
            .registry
            .register(context.clone(), session.clone());
        self.teardown.context = Some(context.clone());
        self.teardown.session = Some(session);
        self.uid = uid;

        self.writer
            .send(&Frame::reply_auth_context(&context)?)
            .await?;
        self.advance(Role::Authenticated);
        tracing::info!(sid = %self.sid, uid = %self.uid, peer = %self.peer, "tunnel: client authenticated");
        Ok(Step::Continue)
    }

    async fn on_bind(&mut self, frame: &Frame) -> Result<Step, SessionError> {
        let requested = frame.payload_int();
        // A port is exactly two big-endian bytes.
        let allowed = u16::try_from(requested)
            .ok()
            .filter(|_| frame.payload().len() == 2)
            .filter(|p| *p != 0 && self.shared.registry.allows(&self.uid, *p));
        let Some(port) = allowed else {
            self.writer
                .send(&Frame::reply_code(ReplyCode::InvalidPort))
                .await?;
            return Err(SessionError::PortDenied {
                uid: self.uid.clone(),
                port: requested,
            });
        };

        let (Some(session), Some(context)) =
            (self.teardown.session.clone(), self.teardown.context.clone())
        else {
            return Err(SessionError::IllegalFrame {
                code: Code::Bind,
                role: self.role,
            });
        };

        let pending = match PendingBind::open(&self.shared.opts.bind_host, port).await {
            Ok(p) => p,
            Err(source) => {
                self.writer
                    .send(&Frame::reply_code(ReplyCode::InvalidPort))
                    .await?;
                return Err(SessionError::PortInUse { port, source });
            }
        };

        session.set_bound_port(port);
        self.writer.send(&Frame::reply_code(ReplyCode::Ok)).await?;
        let opts = BindOptions {
            pairing_timeout: self.shared.opts.pairing_timeout,
            buffer_size: self.shared.opts.buffer_size,
        };
        let listener = pending.start(
            session,
            context,
            self.writer.clone(),
            opts,
            self.shared.relays.clone(),
        );
        self.listener_lost = Some(listener.lost());
        self.teardown.listener = Some(listener);
        self.advance(Role::Bound);
        metrics::counter!("narwhal_binds_total").increment(1);
        tracing::info!(sid = %self.sid, uid = %self.uid, port, "tunnel: port bound");
        Ok(Step::Continue)
    }

    fn on_new_data_conn(&mut self, frame: &Frame) -> Result<Step, SessionError> {
        let ticket = DataConnTicket::parse(&frame.payload_str());
        let Some(owner) = self.shared.registry.lookup(&ticket.context) else {
            return Err(SessionError::StaleContext);
        };
        self.advance(Role::DataConnection);
        Ok(Step::Exit(Exit::Handoff {
            owner,
            pairing_id: ticket.pairing_id,
        }))
    }

    async fn on_close(&mut self) -> Result<Step, SessionError> {
        let _ = self
            .writer
            .send(&Frame::reply_code(ReplyCode::ConnClose))
            .await;
        Ok(Step::Exit(Exit::Closed))
    }

    fn into_stream(self) -> Result<TcpStream, SessionError> {
        let ControlConnection { reader, writer, .. } = self;
        let writer = writer
            .into_inner()
            .ok_or_else(|| std::io::Error::other("data connection writer still shared"))?;
        reader
            .reunite(writer)
            .map_err(|_| std::io::Error::other("data connection halves do not match").into())
    }

    fn hand_off(self, owner: Arc<Session>, pairing_id: Option<u32>) {
        let sid = self.sid.clone();
        let stream = match self.into_stream() {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(sid = %sid, err = %err, "tunnel: cannot hand off data connection");
                return;
            }
        };
        match owner.pairing().deliver(pairing_id, stream) {
            Ok(id) => tracing::debug!(
                sid = %sid,
                owner = %owner.sid,
                pairing_id = id,
                "tunnel: data connection paired"
            ),
            Err(_unpaired) => tracing::warn!(
                sid = %sid,
                owner = %owner.sid,
                pairing_id = ?pairing_id,
                "tunnel: no public connection waiting; closing data connection"
            ),
        }
    }
}

/// Run one accepted connection to completion: a control session, a data
/// connection handed to its owner, or a rejection.
pub async fn serve_connection(stream: TcpStream, peer: SocketAddr, shared: Arc<ServerShared>) {
    metrics::counter!("narwhal_control_connections_total").increment(1);
    let mut conn = ControlConnection::new(stream, peer, shared);
    let sid = conn.sid.clone();

    match conn.drive().await {
        Ok(Exit::Handoff { owner, pairing_id }) => conn.hand_off(owner, pairing_id),
        Ok(Exit::Closed) => {
            conn.writer.shutdown().await;
            tracing::info!(sid = %sid, peer = %peer, "tunnel: client closed session");
        }
        Err(SessionError::Protocol(ProtocolError::Closed)) => {
            tracing::info!(sid = %sid, peer = %peer, role = ?conn.role(), "tunnel: peer disconnected");
        }
        Err(err @ SessionError::StaleContext) => {
            tracing::debug!(sid = %sid, peer = %peer, err = %err, "tunnel: data connection rejected");
        }
        Err(err) => {
            tracing::warn!(sid = %sid, peer = %peer, role = ?conn.role(), err = %err, "tunnel: session aborted");
        }
    }
}
