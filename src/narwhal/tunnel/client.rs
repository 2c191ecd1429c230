use std::{io, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{mpsc, watch},
    time,
};

use crate::narwhal::telemetry::{RelayInfo, RelaySide, SharedRelays};
use crate::narwhal::tunnel::{
    protocol::{self, Code, DataConnTicket, Frame, ProtocolError, ReplyCode},
    relay,
};

const MAX_BACKOFF: Duration = Duration::from_secs(10);
const FRAME_BACKLOG: usize = 16;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub local_addr: String,
    pub remote_port: u16,
    pub uid: String,
    /// Failed registrations tolerated in a row before giving up.
    pub max_retry_times: u32,
    pub retry_backoff: Duration,
    pub dial_timeout: Duration,
    pub reply_timeout: Duration,
    pub buffer_size: usize,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("server rejected {stage}: {code:?}")]
    Rejected {
        stage: &'static str,
        code: Option<ReplyCode>,
    },
    #[error("unexpected reply {0:?}")]
    UnexpectedReply(Code),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

struct Registration {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    context: String,
}

pub struct Client {
    opts: Arc<ClientOptions>,
    relays: SharedRelays,
}

impl Client {
    pub fn new(mut opts: ClientOptions, relays: SharedRelays) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        if opts.local_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client local_addr is required");
        }
        if opts.remote_port == 0 {
            anyhow::bail!("tunnel: client remote_port must be 1..=65535");
        }
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        if opts.reply_timeout.is_zero() {
            opts.reply_timeout = Duration::from_secs(5);
        }
        if opts.retry_backoff.is_zero() {
            opts.retry_backoff = Duration::from_secs(1);
        }
        Ok(Self {
            opts: Arc::new(opts),
            relays,
        })
    }

    /// Register, then serve notifications until shutdown. A lost session is
    /// re-registered with exponential backoff; `max_retry_times` consecutive
    /// failed registrations end the run with an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut failures: u32 = 0;
        let mut backoff = self.opts.retry_backoff;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let err = match self.register().await {
                Ok(reg) => {
                    failures = 0;
                    backoff = self.opts.retry_backoff;
                    match self.serve(reg, shutdown.clone()).await {
                        Ok(()) => return Ok(()),
                        Err(err) => {
                            tracing::warn!(server = %self.opts.server_addr, err = %err, "tunnel: session lost");
                            err
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures > self.opts.max_retry_times {
                        return Err(anyhow::Error::new(err).context(format!(
                            "tunnel: registration failed after {failures} attempts"
                        )));
                    }
                    err
                }
            };

            tracing::warn!(
                server = %self.opts.server_addr,
                remote_port = self.opts.remote_port,
                err = %err,
                failures,
                backoff = %humantime::format_duration(backoff),
                "tunnel: retrying registration"
            );

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn register(&self) -> Result<Registration, ClientError> {
        let stream = dial(&self.opts.server_addr, self.opts.dial_timeout).await?;
        let (mut reader, mut writer) = stream.into_split();

        protocol::write_frame(&mut writer, &Frame::auth(&self.opts.uid)?).await?;
        let reply = self.reply(&mut reader, "auth reply").await?;
        let context = match reply.code() {
            Code::ReplyAuthContext => reply.payload_str(),
            Code::ReplyCode => {
                return Err(ClientError::Rejected {
                    stage: "auth",
                    code: reply.reply(),
                });
            }
            got => return Err(ClientError::UnexpectedReply(got)),
        };
        tracing::info!(server = %self.opts.server_addr, uid = %self.opts.uid, "tunnel: authenticated");

        protocol::write_frame(&mut writer, &Frame::bind(self.opts.remote_port)).await?;
        let reply = self.reply(&mut reader, "bind reply").await?;
        match (reply.code(), reply.reply()) {
            (Code::ReplyCode, Some(ReplyCode::Ok)) => {}
            (Code::ReplyCode, code) => return Err(ClientError::Rejected { stage: "bind", code }),
            (got, _) => return Err(ClientError::UnexpectedReply(got)),
        }
        tracing::info!(
            server = %self.opts.server_addr,
            remote_port = self.opts.remote_port,
            local = %self.opts.local_addr,
            "tunnel: remote port bound"
        );
        Ok(Registration {
            reader,
            writer,
            context,
        })
    }

    async fn reply(&self, r: &mut OwnedReadHalf, what: &'static str) -> Result<Frame, ClientError> {
        match time::timeout(self.opts.reply_timeout, protocol::read_frame(r)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(ClientError::Timeout(what)),
        }
    }

    // Ok(()) only on shutdown; any error means the session is gone.
    async fn serve(&self, reg: Registration, shutdown: watch::Receiver<bool>) -> Result<(), ClientError> {
        let Registration {
            reader,
            mut writer,
            context,
        } = reg;
        // `read_frame` is not cancel safe, so frames are read off the control
        // connection by their own task and handed over on a channel.
        let (tx, mut frames) = mpsc::channel(FRAME_BACKLOG);
        let reader = tokio::spawn(forward_frames(reader, tx));
        let res = self.serve_frames(&mut frames, &mut writer, &context, shutdown).await;
        reader.abort();
        res
    }

    async fn serve_frames(
        &self,
        frames: &mut mpsc::Receiver<Result<Frame, ProtocolError>>,
        writer: &mut OwnedWriteHalf,
        context: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ClientError> {
        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        self.close(frames, writer).await;
                        return Ok(());
                    }
                }
                frame = frames.recv() => {
                    let frame = frame.unwrap_or(Err(ProtocolError::Closed))?;
                    match frame.code() {
                        Code::Notify => {
                            let ticket = DataConnTicket::parse(&frame.payload_str());
                            if ticket.context != context {
                                tracing::warn!(ticket = %ticket, "tunnel: notification for another session; ignoring");
                                continue;
                            }
                            let opts = self.opts.clone();
                            let relays = self.relays.clone();
                            tokio::spawn(async move {
                                if let Err(err) = open_data_conn(opts, relays, ticket).await {
                                    tracing::warn!(err = %err, "tunnel: data connection failed");
                                }
                            });
                        }
                        Code::ReplyCode => {
                            return Err(ClientError::Rejected { stage: "session", code: frame.reply() });
                        }
                        got => {
                            tracing::debug!(code = ?got, "tunnel: ignoring unexpected frame");
                        }
                    }
                }
            }
        }
    }

    async fn close(
        &self,
        frames: &mut mpsc::Receiver<Result<Frame, ProtocolError>>,
        writer: &mut OwnedWriteHalf,
    ) {
        if protocol::write_frame(writer, &Frame::close()).await.is_ok() {
            // Frames already in flight may precede the reply.
            let _ = time::timeout(self.opts.reply_timeout, async {
                while let Some(Ok(frame)) = frames.recv().await {
                    if frame.code() == Code::ReplyCode {
                        break;
                    }
                }
            })
            .await;
        }
        let _ = writer.shutdown().await;
        tracing::info!(server = %self.opts.server_addr, "tunnel: session closed");
    }
}

// Runs until the connection fails or the receiver goes away. The error that
// ends it is forwarded too.
async fn forward_frames(mut reader: OwnedReadHalf, tx: mpsc::Sender<Result<Frame, ProtocolError>>) {
    loop {
        let res = protocol::read_frame(&mut reader).await;
        let failed = res.is_err();
        if tx.send(res).await.is_err() || failed {
            return;
        }
    }
}

async fn dial(addr: &str, timeout: Duration) -> Result<TcpStream, ClientError> {
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(ClientError::Timeout("connect")),
    }
}

async fn open_data_conn(
    opts: Arc<ClientOptions>,
    relays: SharedRelays,
    ticket: DataConnTicket,
) -> Result<(), ClientError> {
    let mut data = dial(&opts.server_addr, opts.dial_timeout).await?;
    protocol::write_frame(&mut data, &Frame::new_data_conn(&ticket)?).await?;
    // A failed local dial drops `data`, which closes the public side too.
    let local = dial(&opts.local_addr, opts.dial_timeout).await?;

    let info = RelayInfo::new(
        ticket.to_string(),
        RelaySide::Client,
        opts.remote_port,
        opts.local_addr.as_str(),
    );
    relay::run(data, local, info, opts.buffer_size, &relays).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use bytes::BytesMut;
    use tokio::{
        io::AsyncReadExt,
        net::TcpListener,
        time::{sleep, timeout},
    };

    use super::*;
    use crate::narwhal::telemetry::RelayRegistry;
    use crate::narwhal::tunnel::{
        auth::AuthRegistry,
        control::SessionOptions,
        server::{Server, ServerOptions},
    };

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn start_server(rule: &str) -> (String, Arc<AuthRegistry>, watch::Sender<bool>) {
        let opts = ServerOptions {
            listen_addr: "127.0.0.1:0".to_string(),
            users: HashMap::from([("alice".to_string(), rule.to_string())]),
            session: SessionOptions {
                bind_host: "127.0.0.1".to_string(),
                ..SessionOptions::default()
            },
        };
        let server = Server::new(opts, Arc::new(RelayRegistry::new())).unwrap();
        let registry = server.registry();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (stop, rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(ln, rx).await });
        (addr, registry, stop)
    }

    async fn start_echo() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut conn, _)) = ln.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn options(server_addr: String, local_addr: String, remote_port: u16) -> ClientOptions {
        ClientOptions {
            server_addr,
            local_addr,
            remote_port,
            uid: "alice".to_string(),
            max_retry_times: 2,
            retry_backoff: Duration::from_millis(10),
            dial_timeout: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(2),
            buffer_size: 1024,
        }
    }

    async fn wait_bound(registry: &AuthRegistry, port: u16) {
        for _ in 0..150 {
            if registry.snapshot().iter().any(|s| s.bound_port == Some(port)) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("port {port} never bound");
    }

    #[tokio::test]
    async fn public_traffic_reaches_local_service() {
        let (server_addr, registry, _stop_server) = start_server("0").await;
        let echo = start_echo().await;
        let port = free_port();

        let relays = Arc::new(RelayRegistry::new());
        let client = Client::new(options(server_addr, echo, port), relays.clone()).unwrap();
        let (stop, rx) = watch::channel(false);
        let run = tokio::spawn(async move { client.run(rx).await });

        wait_bound(&registry, port).await;
        for msg in [&b"ping"[..], &b"a second visitor"[..]] {
            let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
            public.write_all(msg).await.unwrap();
            let mut got = vec![0u8; msg.len()];
            timeout(Duration::from_secs(3), public.read_exact(&mut got))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, msg);
        }

        stop.send(true).unwrap();
        timeout(Duration::from_secs(3), run).await.unwrap().unwrap().unwrap();
        // CLOSE tears the session down on the server.
        for _ in 0..150 {
            if registry.len() == 0 {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("session still registered after shutdown");
    }

    #[tokio::test]
    async fn shutdown_wakeup_keeps_partial_frame() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = ln.local_addr().unwrap().to_string();
        let client = Client::new(
            options(server_addr, format!("127.0.0.1:{}", free_port()), 4000),
            Arc::new(RelayRegistry::new()),
        )
        .unwrap();
        let (stop, rx) = watch::channel(false);
        let run = tokio::spawn(async move { client.run(rx).await });

        let (mut ctrl, _) = ln.accept().await.unwrap();
        assert_eq!(protocol::read_frame(&mut ctrl).await.unwrap().code(), Code::Auth);
        protocol::write_frame(&mut ctrl, &Frame::reply_auth_context("ctx").unwrap())
            .await
            .unwrap();
        assert_eq!(protocol::read_frame(&mut ctrl).await.unwrap().code(), Code::Bind);
        protocol::write_frame(&mut ctrl, &Frame::reply_code(ReplyCode::Ok))
            .await
            .unwrap();

        let mut notify = BytesMut::new();
        Frame::notify(&DataConnTicket::new("ctx", Some(5)))
            .unwrap()
            .encode(&mut notify);
        ctrl.write_all(&notify[..3]).await.unwrap();
        sleep(Duration::from_millis(50)).await;
        // Wake the shutdown receiver without asking for shutdown.
        stop.send(false).unwrap();
        sleep(Duration::from_millis(50)).await;
        ctrl.write_all(&notify[3..]).await.unwrap();

        let (mut data, _) = timeout(Duration::from_secs(3), ln.accept())
            .await
            .unwrap()
            .unwrap();
        let f = protocol::read_frame(&mut data).await.unwrap();
        assert_eq!(f.code(), Code::NewDataConn);
        assert_eq!(
            DataConnTicket::parse(&f.payload_str()),
            DataConnTicket::new("ctx", Some(5))
        );

        stop.send(true).unwrap();
        assert_eq!(protocol::read_frame(&mut ctrl).await.unwrap().code(), Code::Close);
        protocol::write_frame(&mut ctrl, &Frame::reply_code(ReplyCode::ConnClose))
            .await
            .unwrap();
        timeout(Duration::from_secs(3), run).await.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let (server_addr, _registry, _stop_server) = start_server("22").await;
        let echo = start_echo().await;
        let client = Client::new(
            options(server_addr, echo, free_port()),
            Arc::new(RelayRegistry::new()),
        )
        .unwrap();
        let (_stop, rx) = watch::channel(false);

        let err = timeout(Duration::from_secs(5), client.run(rx))
            .await
            .unwrap()
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("after 3 attempts"), "{msg}");
        assert!(msg.contains("InvalidPort"), "{msg}");
    }

    #[tokio::test]
    async fn unreachable_server_counts_as_failure() {
        let mut opts = options(format!("127.0.0.1:{}", free_port()), "127.0.0.1:1".into(), 9);
        opts.max_retry_times = 0;
        let client = Client::new(opts, Arc::new(RelayRegistry::new())).unwrap();
        let (_stop, rx) = watch::channel(false);
        let err = timeout(Duration::from_secs(5), client.run(rx))
            .await
            .unwrap()
            .unwrap_err();
        assert!(format!("{err:#}").contains("after 1 attempts"));
    }

    #[test]
    fn options_are_validated() {
        let relays = Arc::new(RelayRegistry::new());
        let mut opts = options("127.0.0.1:1".into(), "127.0.0.1:2".into(), 0);
        assert!(Client::new(opts.clone(), relays.clone()).is_err());
        opts.remote_port = 80;
        opts.local_addr.clear();
        assert!(Client::new(opts, relays).is_err());
    }
}
