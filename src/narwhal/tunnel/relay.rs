use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::JoinHandle,
};

use crate::narwhal::telemetry::{RelayInfo, SharedRelays};

pub const DEFAULT_BUFFER_BYTES: usize = 32 * 1024;

#[derive(Debug, Default)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
    /// First I/O error seen by whichever direction ended the relay.
    pub error: Option<io::Error>,
}

/// Copy bytes both ways until either direction hits EOF or an error, then
/// shut down and drop both streams.
///
/// Each direction runs in its own task. Unlike `copy_bidirectional`, the
/// relay does not keep the other direction alive after one half closes.
pub async fn splice<A, B>(a: A, b: B, buffer_size: usize) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let buffer_size = if buffer_size == 0 {
        DEFAULT_BUFFER_BYTES
    } else {
        buffer_size
    };
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);

    let mut up = Pump::spawn(ar, bw, buffer_size);
    let mut down = Pump::spawn(br, aw, buffer_size);
    let res = tokio::select! {
        r = up.finished() => r,
        r = down.finished() => r,
    };

    // Dropping the pumps aborts whichever direction is still running.
    RelayStats {
        a_to_b: up.copied(),
        b_to_a: down.copied(),
        error: res.err(),
    }
}

// One direction of a relay. Aborted on drop.
struct Pump {
    copied: Arc<AtomicU64>,
    task: JoinHandle<io::Result<()>>,
}

impl Pump {
    fn spawn<R, W>(r: R, w: W, buffer_size: usize) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let copied = Arc::new(AtomicU64::new(0));
        let task = tokio::spawn(pump(r, w, buffer_size, copied.clone()));
        Self { copied, task }
    }

    async fn finished(&mut self) -> io::Result<()> {
        match (&mut self.task).await {
            Ok(res) => res,
            Err(err) => Err(io::Error::other(err)),
        }
    }

    fn copied(&self) -> u64 {
        self.copied.load(Ordering::Relaxed)
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn pump<R, W>(mut r: R, mut w: W, buffer_size: usize, copied: Arc<AtomicU64>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let res = copy_until_eof(&mut r, &mut w, buffer_size, &copied).await;
    let _ = w.shutdown().await;
    res
}

async fn copy_until_eof<R, W>(r: &mut R, w: &mut W, buffer_size: usize, copied: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    loop {
        let n = r.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        w.write_all(&buf[..n]).await?;
        w.flush().await?;
        copied.fetch_add(n as u64, Ordering::Relaxed);
    }
}

// Keeps the active-relay gauge and the registry entry in step with the
// relay's lifetime, including when the task is aborted.
struct ActiveRelayGuard {
    id: String,
    relays: SharedRelays,
}

impl ActiveRelayGuard {
    fn new(info: RelayInfo, relays: SharedRelays) -> Self {
        metrics::gauge!("narwhal_active_relays").increment(1.0);
        let id = info.id.clone();
        relays.add(info);
        Self { id, relays }
    }
}

impl Drop for ActiveRelayGuard {
    fn drop(&mut self) {
        metrics::gauge!("narwhal_active_relays").decrement(1.0);
        self.relays.remove(&self.id);
    }
}

/// [`splice`] with logging, metrics and an entry in the relay registry.
pub async fn run<A, B>(
    a: A,
    b: B,
    info: RelayInfo,
    buffer_size: usize,
    relays: &SharedRelays,
) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = info.id.clone();
    let sid = info.sid.clone();
    let side = info.side;
    let port = info.port;
    let peer = info.peer.clone();
    let _active = ActiveRelayGuard::new(info, relays.clone());
    tracing::debug!(
        relay = %id,
        sid = %sid,
        side = ?side,
        port,
        peer = %peer,
        active = relays.len(),
        "tunnel: relay started"
    );

    let stats = splice(a, b, buffer_size).await;

    metrics::counter!("narwhal_relay_bytes_total", "direction" => "a_to_b").increment(stats.a_to_b);
    metrics::counter!("narwhal_relay_bytes_total", "direction" => "b_to_a").increment(stats.b_to_a);
    match &stats.error {
        Some(err) => tracing::debug!(
            relay = %id,
            sid = %sid,
            a_to_b = stats.a_to_b,
            b_to_a = stats.b_to_a,
            err = %err,
            "tunnel: relay broken"
        ),
        None => tracing::debug!(
            relay = %id,
            sid = %sid,
            a_to_b = stats.a_to_b,
            b_to_a = stats.b_to_a,
            "tunnel: relay finished"
        ),
    }
    stats
}
