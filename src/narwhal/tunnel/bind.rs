use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{oneshot, watch},
    task::JoinHandle,
    time,
};

use crate::narwhal::net;
use crate::narwhal::telemetry::{RelayInfo, RelaySide, SharedRelays};
use crate::narwhal::tunnel::{
    auth::Session,
    control::ControlWriter,
    protocol::{DataConnTicket, Frame},
    relay,
};

pub const DEFAULT_PAIRING_CAPACITY: usize = 64;

struct PairingState<T> {
    next_id: u32,
    closed: bool,
    waiting: BTreeMap<u32, oneshot::Sender<T>>,
}

/// Public connections waiting for the client's matching data connection.
///
/// Each waiter holds a slot keyed by a pairing id. A delivery names the id it
/// answers, or takes the oldest slot when it carries none. Ids increase
/// monotonically, so `BTreeMap` order is arrival order.
pub struct PairingQueue<T> {
    capacity: usize,
    state: Mutex<PairingState<T>>,
}

impl<T> std::fmt::Debug for PairingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingQueue")
            .field("capacity", &self.capacity)
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

pub struct PairingSlot<T> {
    id: u32,
    rx: oneshot::Receiver<T>,
}

#[derive(Debug)]
pub enum SlotOutcome<T> {
    Paired(T),
    TimedOut,
    /// The queue was closed, so the owning session is gone.
    Closed,
}

impl<T> PairingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(PairingState {
                next_id: 1,
                closed: false,
                waiting: BTreeMap::new(),
            }),
        }
    }

    /// `None` when the queue is full or closed.
    pub fn reserve(&self) -> Option<PairingSlot<T>> {
        let mut st = self.lock();
        if st.closed || st.waiting.len() >= self.capacity {
            return None;
        }
        let id = st.next_id;
        st.next_id = st.next_id.wrapping_add(1).max(1);
        let (tx, rx) = oneshot::channel();
        st.waiting.insert(id, tx);
        Some(PairingSlot { id, rx })
    }

    /// Give up a slot. `false` if it was already taken by a delivery or by
    /// [`PairingQueue::close`].
    pub fn cancel(&self, id: u32) -> bool {
        self.lock().waiting.remove(&id).is_some()
    }

    /// Hand `item` to the waiter with `id`, or to the oldest live waiter when
    /// `id` is `None`. Returns the item when nobody takes it.
    pub fn deliver(&self, id: Option<u32>, item: T) -> Result<u32, T> {
        let mut item = item;
        loop {
            let (slot, tx) = {
                let mut st = self.lock();
                let entry = match id {
                    Some(id) => st.waiting.remove(&id).map(|tx| (id, tx)),
                    None => st.waiting.pop_first(),
                };
                match entry {
                    Some(e) => e,
                    None => return Err(item),
                }
            };
            match tx.send(item) {
                Ok(()) => return Ok(slot),
                // Waiter went away without cancelling; try the next one.
                Err(back) if id.is_none() => item = back,
                Err(back) => return Err(back),
            }
        }
    }

    /// Refuse further slots and drop every pending one. Returns how many
    /// waiters were released.
    pub fn close(&self) -> usize {
        let mut st = self.lock();
        st.closed = true;
        let n = st.waiting.len();
        st.waiting.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, PairingState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> PairingSlot<T> {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn wait(mut self, queue: &PairingQueue<T>, timeout: Duration) -> SlotOutcome<T> {
        match time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(v)) => SlotOutcome::Paired(v),
            Ok(Err(_)) => SlotOutcome::Closed,
            Err(_) => {
                if queue.cancel(self.id) {
                    return SlotOutcome::TimedOut;
                }
                // A delivery or close claimed the slot as the timer fired.
                match self.rx.await {
                    Ok(v) => SlotOutcome::Paired(v),
                    Err(_) => SlotOutcome::Closed,
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindOptions {
    pub pairing_timeout: Duration,
    pub buffer_size: usize,
}

/// A bound public port whose accept loop has not started yet.
///
/// Connections that arrive before [`PendingBind::start`] wait in the kernel
/// backlog, so no `NOTIFY` can overtake the bind reply.
pub struct PendingBind {
    port: u16,
    ln: TcpListener,
}

impl PendingBind {
    pub async fn open(host: &str, port: u16) -> std::io::Result<Self> {
        let ln = TcpListener::bind(net::join_host_port(host, port)).await?;
        Ok(Self { port, ln })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.ln.local_addr()
    }

    pub fn start(
        self,
        session: Arc<Session>,
        context: String,
        notifier: ControlWriter,
        opts: BindOptions,
        relays: SharedRelays,
    ) -> BindListener {
        let (stop, stop_rx) = watch::channel(false);
        let (lost_tx, lost) = watch::channel(false);
        let port = self.port;
        let task = tokio::spawn(accept_loop(
            self.ln, port, session, context, notifier, opts, relays, stop_rx, lost_tx,
        ));
        BindListener {
            port,
            stop,
            lost,
            task,
        }
    }
}

/// Accepts public connections on a bound port for one session. Closing or
/// dropping it stops accepting; relays already running are left alone.
pub struct BindListener {
    port: u16,
    stop: watch::Sender<bool>,
    lost: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for BindListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindListener")
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl BindListener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Fires once the accept loop stops on its own, e.g. after a `NOTIFY`
    /// could not be written.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost.clone()
    }

    pub fn close(&self) {
        let _ = self.stop.send(true);
        self.task.abort();
    }
}

impl Drop for BindListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    ln: TcpListener,
    port: u16,
    session: Arc<Session>,
    context: String,
    notifier: ControlWriter,
    opts: BindOptions,
    relays: SharedRelays,
    mut stop: watch::Receiver<bool>,
    lost: watch::Sender<bool>,
) {
    tracing::info!(sid = %session.sid, uid = %session.uid, port, "tunnel: public listener started");
    loop {
        let (public, peer) = tokio::select! {
            _ = stop.changed() => break,
            res = ln.accept() => match res {
                Ok(v) => v,
                Err(err) => {
                    tracing::warn!(sid = %session.sid, port, err = %err, "tunnel: public accept failed");
                    time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let Some(slot) = session.pairing().reserve() else {
            tracing::warn!(
                sid = %session.sid,
                port,
                peer = %peer,
                "tunnel: pairing queue full or closed; dropping public connection"
            );
            continue;
        };

        let ticket = DataConnTicket::new(context.as_str(), Some(slot.id()));
        let sent = match Frame::notify(&ticket) {
            Ok(frame) => notifier.send(&frame).await,
            Err(err) => Err(err),
        };
        if let Err(err) = sent {
            session.pairing().cancel(slot.id());
            tracing::warn!(sid = %session.sid, port, err = %err, "tunnel: notify failed; stopping public listener");
            let _ = lost.send(true);
            break;
        }
        tracing::debug!(sid = %session.sid, port, peer = %peer, pairing_id = slot.id(), "tunnel: client notified");

        let session = session.clone();
        let opts = opts.clone();
        let relays = relays.clone();
        tokio::spawn(async move {
            pair_and_relay(public, peer, port, slot, session, opts, relays).await;
        });
    }
    tracing::info!(sid = %session.sid, port, "tunnel: public listener stopped");
}

async fn pair_and_relay(
    public: TcpStream,
    peer: SocketAddr,
    port: u16,
    slot: PairingSlot<TcpStream>,
    session: Arc<Session>,
    opts: BindOptions,
    relays: SharedRelays,
) {
    let pairing_id = slot.id();
    match slot.wait(session.pairing(), opts.pairing_timeout).await {
        SlotOutcome::Paired(data) => {
            let info = RelayInfo::new(session.sid.as_str(), RelaySide::Server, port, peer.to_string());
            relay::run(public, data, info, opts.buffer_size, &relays).await;
        }
        SlotOutcome::TimedOut => {
            metrics::counter!("narwhal_pairing_timeouts_total").increment(1);
            tracing::warn!(
                sid = %session.sid,
                port,
                peer = %peer,
                pairing_id,
                timeout = %humantime::format_duration(opts.pairing_timeout),
                "tunnel: no data connection in time; closing public connection"
            );
        }
        SlotOutcome::Closed => {
            tracing::debug!(sid = %session.sid, port, peer = %peer, "tunnel: session gone; closing public connection");
        }
    }
}
