//! Framed TCP transport.
//!
//! Each connection carries two frame kinds: typed control messages
//! (kind byte `0x1`, then a u32 length prefix and a bincode body) and bulk
//! streams (kind byte `0x2`, length agreed out of band by a preceding
//! control message). Control messages are decoded by a per-peer read task
//! and delivered to a single shared inbound channel; stream frames park the
//! read task and hand the raw connection to the consumer until it calls
//! `close_stream`.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::errors::{ErrorKind, Result, VaultError};

/// Frame kind: a length-delimited typed message follows.
pub const INCOMING_MESSAGE: u8 = 0x1;
/// Frame kind: a bulk byte stream follows; its length is agreed out of band.
pub const INCOMING_STREAM: u8 = 0x2;

/// Upper bound on the length prefix of a control message.
const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

const INBOUND_CHANNEL_SIZE: usize = 1024;

/// A decoded control-plane frame, tagged with the sending peer's address.
#[derive(Debug, Clone)]
pub struct Rpc {
    pub from: String,
    pub payload: Vec<u8>,
    pub stream: bool,
}

/// Connection-level handshake, run once before any framing. The default
/// accepts every connection.
pub type HandshakeFn = fn(&TcpPeer) -> Result<()>;

pub fn nop_handshake(_peer: &TcpPeer) -> Result<()> {
    Ok(())
}

/// Invoked after the handshake for every new connection; returning an error
/// drops the connection.
pub type OnPeerFn = Arc<dyn Fn(Arc<dyn Peer>) -> Result<()> + Send + Sync>;

/// Invoked with the peer's address after its read task exits.
pub type OnPeerClosedFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Exclusive handle on a peer's read half while a stream frame is in flight.
/// Dropping it releases the connection back to the frame decoder once the
/// consumer calls [`Peer::close_stream`].
pub struct PeerStream {
    guard: OwnedMutexGuard<OwnedReadHalf>,
}

impl AsyncRead for PeerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().guard).poll_read(cx, buf)
    }
}

/// Capabilities of a connected remote node.
#[async_trait]
pub trait Peer: Send + Sync + std::fmt::Debug {
    fn remote_addr(&self) -> String;

    /// Write bytes verbatim to the connection. Callers are responsible for
    /// framing, starting with the kind byte.
    async fn send(&self, buf: &[u8]) -> Result<()>;

    /// Number of stream frames currently parked on this peer.
    fn streams_in_flight(&self) -> usize;

    /// Take the parked stream if one is pending, without waiting.
    fn take_stream(&self) -> Option<PeerStream>;

    /// Wait up to `wait` for a stream frame to arrive.
    async fn wait_stream(&self, wait: Duration) -> Result<PeerStream>;

    /// Release the connection back to the frame decoder after a stream has
    /// been fully consumed.
    fn close_stream(&self);
}

/// Capabilities of the node-to-node transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The address this transport listens on.
    fn addr(&self) -> String;

    /// Bind the listener and start accepting connections in the background.
    async fn listen_and_accept(&self) -> Result<()>;

    /// Open an outbound connection and run the same per-peer protocol on it.
    async fn dial(&self, addr: &str) -> Result<()>;

    /// Hand over the inbound message channel. There is exactly one consumer;
    /// subsequent calls return `None`.
    fn take_inbound(&self) -> Option<mpsc::Receiver<Rpc>>;

    /// Shut down the listener and all per-peer tasks.
    fn close(&self);
}

/// A TCP peer. The read half is owned by the frame-decoding task except while
/// a stream frame is parked; the write half is guarded by a mutex so
/// concurrent sends do not interleave.
#[derive(Debug)]
pub struct TcpPeer {
    remote: SocketAddr,
    outbound: bool,
    read_half: Arc<Mutex<OwnedReadHalf>>,
    write_half: Mutex<OwnedWriteHalf>,
    pending: StdMutex<Option<OwnedMutexGuard<OwnedReadHalf>>>,
    stream_ready: Notify,
    stream_done: Notify,
    in_flight: AtomicUsize,
    write_timeout: Duration,
}

impl TcpPeer {
    fn new(stream: TcpStream, outbound: bool, write_timeout: Duration) -> Result<Arc<Self>> {
        let remote = stream
            .peer_addr()
            .map_err(|e| VaultError::wrap(e, ErrorKind::Connection, "failed to resolve peer address"))?;
        let (read_half, write_half) = stream.into_split();
        Ok(Arc::new(Self {
            remote,
            outbound,
            read_half: Arc::new(Mutex::new(read_half)),
            write_half: Mutex::new(write_half),
            pending: StdMutex::new(None),
            stream_ready: Notify::new(),
            stream_done: Notify::new(),
            in_flight: AtomicUsize::new(0),
            write_timeout,
        }))
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    fn park_stream(&self, guard: OwnedMutexGuard<OwnedReadHalf>) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        *self.pending.lock().unwrap() = Some(guard);
        self.stream_ready.notify_one();
    }
}

#[async_trait]
impl Peer for TcpPeer {
    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }

    async fn send(&self, buf: &[u8]) -> Result<()> {
        let mut half = self.write_half.lock().await;
        let io = async {
            half.write_all(buf).await?;
            half.flush().await
        };
        if self.write_timeout.is_zero() {
            return io.await.map_err(|e| {
                VaultError::wrap(e, ErrorKind::Network, format!("failed to send to peer {}", self.remote))
            });
        }
        match tokio::time::timeout(self.write_timeout, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(VaultError::wrap(
                e,
                ErrorKind::Network,
                format!("failed to send to peer {}", self.remote),
            )),
            Err(_) => Err(VaultError::timeout(format!(
                "write to peer {} timed out",
                self.remote
            ))),
        }
    }

    fn streams_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn take_stream(&self) -> Option<PeerStream> {
        self.pending
            .lock()
            .unwrap()
            .take()
            .map(|guard| PeerStream { guard })
    }

    async fn wait_stream(&self, wait: Duration) -> Result<PeerStream> {
        let pending = async {
            loop {
                if let Some(stream) = self.take_stream() {
                    return stream;
                }
                self.stream_ready.notified().await;
            }
        };
        tokio::time::timeout(wait, pending).await.map_err(|_| {
            VaultError::timeout(format!("timed out waiting for stream from peer {}", self.remote))
        })
    }

    fn close_stream(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.stream_done.notify_one();
    }
}

#[derive(Clone)]
pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    /// Maximum concurrent connections; 0 means unlimited.
    pub max_connections: usize,
    /// Per-send write deadline; zero disables it.
    pub write_timeout: Duration,
}

impl Default for TcpTransportOpts {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            handshake: nop_handshake,
            max_connections: 100,
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// State shared between the transport handle, the accept loop, and the
/// per-peer tasks.
struct Shared {
    handshake: HandshakeFn,
    on_peer: StdMutex<Option<OnPeerFn>>,
    on_peer_closed: StdMutex<Option<OnPeerClosedFn>>,
    inbound_tx: mpsc::Sender<Rpc>,
    shutdown: CancellationToken,
    conn_count: AtomicUsize,
    max_connections: usize,
    write_timeout: Duration,
}

pub struct TcpTransport {
    opts: TcpTransportOpts,
    shared: Arc<Shared>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<Rpc>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let shared = Arc::new(Shared {
            handshake: opts.handshake,
            on_peer: StdMutex::new(None),
            on_peer_closed: StdMutex::new(None),
            inbound_tx,
            shutdown: CancellationToken::new(),
            conn_count: AtomicUsize::new(0),
            max_connections: opts.max_connections,
            write_timeout: opts.write_timeout,
        });
        Arc::new(Self {
            opts,
            shared,
            inbound_rx: StdMutex::new(Some(inbound_rx)),
            local_addr: StdMutex::new(None),
        })
    }

    pub fn set_on_peer(&self, f: OnPeerFn) {
        *self.shared.on_peer.lock().unwrap() = Some(f);
    }

    pub fn set_on_peer_closed(&self, f: OnPeerClosedFn) {
        *self.shared.on_peer_closed.lock().unwrap() = Some(f);
    }

    /// The bound socket address, once `listen_and_accept` has run.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn addr(&self) -> String {
        match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.opts.listen_addr.clone(),
        }
    }

    async fn listen_and_accept(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.opts.listen_addr).await.map_err(|e| {
            VaultError::wrap(
                e,
                ErrorKind::Network,
                format!("failed to bind listener on {}", self.opts.listen_addr),
            )
        })?;
        if let Ok(addr) = listener.local_addr() {
            *self.local_addr.lock().unwrap() = Some(addr);
        }
        tokio::spawn(run_accept_loop(self.shared.clone(), listener));
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<()> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            VaultError::wrap(e, ErrorKind::Connection, format!("failed to dial {addr}"))
        })?;
        tokio::spawn(handle_connection(self.shared.clone(), stream, true));
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Rpc>> {
        self.inbound_rx.lock().unwrap().take()
    }

    fn close(&self) {
        self.shared.shutdown.cancel();
    }
}

async fn run_accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    if let Ok(addr) = listener.local_addr() {
        info!("transport listening on {addr}");
    }
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shared.shutdown.cancelled() => {
                debug!("accept loop shutting down");
                return;
            }
        };
        match accepted {
            Ok((stream, addr)) => {
                if shared.max_connections > 0
                    && shared.conn_count.load(Ordering::SeqCst) >= shared.max_connections
                {
                    warn!("connection limit reached, refusing {addr}");
                    continue;
                }
                tokio::spawn(handle_connection(shared.clone(), stream, false));
            }
            Err(e) => {
                error!("accept error: {e}");
            }
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, outbound: bool) {
    shared.conn_count.fetch_add(1, Ordering::SeqCst);
    drive_connection(&shared, stream, outbound).await;
    shared.conn_count.fetch_sub(1, Ordering::SeqCst);
}

async fn drive_connection(shared: &Arc<Shared>, stream: TcpStream, outbound: bool) {
    let peer = match TcpPeer::new(stream, outbound, shared.write_timeout) {
        Ok(peer) => peer,
        Err(e) => {
            warn!("dropping connection: {e}");
            return;
        }
    };
    let addr = peer.remote_addr();

    if let Err(e) = (shared.handshake)(&peer) {
        warn!("handshake with {addr} failed: {e}");
        return;
    }

    let on_peer = shared.on_peer.lock().unwrap().clone();
    if let Some(on_peer) = on_peer {
        if let Err(e) = on_peer(peer.clone()) {
            warn!("peer {addr} rejected: {e}");
            return;
        }
    }

    read_frames(shared, &peer).await;
    debug!("read loop for peer {addr} exited");

    let on_peer_closed = shared.on_peer_closed.lock().unwrap().clone();
    if let Some(on_peer_closed) = on_peer_closed {
        on_peer_closed(&addr);
    }
}

/// Per-peer frame decoder. Control messages go to the inbound channel; a
/// stream frame parks the read half on the peer and blocks here until the
/// consumer acknowledges with `close_stream`, which keeps bulk bytes from
/// being interleaved with further frames.
async fn read_frames(shared: &Arc<Shared>, peer: &Arc<TcpPeer>) {
    let addr = peer.remote_addr();
    loop {
        let mut guard = tokio::select! {
            guard = Arc::clone(&peer.read_half).lock_owned() => guard,
            _ = shared.shutdown.cancelled() => return,
        };

        let kind = tokio::select! {
            kind = guard.read_u8() => match kind {
                Ok(kind) => kind,
                Err(e) => {
                    debug!("peer {addr} closed: {e}");
                    return;
                }
            },
            _ = shared.shutdown.cancelled() => return,
        };

        match kind {
            INCOMING_STREAM => {
                peer.park_stream(guard);
                tokio::select! {
                    _ = peer.stream_done.notified() => {}
                    _ = shared.shutdown.cancelled() => return,
                }
            }
            INCOMING_MESSAGE => {
                let len = match guard.read_u32_le().await {
                    Ok(len) => len,
                    Err(e) => {
                        debug!("peer {addr} closed mid-frame: {e}");
                        return;
                    }
                };
                if len > MAX_MESSAGE_SIZE {
                    warn!("oversized message ({len} bytes) from {addr}, dropping connection");
                    return;
                }
                let mut payload = vec![0u8; len as usize];
                if let Err(e) = guard.read_exact(&mut payload).await {
                    debug!("peer {addr} closed mid-frame: {e}");
                    return;
                }
                drop(guard);

                let rpc = Rpc {
                    from: addr.clone(),
                    payload,
                    stream: false,
                };
                if shared.inbound_tx.send(rpc).await.is_err() {
                    return;
                }
            }
            other => {
                warn!("unknown frame kind {other:#x} from {addr}, dropping connection");
                return;
            }
        }
    }
}
