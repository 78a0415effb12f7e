//! The file server: peer registry, replication, and the message loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::crypto::{self, hash_key};
use crate::errors::{ErrorKind, Result, VaultError};
use crate::message::{decode_message, encode_message, Message};
use crate::retry;
use crate::store::{cas_path_transform, Store, StoreOpts};
use crate::transport::{
    Peer, PeerStream, Rpc, TcpTransport, Transport, INCOMING_MESSAGE, INCOMING_STREAM,
};
use crate::{COPY_BUFFER_SIZE, ENCRYPTION_OVERHEAD, KEY_SIZE};

/// Pause between announcing a replication and pushing its bytes, so peers
/// reach the stream frame first.
const STREAM_HANDOFF_DELAY: Duration = Duration::from_millis(5);

/// Cooperative delay between broadcasting a `GetFile` and polling peers for
/// their responses.
const FETCH_RESPONSE_DELAY: Duration = Duration::from_millis(500);

/// Overall deadline on a single network fetch attempt.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FileServerOpts {
    /// Node id; generated from a random seed when empty.
    pub id: String,
    pub enc_key: [u8; KEY_SIZE],
    pub storage_root: PathBuf,
    pub bootstrap_nodes: Vec<String>,
    /// Bound on waiting for a peer's announced stream frame to arrive.
    pub read_timeout: Duration,
}

/// A storage node: owns the local store, the peer registry, and the message
/// loop draining the transport's inbound channel.
pub struct FileServer {
    id: String,
    enc_key: [u8; KEY_SIZE],
    read_timeout: Duration,
    bootstrap_nodes: Vec<String>,
    store: Store,
    transport: Arc<dyn Transport>,
    peers: Arc<StdMutex<HashMap<String, Arc<dyn Peer>>>>,
    inbound: StdMutex<Option<mpsc::Receiver<Rpc>>>,
    shutdown: CancellationToken,
}

impl FileServer {
    /// Build a server on top of `transport` and wire the peer registry to the
    /// transport's connect/disconnect callbacks.
    pub fn new(opts: FileServerOpts, transport: Arc<TcpTransport>) -> Arc<Self> {
        let id = if opts.id.is_empty() {
            crypto::generate_node_id()
        } else {
            opts.id
        };
        let store = Store::new(StoreOpts {
            root: opts.storage_root,
            path_transform: cas_path_transform,
        });

        let peers: Arc<StdMutex<HashMap<String, Arc<dyn Peer>>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let inbound = transport.take_inbound();

        let registry = peers.clone();
        transport.set_on_peer(Arc::new(move |peer| {
            let addr = peer.remote_addr();
            registry.lock().unwrap().insert(addr.clone(), peer);
            info!("connected with peer {addr}");
            Ok(())
        }));

        let registry = peers.clone();
        transport.set_on_peer_closed(Arc::new(move |addr| {
            registry.lock().unwrap().remove(addr);
            info!("peer {addr} disconnected");
        }));

        Arc::new(Self {
            id,
            enc_key: opts.enc_key,
            read_timeout: opts.read_timeout,
            bootstrap_nodes: opts.bootstrap_nodes,
            store,
            transport,
            peers,
            inbound: StdMutex::new(inbound),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> String {
        self.transport.addr()
    }

    pub fn store_root(&self) -> &std::path::Path {
        self.store.root()
    }

    /// Start listening, dial the bootstrap nodes, and run the message loop.
    /// Returns once the loop exits.
    pub async fn start(&self) -> Result<()> {
        info!("starting file server on {}", self.transport.addr());
        self.transport.listen_and_accept().await?;
        self.bootstrap();
        self.message_loop().await;
        Ok(())
    }

    /// Signal the message loop to quit. Infallible and idempotent.
    pub fn stop(&self) {
        info!("[{}] stopping file server", self.transport.addr());
        self.shutdown.cancel();
    }

    /// Store a blob locally and replicate it to every connected peer.
    pub async fn store<R>(&self, key: &str, r: &mut R) -> Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        info!("[{}] storing file: {key}", self.transport.addr());

        let mut plaintext = Vec::new();
        r.read_to_end(&mut plaintext)
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Storage, "failed to read input"))?;

        let size = self.store.write(&self.id, key, &mut &plaintext[..]).await?;
        debug!("file stored locally: {key} ({size} bytes)");

        let peers = self.peer_snapshot();
        if peers.is_empty() {
            warn!("no peers available for replication");
            return Ok(());
        }

        let msg = Message::StoreFile {
            node_id: self.id.clone(),
            hashed_key: hash_key(key),
            size: size as i64 + ENCRYPTION_OVERHEAD as i64,
        };
        if let Err(e) = self.broadcast_to(&peers, &msg).await {
            error!("failed to broadcast store message: {e}");
        }

        tokio::time::sleep(STREAM_HANDOFF_DELAY).await;
        self.replicate_to_peers(&plaintext, &peers).await
    }

    /// Fetch a blob: local plaintext first, then a locally held replica, then
    /// the network.
    pub async fn get(&self, key: &str) -> Result<(u64, tokio::fs::File)> {
        if self.store.has(&self.id, key) {
            info!("serving file ({key}) from local disk");
            return self.store.read(&self.id, key).await;
        }

        // A blob replicated to this node sits under the hashed key as
        // ciphertext; decrypt it into the plaintext slot once, then serve.
        let hashed_key = hash_key(key);
        if self.store.has(&self.id, &hashed_key) {
            info!("serving file ({key}) from local replica");
            let (_, mut ciphertext) = self.store.read(&self.id, &hashed_key).await?;
            self.store
                .write_decrypt(&self.enc_key, &self.id, key, &mut ciphertext)
                .await?;
            return self.store.read(&self.id, key).await;
        }

        info!("file ({key}) not found locally, fetching from network");
        retry::retry_simple(|| self.fetch_from_network(key))
            .await
            .map_err(|e| {
                VaultError::wrap(e, ErrorKind::Network, "failed to fetch file from network")
            })?;

        self.store.read(&self.id, key).await
    }

    fn peer_snapshot(&self) -> Vec<(String, Arc<dyn Peer>)> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, peer)| (addr.clone(), peer.clone()))
            .collect()
    }

    fn peer(&self, addr: &str) -> Result<Arc<dyn Peer>> {
        self.peers
            .lock()
            .unwrap()
            .get(addr)
            .cloned()
            .ok_or_else(|| VaultError::connection(format!("peer {addr} not found")))
    }

    /// Send one encoded control message to every peer in the snapshot. Only a
    /// total failure is an error; partial failures are logged.
    async fn broadcast_to(
        &self,
        peers: &[(String, Arc<dyn Peer>)],
        msg: &Message,
    ) -> Result<()> {
        let body = encode_message(msg)?;
        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(INCOMING_MESSAGE);
        frame.extend_from_slice(&body);

        debug!("broadcasting message to {} peers", peers.len());

        let mut success = 0usize;
        let mut last_err: Option<VaultError> = None;
        for (addr, peer) in peers {
            match peer.send(&frame).await {
                Ok(()) => success += 1,
                Err(e) => {
                    warn!("failed to send message to peer {addr}: {e}");
                    last_err = Some(e);
                }
            }
        }

        if success == 0 && !peers.is_empty() {
            return Err(match last_err {
                Some(e) => VaultError::wrap(e, ErrorKind::Network, "failed to broadcast to any peers"),
                None => VaultError::network("failed to broadcast to any peers"),
            });
        }
        if success < peers.len() {
            warn!("broadcast partially failed: {success}/{} peers reached", peers.len());
        } else {
            debug!("broadcast successful to all {success} peers");
        }
        Ok(())
    }

    /// Push one shared ciphertext of `plaintext` to every peer as a stream
    /// frame.
    async fn replicate_to_peers(
        &self,
        plaintext: &[u8],
        peers: &[(String, Arc<dyn Peer>)],
    ) -> Result<()> {
        let mut frame = Vec::with_capacity(1 + plaintext.len() + ENCRYPTION_OVERHEAD);
        frame.push(INCOMING_STREAM);
        crypto::copy_encrypt(&self.enc_key, &mut &plaintext[..], &mut frame).await?;

        let mut success = 0usize;
        let mut last_err: Option<VaultError> = None;
        for (addr, peer) in peers {
            match peer.send(&frame).await {
                Ok(()) => success += 1,
                Err(e) => {
                    warn!("failed to replicate to peer {addr}: {e}");
                    last_err = Some(e);
                }
            }
        }

        if success == 0 && !peers.is_empty() {
            return Err(match last_err {
                Some(e) => VaultError::wrap(e, ErrorKind::Network, "failed to replicate to any peers"),
                None => VaultError::network("failed to replicate to any peers"),
            });
        }
        info!(
            "file replicated to {success}/{} peers ({} bytes)",
            peers.len(),
            frame.len() - 1
        );
        Ok(())
    }

    /// One fetch attempt: announce interest, give peers a beat to respond,
    /// then take the first parked response stream that decodes cleanly.
    async fn fetch_from_network(&self, key: &str) -> Result<()> {
        let peers = self.peer_snapshot();
        if peers.is_empty() {
            return Err(VaultError::network("no peers available for file retrieval"));
        }

        let msg = Message::GetFile {
            node_id: self.id.clone(),
            hashed_key: hash_key(key),
        };
        self.broadcast_to(&peers, &msg).await?;

        let fetch = async {
            tokio::time::sleep(FETCH_RESPONSE_DELAY).await;

            let mut last_err: Option<VaultError> = None;
            for (addr, peer) in &peers {
                let Some(stream) = peer.take_stream() else {
                    debug!("no response from peer {addr}");
                    continue;
                };
                let result = self.ingest_fetched_blob(key, stream).await;
                peer.close_stream();
                match result {
                    Ok(n) => {
                        info!("received {n} bytes from peer {addr}");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!("failed to read file from peer {addr}: {e}");
                        last_err = Some(e);
                    }
                }
            }
            Err(last_err
                .unwrap_or_else(|| VaultError::network("no peers provided the requested file")))
        };

        match tokio::time::timeout(FETCH_TIMEOUT, fetch).await {
            Ok(result) => result,
            Err(_) => Err(VaultError::timeout("timeout waiting for file from network")),
        }
    }

    /// Read a `GetFile` response off a parked stream: a little-endian i64
    /// ciphertext size, then exactly that many bytes decrypted into the
    /// plaintext slot for `key`.
    async fn ingest_fetched_blob(&self, key: &str, mut stream: PeerStream) -> Result<u64> {
        let mut size_buf = [0u8; 8];
        stream
            .read_exact(&mut size_buf)
            .await
            .map_err(|e| VaultError::wrap(e, ErrorKind::Network, "failed to read file size"))?;
        let file_size = i64::from_le_bytes(size_buf);
        if file_size < 0 {
            return Err(VaultError::corruption("negative file size in fetch response"));
        }

        let mut limited = stream.take(file_size as u64);
        self.store
            .write_decrypt(&self.enc_key, &self.id, key, &mut limited)
            .await
    }

    async fn message_loop(&self) {
        let mut inbound = match self.inbound.lock().unwrap().take() {
            Some(rx) => rx,
            None => {
                error!("transport inbound channel already consumed");
                return;
            }
        };

        info!("[{}] message loop running", self.transport.addr());
        loop {
            tokio::select! {
                rpc = inbound.recv() => {
                    let Some(rpc) = rpc else {
                        debug!("inbound channel closed");
                        break;
                    };
                    let msg = match decode_message(&rpc.payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            error!("failed to decode message from {}: {e}", rpc.from);
                            continue;
                        }
                    };
                    if let Err(e) = self.handle_message(&rpc.from, msg).await {
                        error!("failed to handle message from {}: {e}", rpc.from);
                    }
                }
                _ = self.shutdown.cancelled() => {
                    debug!("received quit signal");
                    break;
                }
            }
        }

        info!("[{}] file server stopped", self.transport.addr());
        self.transport.close();
    }

    async fn handle_message(&self, from: &str, msg: Message) -> Result<()> {
        match msg {
            Message::StoreFile {
                node_id,
                hashed_key,
                size,
            } => {
                debug!("handling store file message from {from}");
                self.handle_store_file(from, &node_id, &hashed_key, size).await
            }
            Message::GetFile { hashed_key, .. } => {
                debug!("handling get file message from {from}");
                self.handle_get_file(from, &hashed_key).await
            }
        }
    }

    /// A peer is pushing `size` ciphertext bytes for `hashed_key`; copy them
    /// to disk as-is. Decryption happens on the read side.
    async fn handle_store_file(
        &self,
        from: &str,
        origin: &str,
        hashed_key: &str,
        size: i64,
    ) -> Result<()> {
        let peer = self.peer(from)?;
        debug!("receiving file from peer {from} (origin {origin}): {hashed_key} ({size} bytes)");
        if size < 0 {
            return Err(VaultError::invalid_input("negative replication size"));
        }

        let stream = peer.wait_stream(self.read_timeout).await?;
        let mut limited = stream.take(size as u64);
        let result = self.store.write(&self.id, hashed_key, &mut limited).await;
        drop(limited);
        peer.close_stream();

        let n = result?;
        info!("stored file from peer {from}: {hashed_key} ({n} bytes)");
        Ok(())
    }

    /// A peer wants `hashed_key`; if this node holds a replica, answer with a
    /// size-prefixed stream frame. Nothing is written on a miss.
    async fn handle_get_file(&self, from: &str, hashed_key: &str) -> Result<()> {
        if !self.store.has(&self.id, hashed_key) {
            debug!("file not found for peer {from}: {hashed_key}");
            return Err(VaultError::file_not_found(hashed_key));
        }

        info!("serving file ({hashed_key}) to peer {from}");
        let (file_size, mut file) = self.store.read(&self.id, hashed_key).await?;
        let peer = self.peer(from)?;

        let mut header = Vec::with_capacity(1 + 8);
        header.push(INCOMING_STREAM);
        header.extend_from_slice(&(file_size as i64).to_le_bytes());
        peer.send(&header).await?;

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut sent = 0u64;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| VaultError::wrap(e, ErrorKind::Storage, "failed to read blob"))?;
            if n == 0 {
                break;
            }
            peer.send(&buf[..n]).await?;
            sent += n as u64;
        }

        info!("sent file ({hashed_key}) to peer {from}: {sent} bytes");
        Ok(())
    }

    fn bootstrap(&self) {
        if self.bootstrap_nodes.is_empty() {
            info!("no bootstrap nodes configured");
            return;
        }

        info!("bootstrapping network with {} nodes", self.bootstrap_nodes.len());
        for addr in self.bootstrap_nodes.clone() {
            if addr.is_empty() {
                continue;
            }
            let transport = self.transport.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                info!("attempting to connect to bootstrap node {addr}");
                let dialed = retry::retry(&shutdown, &retry::RetryConfig::default(), || {
                    let transport = transport.clone();
                    let addr = addr.clone();
                    async move { transport.dial(&addr).await }
                })
                .await;
                match dialed {
                    Ok(()) => info!("connected to bootstrap node {addr}"),
                    Err(e) => error!("failed to connect to bootstrap node {addr}: {e}"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpTransportOpts;
    use tempfile::TempDir;

    fn test_server(dir: &TempDir) -> Arc<FileServer> {
        let transport = TcpTransport::new(TcpTransportOpts {
            listen_addr: "127.0.0.1:0".to_string(),
            ..TcpTransportOpts::default()
        });
        FileServer::new(
            FileServerOpts {
                id: String::new(),
                enc_key: crypto::new_encryption_key(),
                storage_root: dir.path().to_path_buf(),
                bootstrap_nodes: Vec::new(),
                read_timeout: Duration::from_secs(5),
            },
            transport,
        )
    }

    #[tokio::test]
    async fn empty_id_is_generated() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);
        assert_eq!(server.id().len(), 40);
    }

    #[tokio::test]
    async fn missing_peer_is_a_connection_error() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);
        let err = server.peer("10.0.0.1:9999").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn store_without_peers_keeps_the_local_copy() {
        let dir = TempDir::new().unwrap();
        let server = test_server(&dir);
        server.store("lonely.txt", &mut &b"no one to talk to"[..]).await.unwrap();

        let (size, _) = server.get("lonely.txt").await.unwrap();
        assert_eq!(size, 17);
    }
}
