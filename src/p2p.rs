// src/p2p.rs

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bounded per-peer outbound queue. A peer that cannot drain this many
/// envelopes is considered slow and gets evicted.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 32;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    Tx = 0,
    Block = 1,
    Consensus = 2,
    Ping = 3,
    Pong = 4,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(MessageType::Tx),
            1 => Ok(MessageType::Block),
            2 => Ok(MessageType::Consensus),
            3 => Ok(MessageType::Ping),
            4 => Ok(MessageType::Pong),
            other => Err(format!("unknown message type {other}")),
        }
    }
}

/// Typed peer message. `peer_id`, when set, names the origin peer so that
/// re-broadcasts can skip it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
    #[serde(rename = "peer_id", default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

impl Envelope {
    pub fn new(msg_type: MessageType, payload: Vec<u8>, peer_id: Option<String>) -> Self {
        Self { msg_type, payload, peer_id }
    }
}

#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub id: String,
    pub addr: String,
}

pub type HandlerFn = Arc<dyn Fn(PeerInfo, Vec<u8>) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub listen_addr: String,
    pub seeds: Vec<String>,
    /// 0 means unlimited.
    pub max_peers: usize,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            seeds: Vec::new(),
            max_peers: 0,
            handshake_timeout: Duration::from_secs(5),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

struct PeerHandle {
    info: PeerInfo,
    outbound: mpsc::Sender<Envelope>,
}

/// TCP mesh transport: one listener, one dialer per configured seed, and a
/// reader/writer task pair per established connection. Messages are
/// u32-length-prefixed JSON envelopes. Handlers run on the reader task and
/// must not block.
pub struct PeerTransport {
    cfg: TransportConfig,
    peers: Mutex<HashMap<String, PeerHandle>>,
    handlers: RwLock<HashMap<MessageType, HandlerFn>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl PeerTransport {
    pub fn new(cfg: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            peers: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        })
    }

    /// Bind the listener and begin accepting and dialing. Bind failures are
    /// returned so startup can abort.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.cfg.listen_addr)
            .await
            .with_context(|| format!("bind p2p listener on {}", self.cfg.listen_addr))?;
        let bound = listener.local_addr().context("resolve p2p listen address")?;
        *self.local_addr.lock().expect("p2p addr poisoned") = Some(bound);
        info!(addr = %bound, "p2p listening");

        let accept = tokio::spawn(Arc::clone(self).accept_loop(listener));
        self.tasks.lock().expect("p2p tasks poisoned").push(accept);

        for seed in self.cfg.seeds.clone() {
            let dial = tokio::spawn(Arc::clone(self).dial_seed(seed));
            self.tasks.lock().expect("p2p tasks poisoned").push(dial);
        }
        Ok(())
    }

    /// The address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("p2p addr poisoned")
    }

    /// One handler per message type; registering again replaces the previous
    /// handler.
    pub fn register_handler<F>(&self, msg_type: MessageType, handler: F)
    where
        F: Fn(PeerInfo, Vec<u8>) + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .expect("p2p handlers poisoned")
            .insert(msg_type, Arc::new(handler));
    }

    /// Offer the envelope to every peer without blocking. Peers with a full
    /// outbound queue are evicted: the message always wins over the peer.
    pub fn broadcast(&self, env: &Envelope) {
        self.broadcast_inner(None, env);
    }

    /// Same as [`broadcast`](Self::broadcast), skipping `peer_id` (the
    /// origin of the message).
    pub fn broadcast_except(&self, peer_id: &str, env: &Envelope) {
        self.broadcast_inner(Some(peer_id), env);
    }

    fn broadcast_inner(&self, skip: Option<&str>, env: &Envelope) {
        let mut slow = Vec::new();
        {
            let peers = self.peers.lock().expect("p2p peers poisoned");
            for (id, peer) in peers.iter() {
                if skip == Some(id.as_str()) {
                    continue;
                }
                if env.peer_id.as_deref() == Some(id.as_str()) {
                    continue;
                }
                match peer.outbound.try_send(env.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => slow.push(id.clone()),
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        }
        for id in slow {
            warn!(peer = %id, "outbound queue full, dropping slow peer");
            self.remove_peer(&id);
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().expect("p2p peers poisoned").len()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.peers
            .lock()
            .expect("p2p peers poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Stop accepting, drop every peer. Reader/writer tasks unwind on their
    /// own once the outbound channels close.
    pub fn close(&self) {
        for task in self.tasks.lock().expect("p2p tasks poisoned").drain(..) {
            task.abort();
        }
        self.peers.lock().expect("p2p peers poisoned").clear();
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((socket, addr)) => self.install_peer(socket, addr.to_string()),
                Err(e) => {
                    warn!(error = %e, "p2p accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn dial_seed(self: Arc<Self>, target: String) {
        loop {
            let attempt =
                tokio::time::timeout(self.cfg.handshake_timeout, TcpStream::connect(&target)).await;
            match attempt {
                Ok(Ok(socket)) => {
                    let id = socket
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| target.clone());
                    self.install_peer(socket, id);
                    return;
                }
                Ok(Err(e)) => debug!(seed = %target, error = %e, "seed dial failed, retrying"),
                Err(_) => debug!(seed = %target, "seed dial timed out, retrying"),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn install_peer(self: &Arc<Self>, socket: TcpStream, id: String) {
        {
            let mut peers = self.peers.lock().expect("p2p peers poisoned");
            if self.cfg.max_peers > 0 && peers.len() >= self.cfg.max_peers {
                debug!(peer = %id, "peer cap reached, refusing connection");
                return;
            }
            let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
            let info = PeerInfo { id: id.clone(), addr: id.clone() };
            let (read_half, write_half) = socket.into_split();
            peers.insert(id.clone(), PeerHandle { info: info.clone(), outbound });
            tokio::spawn(Arc::clone(self).read_loop(info, read_half));
            tokio::spawn(Arc::clone(self).write_loop(id.clone(), write_half, rx));
        }
        info!(peer = %id, "peer connected");
    }

    async fn read_loop(self: Arc<Self>, info: PeerInfo, mut read: OwnedReadHalf) {
        loop {
            let frame = match read_frame(&mut read, self.cfg.max_frame_bytes).await {
                Ok(frame) => frame,
                Err(_) => break, // EOF or socket error
            };
            match serde_json::from_slice::<Envelope>(&frame) {
                Ok(env) => self.dispatch(&info, env),
                Err(e) => {
                    debug!(peer = %info.id, error = %e, "envelope decode failed, dropping peer");
                    break;
                }
            }
        }
        self.remove_peer(&info.id);
    }

    async fn write_loop(
        self: Arc<Self>,
        id: String,
        mut write: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Envelope>,
    ) {
        while let Some(env) = rx.recv().await {
            let frame = match serde_json::to_vec(&env) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(peer = %id, error = %e, "envelope encode failed");
                    break;
                }
            };
            if write_frame(&mut write, &frame).await.is_err() {
                break;
            }
        }
        let _ = write.shutdown().await;
        self.remove_peer(&id);
    }

    // Handlers run inline on the reader task; they enqueue work and return.
    fn dispatch(&self, info: &PeerInfo, env: Envelope) {
        let handler = self
            .handlers
            .read()
            .expect("p2p handlers poisoned")
            .get(&env.msg_type)
            .cloned();
        if let Some(handler) = handler {
            handler(info.clone(), env.payload);
        }
    }

    fn remove_peer(&self, id: &str) {
        let removed = self.peers.lock().expect("p2p peers poisoned").remove(id);
        if let Some(peer) = removed {
            info!(peer = %peer.info.addr, "peer removed");
        }
        // Dropping the handle closes the outbound channel: the writer then
        // shuts the socket down and the reader unblocks with an error.
    }
}

async fn read_frame(read: &mut OwnedReadHalf, max: usize) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    read.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds cap of {max}"),
        ));
    }
    let mut buf = vec![0u8; len];
    read.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(write: &mut OwnedWriteHalf, frame: &[u8]) -> io::Result<()> {
    write.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    write.write_all(frame).await
}
