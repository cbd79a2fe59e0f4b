//! UDP-broadcast peer discovery.
//!
//! Each instance announces `kind|id|port|version` to
//! 255.255.255.255:19000 every second and listens on port 19000 for
//! announcements from peers of the same kind. Messages are
//! best-effort: unordered, possibly duplicated, possibly lost.
//!
//! The receive socket is opened with address/port reuse so several
//! instances can coexist on one host.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::DeskError;

/// Well-known discovery port.
pub const DISCOVERY_PORT: u16 = 19000;
/// Cadence of presence announcements.
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(1000);

// ── Types ────────────────────────────────────────────────────────

/// Discovery service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Application tag; only peers with the same kind are reported.
    pub kind: String,
    /// The service port advertised to peers.
    pub advertised_port: u16,
    /// Free-form version string.
    pub version: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            kind: "remote-desk".into(),
            advertised_port: 0,
            version: "1.0.0".into(),
        }
    }
}

/// One discovered peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryInfo {
    pub kind: String,
    pub id: String,
    /// Observed source address of the announcement.
    pub ip: String,
    pub port: u16,
    pub version: String,
}

/// Receives peer announcements. Held weakly by the service: when the
/// owner drops the listener, notifications stop silently.
pub trait DiscoveryListener: Send + Sync {
    fn on_found(&self, info: &DiscoveryInfo);
}

// ── DiscoveryService ─────────────────────────────────────────────

struct Shared {
    kind: String,
    id: String,
    version: String,
    advertised_port: u16,
    broadcast_addr: SocketAddr,
    listener: Mutex<Weak<dyn DiscoveryListener>>,
}

/// Announce/listen worker with an `Idle → Running → Idle` lifecycle.
pub struct DiscoveryService {
    shared: Arc<Shared>,
    token: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl DiscoveryService {
    /// Create a service with a fresh random 32-bit identity.
    pub fn new(config: DiscoveryConfig) -> Self {
        let id = rand::random::<u32>().to_string();
        debug!(kind = %config.kind, id = %id, "discovery service created");
        Self {
            shared: Arc::new(Shared {
                kind: config.kind,
                id,
                version: config.version,
                advertised_port: config.advertised_port,
                broadcast_addr: SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
                listener: Mutex::new(empty_listener()),
            }),
            token: Mutex::new(None),
            worker: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the announcement destination (loopback in tests).
    pub fn with_broadcast_addr(mut self, addr: SocketAddr) -> Self {
        let shared = Arc::get_mut(&mut self.shared).expect("service not yet shared");
        shared.broadcast_addr = addr;
        self
    }

    /// This instance's wire identity.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Register the listener. Held weakly — keep the `Arc` alive for
    /// as long as notifications are wanted.
    pub fn set_listener(&self, listener: &Arc<dyn DiscoveryListener>) {
        *self.shared.listener.lock().expect("listener poisoned") = Arc::downgrade(listener);
    }

    /// Spawn the worker. Must be called within a tokio runtime.
    /// Idempotent: returns `true` when already running.
    pub fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return true;
        }

        let token = CancellationToken::new();
        let worker_token = token.clone();
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);

        let handle = tokio::spawn(async move {
            if let Err(e) = discovery_loop(shared, worker_token).await {
                error!(error = %e, "discovery worker failed");
            }
            running.store(false, Ordering::SeqCst);
        });

        *self.token.lock().expect("token poisoned") = Some(token);
        *self.worker.lock().expect("worker poisoned") = Some(handle);
        true
    }

    /// Signal the worker and wait for it to exit.
    pub async fn stop(&self) {
        let token = self.token.lock().expect("token poisoned").take();
        if let Some(token) = token {
            token.cancel();
        }

        let handle = self.worker.lock().expect("worker poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        // Cooperative cancellation; the task notices on its next poll.
        if let Some(token) = self.token.lock().expect("token poisoned").take() {
            token.cancel();
        }
    }
}

/// Placeholder target for the initial empty `Weak`.
struct NullListener;
impl DiscoveryListener for NullListener {
    fn on_found(&self, _info: &DiscoveryInfo) {}
}

fn empty_listener() -> Weak<dyn DiscoveryListener> {
    Weak::<NullListener>::new()
}

// ── Worker ───────────────────────────────────────────────────────

/// Bind the shared receive port with address/port reuse.
fn bind_receive_socket() -> Result<UdpSocket, DeskError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)).into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

async fn discovery_loop(shared: Arc<Shared>, token: CancellationToken) -> Result<(), DeskError> {
    let recv_socket = bind_receive_socket().map_err(|e| {
        error!(error = %e, port = DISCOVERY_PORT, "failed to bind discovery receive socket");
        e
    })?;

    let send_socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    send_socket.set_broadcast(true)?;

    let announcement = format!(
        "{}|{}|{}|{}",
        shared.kind, shared.id, shared.advertised_port, shared.version
    );
    debug!(message = %announcement, target = %shared.broadcast_addr, "discovery loop started");

    let mut ticker = tokio::time::interval(BROADCAST_INTERVAL);
    let mut buf = [0u8; 512];

    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            _ = ticker.tick() => {
                if let Err(e) = send_socket
                    .send_to(announcement.as_bytes(), shared.broadcast_addr)
                    .await
                {
                    warn!(error = %e, "discovery broadcast failed");
                }
            }

            result = recv_socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, from)) => handle_datagram(&shared, &buf[..len], from),
                    Err(e) => warn!(error = %e, "discovery receive failed"),
                }
            }
        }
    }

    debug!("discovery loop ended");
    Ok(())
}

/// Parse one announcement and notify the listener when it is a new
/// peer of our kind.
fn handle_datagram(shared: &Shared, payload: &[u8], from: SocketAddr) {
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!(%from, "discovery datagram is not UTF-8");
        return;
    };

    let mut parts = text.splitn(4, '|');
    let (Some(kind), Some(id), Some(port), Some(version)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        warn!(%from, message = %text, "malformed discovery datagram");
        return;
    };

    let Ok(port) = port.parse::<u16>() else {
        warn!(%from, port, "discovery datagram has a bad port");
        return;
    };

    // Our own echo, or another application sharing the port.
    if id == shared.id || kind != shared.kind {
        return;
    }

    let info = DiscoveryInfo {
        kind: kind.to_string(),
        id: id.to_string(),
        ip: from.ip().to_string(),
        port,
        version: version.to_string(),
    };

    if let Some(listener) = shared.listener.lock().expect("listener poisoned").upgrade() {
        listener.on_found(&info);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        found: Mutex<Vec<DiscoveryInfo>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                found: Mutex::new(Vec::new()),
            })
        }

        fn found(&self) -> Vec<DiscoveryInfo> {
            self.found.lock().unwrap().clone()
        }
    }

    impl DiscoveryListener for Recorder {
        fn on_found(&self, info: &DiscoveryInfo) {
            self.found.lock().unwrap().push(info.clone());
        }
    }

    fn shared(kind: &str, id: &str) -> Shared {
        Shared {
            kind: kind.into(),
            id: id.into(),
            version: "1.0.0".into(),
            advertised_port: 9000,
            broadcast_addr: SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            listener: Mutex::new(empty_listener()),
        }
    }

    fn from_addr() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    #[test]
    fn parses_and_notifies() {
        let s = shared("remote-desk", "42");
        let recorder = Recorder::new();
        let listener: Arc<dyn DiscoveryListener> = recorder.clone();
        *s.listener.lock().unwrap() = Arc::downgrade(&listener);

        handle_datagram(&s, b"remote-desk|99|9002|2.1.0", from_addr());

        let found = recorder.found();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "99");
        assert_eq!(found[0].port, 9002);
        assert_eq!(found[0].ip, "127.0.0.1");
        assert_eq!(found[0].version, "2.1.0");
    }

    #[test]
    fn filters_self_and_other_kinds() {
        let s = shared("remote-desk", "42");
        let recorder = Recorder::new();
        let listener: Arc<dyn DiscoveryListener> = recorder.clone();
        *s.listener.lock().unwrap() = Arc::downgrade(&listener);

        handle_datagram(&s, b"remote-desk|42|9002|1.0.0", from_addr());
        handle_datagram(&s, b"other-app|7|9002|1.0.0", from_addr());

        assert!(recorder.found().is_empty());
    }

    #[test]
    fn tolerates_malformed_datagrams() {
        let s = shared("remote-desk", "42");
        let recorder = Recorder::new();
        let listener: Arc<dyn DiscoveryListener> = recorder.clone();
        *s.listener.lock().unwrap() = Arc::downgrade(&listener);

        handle_datagram(&s, b"", from_addr());
        handle_datagram(&s, b"remote-desk|99", from_addr());
        handle_datagram(&s, b"remote-desk|99|not-a-port|1.0", from_addr());
        handle_datagram(&s, &[0xFF, 0xFE, 0x80], from_addr());

        assert!(recorder.found().is_empty());
    }

    #[test]
    fn dropped_listener_is_ignored() {
        let s = shared("remote-desk", "42");
        {
            let recorder = Recorder::new();
            let listener: Arc<dyn DiscoveryListener> = recorder;
            *s.listener.lock().unwrap() = Arc::downgrade(&listener);
            // listener dropped here
        }
        handle_datagram(&s, b"remote-desk|99|9002|1.0.0", from_addr());
    }

    #[test]
    fn version_may_contain_separators() {
        let s = shared("remote-desk", "42");
        let recorder = Recorder::new();
        let listener: Arc<dyn DiscoveryListener> = recorder.clone();
        *s.listener.lock().unwrap() = Arc::downgrade(&listener);

        handle_datagram(&s, b"remote-desk|99|9002|1.0|beta", from_addr());
        assert_eq!(recorder.found()[0].version, "1.0|beta");
    }

    #[test]
    fn ids_are_random_per_instance() {
        let a = DiscoveryService::new(DiscoveryConfig::default());
        let b = DiscoveryService::new(DiscoveryConfig::default());
        assert_ne!(a.id(), b.id());
    }
}
