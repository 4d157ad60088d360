//! Single-port peer listener shared by all transfers
//!
//! The listener owns one TCP port chosen from a configured range. Incoming
//! connections are routed to a transfer by the info hash in the first 48
//! bytes of the peer handshake. Transfers register to receive connections for
//! their hash and reserve the port they report to trackers. A reserved port
//! stays open after the listener moves to a new port, until the last
//! reservation for it is dropped.
//!
//! ## Handshake prefix
//!
//! ```text
//! [1 byte: 19] [19 bytes: "BitTorrent protocol"] [8 bytes: reserved] [20 bytes: info hash]
//! ```

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use swarm_common::{HANDSHAKE_PREFIX_LEN, InfoHash, PROTOCOL_NAME};

use crate::constants::LISTEN_BACKLOG;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("could not bind any port in {min}-{max}: {source}")]
    Bind {
        min: u16,
        max: u16,
        #[source]
        source: io::Error,
    },

    #[error("not listening on any port")]
    NotListening,

    #[error("transfer {0} is already registered with the listener")]
    AlreadyRegistered(InfoHash),
}

/// Connection accepted for a transfer, with its handshake prefix consumed
#[derive(Debug)]
pub struct IncomingPeer {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub prefix: [u8; HANDSHAKE_PREFIX_LEN],
}

type Routes = Arc<Mutex<HashMap<InfoHash, mpsc::UnboundedSender<IncomingPeer>>>>;

struct BoundPort {
    reservations: usize,
    accept_task: JoinHandle<()>,
}

#[derive(Default)]
struct PortTable {
    current: Option<u16>,
    ports: HashMap<u16, BoundPort>,
}

impl PortTable {
    /// Stop accepting on `port` if it is neither current nor reserved
    fn close_if_unused(&mut self, port: u16) {
        if self.current == Some(port) {
            return;
        }
        if !self.ports.get(&port).is_some_and(|bound| bound.reservations == 0) {
            return;
        }
        if let Some(bound) = self.ports.remove(&port) {
            bound.accept_task.abort();
            debug!(port, "closed listen port");
        }
    }
}

pub struct Listener {
    bind: IpAddr,
    handshake_timeout: Duration,
    routes: Routes,
    ports: Arc<Mutex<PortTable>>,
}

impl Listener {
    /// Unbound listener; call [`Listener::open_port`] to start accepting
    pub fn new(bind: IpAddr, handshake_timeout: Duration) -> Self {
        Self {
            bind,
            handshake_timeout,
            routes: Arc::new(Mutex::new(HashMap::new())),
            ports: Arc::new(Mutex::new(PortTable::default())),
        }
    }

    /// Listen on the first free port in `min..=max`
    ///
    /// Keeps the current port when it already falls inside the range. The
    /// previous port closes unless a transfer still reserves it.
    ///
    /// # Returns
    /// * `Ok(port)` - The port now accepting connections
    /// * `Err(ListenerError::Bind)` - No port in the range could be bound
    pub fn open_port(&self, min: u16, max: u16) -> Result<u16, ListenerError> {
        let mut ports = self.ports.lock().expect("listener lock poisoned");
        if let Some(current) = ports.current.filter(|port| (min..=max).contains(port)) {
            return Ok(current);
        }

        let mut last_error = io::Error::new(io::ErrorKind::AddrNotAvailable, "empty port range");
        for port in min..=max {
            if ports.ports.contains_key(&port) {
                // Still open for a reservation; reuse it
                return Ok(Self::make_current(&mut ports, port));
            }
            match bind_port(self.bind, port) {
                Ok(listener) => {
                    let accept_task = tokio::spawn(accept_loop(
                        listener,
                        self.routes.clone(),
                        self.handshake_timeout,
                    ));
                    ports.ports.insert(
                        port,
                        BoundPort {
                            reservations: 0,
                            accept_task,
                        },
                    );
                    info!(port, bind = %self.bind, "listening for peers");
                    return Ok(Self::make_current(&mut ports, port));
                }
                Err(err) => {
                    debug!(port, error = %err, "port unavailable");
                    last_error = err;
                }
            }
        }
        Err(ListenerError::Bind {
            min,
            max,
            source: last_error,
        })
    }

    fn make_current(ports: &mut PortTable, port: u16) -> u16 {
        if let Some(previous) = ports.current.replace(port).filter(|&previous| previous != port) {
            ports.close_if_unused(previous);
        }
        port
    }

    pub fn current_port(&self) -> Option<u16> {
        self.ports.lock().expect("listener lock poisoned").current
    }

    /// Ports with an accept loop running, current or reserved
    pub fn open_ports(&self) -> Vec<u16> {
        let ports = self.ports.lock().expect("listener lock poisoned");
        let mut open: Vec<u16> = ports.ports.keys().copied().collect();
        open.sort_unstable();
        open
    }

    /// Keep the current port open while the reservation lives
    pub fn reserve_port(&self) -> Result<PortReservation, ListenerError> {
        let mut ports = self.ports.lock().expect("listener lock poisoned");
        let port = ports.current.ok_or(ListenerError::NotListening)?;
        if let Some(bound) = ports.ports.get_mut(&port) {
            bound.reservations += 1;
        }
        Ok(PortReservation {
            port,
            ports: self.ports.clone(),
        })
    }

    /// Route connections for `info_hash` to the returned registration
    pub fn register(&self, info_hash: InfoHash) -> Result<ListenerRegistration, ListenerError> {
        let mut routes = self.routes.lock().expect("listener lock poisoned");
        if routes.contains_key(&info_hash) {
            return Err(ListenerError::AlreadyRegistered(info_hash));
        }
        let (tx, incoming) = mpsc::unbounded_channel();
        routes.insert(info_hash, tx);
        Ok(ListenerRegistration {
            info_hash,
            routes: self.routes.clone(),
            incoming,
        })
    }

    pub fn is_registered(&self, info_hash: &InfoHash) -> bool {
        self.routes
            .lock()
            .expect("listener lock poisoned")
            .contains_key(info_hash)
    }

    /// Stop accepting on every port
    pub fn close(&self) {
        let mut ports = self.ports.lock().expect("listener lock poisoned");
        for (port, bound) in ports.ports.drain() {
            bound.accept_task.abort();
            debug!(port, "closed listen port");
        }
        ports.current = None;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

/// Claim that keeps a port accepting connections
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    ports: Arc<Mutex<PortTable>>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        let mut ports = self.ports.lock().expect("listener lock poisoned");
        if let Some(bound) = ports.ports.get_mut(&self.port) {
            bound.reservations = bound.reservations.saturating_sub(1);
        }
        ports.close_if_unused(self.port);
    }
}

impl std::fmt::Debug for PortTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortTable")
            .field("current", &self.current)
            .field("open", &self.ports.len())
            .finish()
    }
}

/// A transfer's route in the listener; dropping it stops delivery
pub struct ListenerRegistration {
    info_hash: InfoHash,
    routes: Routes,
    incoming: mpsc::UnboundedReceiver<IncomingPeer>,
}

impl ListenerRegistration {
    /// Next connection routed to this transfer
    pub async fn accept(&mut self) -> Option<IncomingPeer> {
        self.incoming.recv().await
    }

    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.routes
            .lock()
            .expect("listener lock poisoned")
            .remove(&self.info_hash);
    }
}

/// Extract the info hash from a handshake prefix
///
/// Returns `None` if the prefix does not name the expected protocol.
pub fn parse_handshake_prefix(prefix: &[u8; HANDSHAKE_PREFIX_LEN]) -> Option<InfoHash> {
    let name_len = PROTOCOL_NAME.len();
    if prefix[0] as usize != name_len || &prefix[1..=name_len] != PROTOCOL_NAME {
        return None;
    }
    InfoHash::from_slice(&prefix[HANDSHAKE_PREFIX_LEN - 20..])
}

/// Bind with SO_REUSEADDR so a restarted daemon can reclaim its port
fn bind_port(bind: IpAddr, port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::new(bind, port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

async fn accept_loop(listener: TcpListener, routes: Routes, handshake_timeout: Duration) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(route_connection(
                    stream,
                    addr,
                    routes.clone(),
                    handshake_timeout,
                ));
            }
            Err(err) => {
                warn!(error = %err, "failed to accept peer connection");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn route_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    routes: Routes,
    handshake_timeout: Duration,
) {
    let mut prefix = [0u8; HANDSHAKE_PREFIX_LEN];
    match tokio::time::timeout(handshake_timeout, stream.read_exact(&mut prefix)).await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            debug!(peer = %addr, error = %err, "peer closed before handshake");
            return;
        }
        Err(_) => {
            debug!(peer = %addr, "handshake timed out");
            return;
        }
    }

    let Some(info_hash) = parse_handshake_prefix(&prefix) else {
        debug!(peer = %addr, "dropping connection with unknown protocol");
        return;
    };

    let route = routes
        .lock()
        .expect("listener lock poisoned")
        .get(&info_hash)
        .cloned();
    match route {
        Some(tx) => {
            if tx.send(IncomingPeer { stream, addr, prefix }).is_err() {
                debug!(peer = %addr, %info_hash, "transfer stopped accepting");
            }
        }
        None => debug!(peer = %addr, %info_hash, "no transfer for info hash"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn handshake(hash: &InfoHash) -> [u8; HANDSHAKE_PREFIX_LEN] {
        let mut prefix = [0u8; HANDSHAKE_PREFIX_LEN];
        prefix[0] = PROTOCOL_NAME.len() as u8;
        prefix[1..20].copy_from_slice(PROTOCOL_NAME);
        prefix[28..].copy_from_slice(hash.as_bytes());
        prefix
    }

    /// A port that was free a moment ago
    fn free_port() -> u16 {
        std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    // ==========================================================================
    // Handshake parsing
    // ==========================================================================

    #[test]
    fn test_parse_handshake_prefix() {
        let hash = InfoHash::new([9; 20]);
        assert_eq!(parse_handshake_prefix(&handshake(&hash)), Some(hash));
    }

    #[test]
    fn test_parse_handshake_rejects_other_protocols() {
        let mut prefix = handshake(&InfoHash::new([9; 20]));
        prefix[0] = 18;
        assert_eq!(parse_handshake_prefix(&prefix), None);

        let mut prefix = handshake(&InfoHash::new([9; 20]));
        prefix[5] = b'X';
        assert_eq!(parse_handshake_prefix(&prefix), None);
    }

    // ==========================================================================
    // Registration
    // ==========================================================================

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let listener = Listener::new(LOCALHOST, Duration::from_secs(1));
        let hash = InfoHash::new([1; 20]);
        let registration = listener.register(hash).unwrap();
        assert!(matches!(
            listener.register(hash),
            Err(ListenerError::AlreadyRegistered(_))
        ));

        drop(registration);
        assert!(!listener.is_registered(&hash));
        assert!(listener.register(hash).is_ok());
    }

    #[tokio::test]
    async fn test_reserve_without_port_fails() {
        let listener = Listener::new(LOCALHOST, Duration::from_secs(1));
        assert!(matches!(
            listener.reserve_port(),
            Err(ListenerError::NotListening)
        ));
    }

    // ==========================================================================
    // Ports
    // ==========================================================================

    #[tokio::test]
    async fn test_open_port_skips_busy_port() {
        let busy = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy_port = busy.local_addr().unwrap().port();
        let listener = Listener::new(LOCALHOST, Duration::from_secs(1));

        match listener.open_port(busy_port, busy_port.saturating_add(20)) {
            Ok(port) => assert_ne!(port, busy_port),
            Err(err) => panic!("expected a free port near {busy_port}: {err}"),
        }
    }

    #[tokio::test]
    async fn test_open_port_fails_when_range_taken() {
        let busy = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = busy.local_addr().unwrap().port();
        let listener = Listener::new(LOCALHOST, Duration::from_secs(1));
        assert!(matches!(
            listener.open_port(port, port),
            Err(ListenerError::Bind { .. })
        ));
        assert_eq!(listener.current_port(), None);
    }

    #[tokio::test]
    async fn test_reserved_port_survives_rebind() {
        let listener = Listener::new(LOCALHOST, Duration::from_secs(1));
        let first = free_port();
        assert_eq!(listener.open_port(first, first).unwrap(), first);
        let reservation = listener.reserve_port().unwrap();

        let second = free_port();
        assert_eq!(listener.open_port(second, second).unwrap(), second);
        assert_eq!(listener.current_port(), Some(second));
        assert!(listener.open_ports().contains(&first));

        drop(reservation);
        assert_eq!(listener.open_ports(), vec![second]);
    }

    #[tokio::test]
    async fn test_open_port_keeps_current_in_range() {
        let listener = Listener::new(LOCALHOST, Duration::from_secs(1));
        let port = free_port();
        listener.open_port(port, port).unwrap();
        assert_eq!(
            listener.open_port(port.saturating_sub(5), port.saturating_add(5)).unwrap(),
            port
        );
    }

    // ==========================================================================
    // Routing
    // ==========================================================================

    #[tokio::test]
    async fn test_routes_connection_by_info_hash() {
        let listener = Listener::new(LOCALHOST, Duration::from_secs(2));
        let port = free_port();
        listener.open_port(port, port).unwrap();
        let hash = InfoHash::new([5; 20]);
        let mut registration = listener.register(hash).unwrap();

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        client.write_all(&handshake(&hash)).await.unwrap();

        let peer = tokio::time::timeout(Duration::from_secs(5), registration.accept())
            .await
            .expect("routed in time")
            .expect("registration open");
        assert_eq!(peer.prefix, handshake(&hash));
        assert_eq!(peer.addr.ip(), LOCALHOST);
    }

    #[tokio::test]
    async fn test_unknown_info_hash_is_dropped() {
        let listener = Listener::new(LOCALHOST, Duration::from_secs(2));
        let port = free_port();
        listener.open_port(port, port).unwrap();
        let mut registration = listener.register(InfoHash::new([5; 20])).unwrap();

        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        client
            .write_all(&handshake(&InfoHash::new([6; 20])))
            .await
            .unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection closed in time");
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(
            tokio::time::timeout(Duration::from_millis(50), registration.accept())
                .await
                .is_err()
        );
    }
}
