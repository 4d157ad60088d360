//! UPnP/IGD port forwarding for the shared listen port
//!
//! When `upnp` is enabled the manager asks the local router to forward the
//! listen port:
//!
//! - Discover the gateway via multicast
//! - Request TCP forwarding with a 1-hour lease
//! - Renew the lease every 30 minutes
//! - Move the mapping when the listen port changes
//! - Remove the mapping on shutdown
//!
//! ## IPv4 Only
//!
//! UPnP/IGD is an IPv4 NAT traversal protocol. Binding to `0.0.0.0` or `::`
//! works (the local address is detected from the routing table); a specific
//! IPv6 bind address is rejected.
//!
//! All failures are non-fatal. The manager reports them as warnings and keeps
//! running without forwarding.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use igd_next::SearchOptions;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::constants::*;

/// UPnP port mapping lease duration (in seconds)
const LEASE_DURATION: u32 = 3600;

/// Gateway search timeout (allows time for firewall approval dialogs)
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

const PROTOCOL_DESCRIPTION: &str = "swarm daemon";

const UDP_BIND_ADDRESS: &str = "0.0.0.0:0";

/// Remote address for the routing table lookup (no packets are sent)
const ROUTING_TEST_ADDRESS: &str = "8.8.8.8:80";

#[derive(Debug, Error)]
pub enum UpnpError {
    #[error("UPnP requires IPv4; bind to a specific IPv4 address, 0.0.0.0 or ::")]
    Ipv6NotSupported,

    #[error("UPnP gateway not found: {0}")]
    GatewayNotFound(String),

    #[error("failed to get external IP from gateway: {0}")]
    ExternalIp(String),

    #[error("failed to add port mapping: {0}")]
    AddPortMapping(String),

    #[error("failed to remove port mapping: {0}")]
    RemovePortMapping(String),

    #[error("UPnP worker task failed: {0}")]
    Task(String),

    #[error("could not determine local IPv4 address: {0}")]
    LocalAddress(String),
}

/// Gateway handle for the listen port mapping
pub struct UpnpGateway {
    gateway: RwLock<igd_next::Gateway>,
    port: AtomicU16,
    local_ip: Ipv4Addr,
}

async fn add_port_mapping(
    gateway: &igd_next::Gateway,
    port: u16,
    local_ip: Ipv4Addr,
) -> Result<(), UpnpError> {
    let socket = SocketAddr::V4(SocketAddrV4::new(local_ip, port));
    let gw = gateway.clone();
    tokio::task::spawn_blocking(move || {
        gw.add_port(
            igd_next::PortMappingProtocol::TCP,
            port,
            socket,
            LEASE_DURATION,
            PROTOCOL_DESCRIPTION,
        )
    })
    .await
    .map_err(|e| UpnpError::Task(e.to_string()))?
    .map_err(|e| UpnpError::AddPortMapping(e.to_string()))
}

async fn remove_port(gateway: &igd_next::Gateway, port: u16) -> Result<(), UpnpError> {
    let gw = gateway.clone();
    tokio::task::spawn_blocking(move || gw.remove_port(igd_next::PortMappingProtocol::TCP, port))
        .await
        .map_err(|e| UpnpError::Task(e.to_string()))?
        .map_err(|e| UpnpError::RemovePortMapping(e.to_string()))
}

async fn search_gateway() -> Result<igd_next::Gateway, UpnpError> {
    tokio::task::spawn_blocking(|| {
        igd_next::search_gateway(SearchOptions {
            timeout: Some(SEARCH_TIMEOUT),
            ..Default::default()
        })
    })
    .await
    .map_err(|e| UpnpError::Task(e.to_string()))?
    .map_err(|e| UpnpError::GatewayNotFound(e.to_string()))
}

impl UpnpGateway {
    /// Discover the gateway and forward `port`
    pub async fn setup(bind_addr: IpAddr, port: u16) -> Result<Self, UpnpError> {
        let local_ip = match bind_addr {
            IpAddr::V4(ipv4) if ipv4.is_unspecified() => Self::get_local_ipv4()?,
            IpAddr::V4(ipv4) => ipv4,
            // :: is dual-stack, so IPv4 forwarding still reaches us
            IpAddr::V6(ipv6) if ipv6.is_unspecified() => Self::get_local_ipv4()?,
            IpAddr::V6(_) => return Err(UpnpError::Ipv6NotSupported),
        };

        let gateway = search_gateway().await?;

        let external_ip = tokio::task::spawn_blocking({
            let gateway = gateway.clone();
            move || gateway.get_external_ip()
        })
        .await
        .map_err(|e| UpnpError::Task(e.to_string()))?
        .map_err(|e| UpnpError::ExternalIp(e.to_string()))?;

        add_port_mapping(&gateway, port, local_ip).await?;
        info!(external = %external_ip, local = %local_ip, port, "{MSG_UPNP_CONFIGURED}");

        Ok(Self {
            gateway: RwLock::new(gateway),
            port: AtomicU16::new(port),
            local_ip,
        })
    }

    /// Port currently forwarded
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    fn current_gateway(&self) -> igd_next::Gateway {
        self.gateway
            .read()
            .expect("UPnP gateway lock poisoned")
            .clone()
    }

    /// Forward `new_port` instead of the current port
    ///
    /// The old mapping is removed after the new one is in place; failing to
    /// remove it only logs, since the lease expires on its own.
    pub async fn remap(&self, new_port: u16) -> Result<(), UpnpError> {
        let old_port = self.port();
        if old_port == new_port {
            return Ok(());
        }
        let gateway = self.current_gateway();
        add_port_mapping(&gateway, new_port, self.local_ip).await?;
        self.port.store(new_port, Ordering::SeqCst);
        if let Err(e) = remove_port(&gateway, old_port).await {
            warn!(port = old_port, error = %e, "{WARN_UPNP_REMOVE_FAILED}");
        }
        info!(port = new_port, "{MSG_UPNP_CONFIGURED}");
        Ok(())
    }

    /// Remove the mapping; it expires after the lease if this fails
    pub async fn remove_port_mapping(&self) -> Result<(), UpnpError> {
        remove_port(&self.current_gateway(), self.port()).await
    }

    /// Extend the lease for another hour
    pub async fn renew_lease(&self) -> Result<(), UpnpError> {
        add_port_mapping(&self.current_gateway(), self.port(), self.local_ip).await
    }

    /// Find the gateway again (the router may have rebooted) and re-add the mapping
    pub async fn rediscover_and_remap(&self) -> Result<(), UpnpError> {
        let new_gateway = search_gateway().await?;
        add_port_mapping(&new_gateway, self.port(), self.local_ip).await?;
        *self.gateway.write().expect("UPnP gateway lock poisoned") = new_gateway;
        Ok(())
    }

    /// Local IPv4 address the OS would route outbound traffic from
    ///
    /// "Connecting" a UDP socket is a routing table lookup; nothing is sent.
    fn get_local_ipv4() -> Result<Ipv4Addr, UpnpError> {
        let socket =
            UdpSocket::bind(UDP_BIND_ADDRESS).map_err(|e| UpnpError::LocalAddress(e.to_string()))?;
        socket
            .connect(ROUTING_TEST_ADDRESS)
            .map_err(|e| UpnpError::LocalAddress(e.to_string()))?;

        match socket.local_addr() {
            Ok(addr) => match addr.ip() {
                IpAddr::V4(ipv4) if !ipv4.is_loopback() => Ok(ipv4),
                IpAddr::V4(_) => Err(UpnpError::LocalAddress("only loopback is available".into())),
                IpAddr::V6(_) => Err(UpnpError::LocalAddress("expected an IPv4 route".into())),
            },
            Err(e) => Err(UpnpError::LocalAddress(e.to_string())),
        }
    }
}

/// Renew the lease every 30 minutes, rediscovering the gateway on failure
///
/// Abort the returned handle on shutdown.
pub fn spawn_lease_renewal_task(gateway: Arc<UpnpGateway>) -> JoinHandle<()> {
    let renewal_interval = Duration::from_secs((LEASE_DURATION / 2) as u64);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        // The first tick is immediate
        interval.tick().await;

        loop {
            interval.tick().await;

            if let Err(e) = gateway.renew_lease().await {
                warn!(error = %e, "{WARN_UPNP_RENEW_FAILED}");
                info!("{MSG_UPNP_REDISCOVERING}");
                match gateway.rediscover_and_remap().await {
                    Ok(()) => info!("{MSG_UPNP_REDISCOVERED}"),
                    Err(e2) => {
                        warn!(error = %e2, "{WARN_UPNP_REDISCOVER_FAILED}");
                        warn!("{WARN_UPNP_PORT_EXPIRE}");
                    }
                }
            }
        }
    })
}
