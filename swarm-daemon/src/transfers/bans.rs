//! Per-transfer peer ban list
//!
//! IPv4-mapped IPv6 addresses (e.g. `::ffff:192.168.1.100`) are normalized
//! to IPv4, so a ban holds however the OS presents the peer's address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};
use iprange::IpRange;

#[derive(Debug)]
pub struct BanList {
    ipv4: IpRange<Ipv4Net>,
    ipv6: IpRange<Ipv6Net>,
    count: usize,
}

impl BanList {
    pub fn new() -> Self {
        Self {
            ipv4: IpRange::new(),
            ipv6: IpRange::new(),
            count: 0,
        }
    }

    /// Ban `ip`
    ///
    /// Returns false if it was already banned.
    pub fn ban(&mut self, ip: IpAddr) -> bool {
        if self.is_banned(ip) {
            return false;
        }
        match normalize_ip(ip) {
            IpAddr::V4(v4) => {
                if let Ok(net) = Ipv4Net::new(v4, 32) {
                    self.ipv4.add(net);
                }
            }
            IpAddr::V6(v6) => {
                if let Ok(net) = Ipv6Net::new(v6, 128) {
                    self.ipv6.add(net);
                }
            }
        }
        self.count += 1;
        true
    }

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        match normalize_ip(ip) {
            IpAddr::V4(v4) => self.ipv4.contains(&v4),
            IpAddr::V6(v6) => self.ipv6.contains(&v6),
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => to_ipv4_mapped(&v6).map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

/// IPv4 address inside `::ffff:0:0/96`, if any
fn to_ipv4_mapped(v6: &Ipv6Addr) -> Option<Ipv4Addr> {
    let octets = v6.octets();
    if octets[..10] == [0; 10] && octets[10] == 0xff && octets[11] == 0xff {
        Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
    } else {
        None
    }
}
