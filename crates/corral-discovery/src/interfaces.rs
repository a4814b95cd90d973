use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Name prefixes of physical NICs across Linux (classic and systemd
/// naming), macOS and the BSDs. Anything else (bridges, tunnels, VPNs,
/// container veths) is never advertised.
const PHYSICAL_PREFIXES: &[&str] = &[
    "eth", "eno", "ens", "enp", "enx", "wlan", "wlp", "wls", "en", "bge", "em", "igb", "ix", "re",
];

pub fn is_physical_interface(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    PHYSICAL_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Excludes loopback, link-local, CGNAT (100.64/10) and the 172.17-31/16
/// container bridge ranges.
pub fn is_routable(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_loopback()
        || ip.is_link_local()
        || (a == 100 && (64..=127).contains(&b))
        || (a == 172 && (17..=31).contains(&b))
        || ip.is_unspecified())
}

/// IPv4 addresses to advertise, falling back to `127.0.0.1` when no
/// interface qualifies.
pub fn advertised_addresses() -> Vec<Ipv4Addr> {
    let mut addrs = Vec::new();
    match getifaddrs() {
        Ok(ifaces) => {
            for iface in ifaces {
                let up = iface.flags.contains(InterfaceFlags::IFF_UP);
                let loopback = iface.flags.contains(InterfaceFlags::IFF_LOOPBACK);
                if !up || loopback || !is_physical_interface(&iface.interface_name) {
                    continue;
                }
                let Some(sin) = iface.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
                    continue;
                };
                let ip = sin.ip();
                if is_routable(ip) && !addrs.contains(&ip) {
                    debug!("advertising {ip} on {}", iface.interface_name);
                    addrs.push(ip);
                }
            }
        }
        Err(e) => warn!("interface enumeration failed: {e}"),
    }
    if addrs.is_empty() {
        addrs.push(Ipv4Addr::LOCALHOST);
    }
    addrs
}
