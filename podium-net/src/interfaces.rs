//! Local host identity: IPv4 interfaces and the machine name.

use std::net::Ipv4Addr;

use if_addrs::IfAddr;

/// Limited broadcast, always included as a last resort.
pub const LIMITED_BROADCAST: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Non-loopback IPv4 addresses with their netmask and broadcast.
fn ipv4_interfaces() -> Vec<(Ipv4Addr, Ipv4Addr, Option<Ipv4Addr>)> {
    match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .filter_map(|iface| match iface.addr {
                IfAddr::V4(v4) => Some((v4.ip, v4.netmask, v4.broadcast)),
                IfAddr::V6(_) => None,
            })
            .collect(),
        Err(e) => {
            log::warn!(target: "podium::discovery", "could not list network interfaces: {}", e);
            Vec::new()
        }
    }
}

/// The machine's host name, used as the default conductor or device name.
pub fn device_name() -> String {
    let name = gethostname::gethostname().to_string_lossy().trim().to_string();
    if name.is_empty() {
        "podium".to_string()
    } else {
        name
    }
}

/// First non-loopback IPv4 address, if the host has one.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    ipv4_interfaces().into_iter().map(|(ip, _, _)| ip).next()
}

/// `ip | !netmask`
pub fn derive_broadcast(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// Every interface broadcast address, then `255.255.255.255`.
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    for (ip, netmask, broadcast) in ipv4_interfaces() {
        let addr = broadcast.unwrap_or_else(|| derive_broadcast(ip, netmask));
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
    }
    if !addresses.contains(&LIMITED_BROADCAST) {
        addresses.push(LIMITED_BROADCAST);
    }
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_is_never_empty() {
        assert!(!device_name().is_empty());
    }

    #[test]
    fn broadcast_from_netmask() {
        assert_eq!(
            derive_broadcast(Ipv4Addr::new(192, 168, 1, 42), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            derive_broadcast(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 255, 0, 0)),
            Ipv4Addr::new(10, 1, 255, 255)
        );
    }

    #[test]
    fn limited_broadcast_always_last() {
        let addresses = broadcast_addresses();
        assert_eq!(addresses.last(), Some(&LIMITED_BROADCAST));
    }
}
