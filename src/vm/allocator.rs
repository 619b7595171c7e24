//! Exclusive host resources: console ports, MAC addresses, macvtap names.
//!
//! Callers hold the registry lock while allocating so two concurrent creates
//! cannot walk onto the same port.

use crate::error::{Error, PortCategory, Result};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::ops::RangeInclusive;
use std::time::Duration;

/// Locally administered prefix QEMU uses for its own NICs.
pub const MAC_PREFIX: &str = "52:54:00";

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

impl PortCategory {
    pub fn range(self) -> RangeInclusive<u16> {
        match self {
            PortCategory::Vnc => 5900..=5999,
            PortCategory::Spice => 5800..=5899,
            PortCategory::Proxy => 6800..=6999,
        }
    }
}

/// True when something on the host accepts connections on `port`.
pub fn port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
}

/// First port of `category` that is neither in `used` nor bound on the host.
pub fn allocate_port(category: PortCategory, used: &HashSet<u16>) -> Result<u16> {
    allocate_port_with(category, used, port_in_use)
}

pub fn allocate_port_with(
    category: PortCategory,
    used: &HashSet<u16>,
    in_use: impl Fn(u16) -> bool,
) -> Result<u16> {
    let port = category
        .range()
        .find(|p| !used.contains(p) && !in_use(*p))
        .ok_or(Error::ResourceExhausted { category })?;
    tracing::debug!(%category, port, "allocated port");
    Ok(port)
}

/// Random MAC under [`MAC_PREFIX`].
pub fn generate_mac() -> String {
    format!(
        "{MAC_PREFIX}:{:02x}:{:02x}:{:02x}",
        rand::random::<u8>(),
        rand::random::<u8>(),
        rand::random::<u8>()
    )
}

/// Random MAC not already present in `taken`.
pub fn unique_mac(taken: &HashSet<String>) -> String {
    loop {
        let mac = generate_mac();
        if !taken.contains(&mac) {
            return mac;
        }
    }
}

/// Name prefix shared by every macvtap link of one VM.
pub fn macvtap_prefix(vm_id: &str) -> String {
    let short: String = vm_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    format!("mvt{short}")
}

/// Deterministic macvtap name for interface `index` of a VM (fits IFNAMSIZ).
pub fn macvtap_name(vm_id: &str, index: usize) -> String {
    format!("{}{}", macvtap_prefix(vm_id), index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_skips_used_and_bound() {
        let used: HashSet<u16> = [5900, 5901].into_iter().collect();
        let port = allocate_port_with(PortCategory::Vnc, &used, |p| p == 5902).unwrap();
        assert_eq!(port, 5903);
    }

    #[test]
    fn test_allocate_exhausted() {
        let used: HashSet<u16> = PortCategory::Spice.range().collect();
        let err = allocate_port_with(PortCategory::Spice, &used, |_| false).unwrap_err();
        assert!(matches!(
            err,
            Error::ResourceExhausted {
                category: PortCategory::Spice
            }
        ));
    }

    #[test]
    fn test_ranges_do_not_overlap() {
        let vnc = PortCategory::Vnc.range();
        let spice = PortCategory::Spice.range();
        let proxy = PortCategory::Proxy.range();
        assert!(spice.end() < vnc.start());
        assert!(vnc.end() < proxy.start());
    }

    #[test]
    fn test_generate_mac_format() {
        let mac = generate_mac();
        assert!(mac.starts_with("52:54:00:"));
        assert_eq!(mac.len(), 17);
        assert!(mac
            .split(':')
            .all(|octet| octet.len() == 2 && u8::from_str_radix(octet, 16).is_ok()));
    }

    #[test]
    fn test_unique_mac_avoids_taken() {
        let taken: HashSet<String> = (0..32).map(|_| generate_mac()).collect();
        let mac = unique_mac(&taken);
        assert!(!taken.contains(&mac));
    }

    #[test]
    fn test_macvtap_names() {
        let id = "1b4e28ba-2fa1-11d2-883f-0016d3cca427";
        assert_eq!(macvtap_prefix(id), "mvt1b4e28ba");
        assert_eq!(macvtap_name(id, 0), "mvt1b4e28ba0");
        assert!(macvtap_name(id, 9).len() <= 15);
    }
}
