//! Host resolution and local interface enumeration.
//!
//! # Safety
//!
//! This module uses unsafe code to walk the `getifaddrs(3)` list. The
//! unsafe operations are encapsulated and safe to use from the public API.

#![allow(unsafe_code)]

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};

/// Resolve a host name or dotted-quad literal to an IPv4 address.
///
/// Returns `None` when the name does not resolve to any IPv4 address.
///
/// ```
/// use gangway_net::addr::resolve_host;
/// use std::net::Ipv4Addr;
///
/// assert_eq!(resolve_host("127.0.0.1"), Some(Ipv4Addr::LOCALHOST));
/// assert_eq!(resolve_host(".example"), None);
/// ```
#[must_use]
pub fn resolve_host(host: &str) -> Option<Ipv4Addr> {
    (host, 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
}

/// Enumerate the IPv4 addresses of the local interfaces, excluding
/// loopback and link-local addresses.
///
/// Returns an empty list if the interfaces cannot be enumerated.
#[must_use]
pub fn interface_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        tracing::debug!(
            error = %std::io::Error::last_os_error(),
            "getifaddrs failed"
        );
        return addresses;
    }

    let mut cursor = ifap;
    while !cursor.is_null() {
        // Entries stay valid until freeifaddrs below.
        let entry = unsafe { &*cursor };
        if !entry.ifa_addr.is_null() {
            let family = unsafe { (*entry.ifa_addr).sa_family };
            if family == libc::AF_INET as libc::sa_family_t {
                let sin = unsafe { &*entry.ifa_addr.cast::<libc::sockaddr_in>() };
                let addr = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                if !addr.is_loopback() && !addr.is_link_local() {
                    addresses.push(addr);
                }
            }
        }
        cursor = entry.ifa_next;
    }
    unsafe { libc::freeifaddrs(ifap) };
    addresses
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_loopback_names() {
        assert_eq!(
            resolve_host("localhost"),
            Some(Ipv4Addr::new(127, 0, 0, 1))
        );
        assert_eq!(
            resolve_host("127.0.0.1"),
            Some(Ipv4Addr::new(127, 0, 0, 1))
        );
        assert_eq!(
            u32::from(resolve_host("127.0.0.1").unwrap()),
            0x7f00_0001
        );
    }

    #[test]
    fn unresolvable_host_is_none() {
        assert_eq!(resolve_host(".example"), None);
    }

    #[test]
    fn interface_addresses_excludes_loopback() {
        for addr in interface_addresses() {
            assert!(!addr.is_loopback());
            assert!(!addr.is_link_local());
        }
    }
}
