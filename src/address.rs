//! IP endpoint value objects, stored as the platform sockaddr so they can
//! be handed to the kernel without conversion.

use std::fmt;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub(crate) fn raw(self) -> libc::c_int {
        match self {
            AddressFamily::Ipv4 => libc::AF_INET,
            AddressFamily::Ipv6 => libc::AF_INET6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => f.write_str("ipv4"),
            AddressFamily::Ipv6 => f.write_str("ipv6"),
        }
    }
}

/// An IPv4 or IPv6 endpoint address.
#[derive(Clone, Copy)]
pub enum NetworkAddress {
    Ipv4(libc::sockaddr_in),
    Ipv6(libc::sockaddr_in6),
}

impl NetworkAddress {
    /// The IPv4 wildcard address with port 0.
    pub fn ipv4_any() -> Self {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).into()
    }

    /// The IPv6 wildcard address with port 0.
    pub fn ipv6_any() -> Self {
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0)).into()
    }

    pub fn ipv4_loopback() -> Self {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).into()
    }

    pub fn family(&self) -> AddressFamily {
        match self {
            NetworkAddress::Ipv4(_) => AddressFamily::Ipv4,
            NetworkAddress::Ipv6(_) => AddressFamily::Ipv6,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            NetworkAddress::Ipv4(sa) => u16::from_be(sa.sin_port),
            NetworkAddress::Ipv6(sa) => u16::from_be(sa.sin6_port),
        }
    }

    pub fn set_port(&mut self, port: u16) {
        match self {
            NetworkAddress::Ipv4(sa) => sa.sin_port = port.to_be(),
            NetworkAddress::Ipv6(sa) => sa.sin6_port = port.to_be(),
        }
    }

    /// Raw view for kernel calls; the pointer is valid while `self` is.
    pub(crate) fn sockaddr(&self) -> (*const libc::sockaddr, libc::socklen_t) {
        match self {
            NetworkAddress::Ipv4(sa) => (
                sa as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ),
            NetworkAddress::Ipv6(sa) => (
                sa as *const libc::sockaddr_in6 as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            ),
        }
    }

    /// Rebuild from a storage filled in by accept/getsockname/getpeername.
    pub(crate) fn from_raw(
        storage: &libc::sockaddr_storage,
        _len: libc::socklen_t,
    ) -> Option<Self> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sa = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
                Some(NetworkAddress::Ipv4(sa))
            }
            libc::AF_INET6 => {
                let sa = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
                Some(NetworkAddress::Ipv6(sa))
            }
            _ => None,
        }
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => {
                let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_port = v4.port().to_be();
                sa.sin_addr = libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                };
                NetworkAddress::Ipv4(sa)
            }
            SocketAddr::V6(v6) => {
                let mut sa: libc::sockaddr_in6 = unsafe { mem::zeroed() };
                sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sa.sin6_port = v6.port().to_be();
                sa.sin6_addr = libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                };
                sa.sin6_flowinfo = v6.flowinfo();
                sa.sin6_scope_id = v6.scope_id();
                NetworkAddress::Ipv6(sa)
            }
        }
    }
}

impl From<NetworkAddress> for SocketAddr {
    fn from(addr: NetworkAddress) -> Self {
        match addr {
            NetworkAddress::Ipv4(sa) => SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)),
                u16::from_be(sa.sin_port),
            )),
            NetworkAddress::Ipv6(sa) => SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sa.sin6_addr.s6_addr),
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )),
        }
    }
}

impl PartialEq for NetworkAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NetworkAddress::Ipv4(a), NetworkAddress::Ipv4(b)) => {
                a.sin_port == b.sin_port && a.sin_addr.s_addr == b.sin_addr.s_addr
            }
            (NetworkAddress::Ipv6(a), NetworkAddress::Ipv6(b)) => {
                a.sin6_port == b.sin6_port
                    && a.sin6_addr.s6_addr == b.sin6_addr.s6_addr
                    && a.sin6_scope_id == b.sin6_scope_id
            }
            _ => false,
        }
    }
}

impl Eq for NetworkAddress {}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::from(*self).fmt(f)
    }
}

impl fmt::Debug for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_addresses() {
        let v4 = NetworkAddress::ipv4_any();
        assert_eq!(v4.family(), AddressFamily::Ipv4);
        assert_eq!(v4.port(), 0);

        let v6 = NetworkAddress::ipv6_any();
        assert_eq!(v6.family(), AddressFamily::Ipv6);
        assert_eq!(v6.port(), 0);
    }

    #[test]
    fn port_roundtrip() {
        let mut addr = NetworkAddress::ipv4_any();
        addr.set_port(31890);
        assert_eq!(addr.port(), 31890);

        let mut addr = NetworkAddress::ipv6_any();
        addr.set_port(4242);
        assert_eq!(addr.port(), 4242);
    }

    #[test]
    fn equality_and_display() {
        let mut a = NetworkAddress::ipv4_loopback();
        a.set_port(80);
        let b = NetworkAddress::from(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::LOCALHOST,
            80,
        )));
        assert_eq!(a, b);
        assert_ne!(a, NetworkAddress::ipv4_any());
        assert_ne!(a, NetworkAddress::ipv6_any());
        assert_eq!(a.to_string(), "127.0.0.1:80");
    }

    #[test]
    fn socketaddr_roundtrip() {
        let addr: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        let net = NetworkAddress::from(addr);
        assert_eq!(SocketAddr::from(net), addr);
    }
}
