//! The public-IP store
//!
//! Holds the public IPv4/IPv6 addresses announced to upstreams via the
//! EDNS Client-Subnet option. Geolocation-sensitive answers are only as
//! good as this hint, so writes reject anything that cannot be a public
//! address: unspecified, loopback, private/unique-local, link-local,
//! and multicast ranges, plus family mismatches.
//!
//! The store is passed around explicitly (no global state) and guarded
//! by a reader/writer lock; the forwarder reads it on every query.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use parking_lot::RwLock;
use thiserror::Error;

/// Error rejecting a public-IP write.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MyIpError {
    /// The input does not parse as an IP address.
    #[error("not an IP address [{0}]")]
    Invalid(String),
    /// The address family does not match the slot.
    #[error("not an IPv{family} address [{addr}]")]
    WrongFamily {
        /// Expected family, 4 or 6.
        family: u8,
        /// The offending input.
        addr: String,
    },
    /// The address is not publicly routable.
    #[error("not a public IP address [{0}]")]
    NotPublic(String),
}

#[derive(Default)]
struct Slots {
    v4: Option<Ipv4Addr>,
    v6: Option<Ipv6Addr>,
}

/// Public IPv4/IPv6 address store.
#[derive(Default)]
pub struct MyIp {
    slots: RwLock<Slots>,
}

impl MyIp {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored public IPv4 address, if any.
    #[must_use]
    pub fn v4(&self) -> Option<Ipv4Addr> {
        self.slots.read().v4
    }

    /// The stored public IPv6 address, if any.
    #[must_use]
    pub fn v6(&self) -> Option<Ipv6Addr> {
        self.slots.read().v6
    }

    /// Set the public IPv4 address.
    ///
    /// # Errors
    ///
    /// Fails when the input is not an IPv4 address or not public.
    pub fn set_v4(&self, ip: &str) -> Result<(), MyIpError> {
        let addr: IpAddr = ip.parse().map_err(|_| MyIpError::Invalid(ip.to_string()))?;
        let IpAddr::V4(v4) = addr else {
            return Err(MyIpError::WrongFamily {
                family: 4,
                addr: ip.to_string(),
            });
        };
        if !is_public_v4(v4) {
            return Err(MyIpError::NotPublic(ip.to_string()));
        }

        self.slots.write().v4 = Some(v4);
        Ok(())
    }

    /// Set the public IPv6 address.
    ///
    /// # Errors
    ///
    /// Fails when the input is not an IPv6 address or not public.
    pub fn set_v6(&self, ip: &str) -> Result<(), MyIpError> {
        let addr: IpAddr = ip.parse().map_err(|_| MyIpError::Invalid(ip.to_string()))?;
        let IpAddr::V6(v6) = addr else {
            return Err(MyIpError::WrongFamily {
                family: 6,
                addr: ip.to_string(),
            });
        };
        if !is_public_v6(v6) {
            return Err(MyIpError::NotPublic(ip.to_string()));
        }

        self.slots.write().v6 = Some(v6);
        Ok(())
    }

    /// Set whichever slot matches the input's family.
    ///
    /// # Errors
    ///
    /// Fails when the input does not parse or is not public.
    pub fn set(&self, ip: &str) -> Result<(), MyIpError> {
        let addr: IpAddr = ip.parse().map_err(|_| MyIpError::Invalid(ip.to_string()))?;
        match addr {
            IpAddr::V4(_) => self.set_v4(ip),
            IpAddr::V6(_) => self.set_v6(ip),
        }
    }
}

fn is_public_v4(addr: Ipv4Addr) -> bool {
    !(addr.is_unspecified() || addr.is_loopback() || addr.is_private() || addr.is_multicast())
}

fn is_public_v6(addr: Ipv6Addr) -> bool {
    if addr.is_unspecified() || addr.is_loopback() || addr.is_multicast() {
        return false;
    }
    let seg0 = addr.segments()[0];
    // Unique-local fc00::/7 plays the private-range role for IPv6.
    if seg0 & 0xFE00 == 0xFC00 {
        return false;
    }
    // Link-local fe80::/10.
    if seg0 & 0xFFC0 == 0xFE80 {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // IPv4
    // ========================================================================

    #[test]
    fn test_set_v4_public() {
        let myip = MyIp::new();
        assert_eq!(myip.v4(), None);

        myip.set_v4("203.0.113.5").unwrap();
        assert_eq!(myip.v4(), Some(Ipv4Addr::new(203, 0, 113, 5)));
        // IPv6 slot untouched.
        assert_eq!(myip.v6(), None);
    }

    #[test]
    fn test_set_v4_rejects_non_public() {
        let myip = MyIp::new();
        for bad in ["0.0.0.0", "127.0.0.1", "10.1.2.3", "172.16.0.1", "192.168.1.1", "224.0.0.1"] {
            assert_eq!(
                myip.set_v4(bad),
                Err(MyIpError::NotPublic(bad.to_string())),
                "address {bad}"
            );
        }
        assert_eq!(myip.v4(), None);
    }

    #[test]
    fn test_set_v4_rejects_wrong_family() {
        let myip = MyIp::new();
        assert!(matches!(
            myip.set_v4("2001:db8::1"),
            Err(MyIpError::WrongFamily { family: 4, .. })
        ));
    }

    #[test]
    fn test_set_v4_rejects_garbage() {
        let myip = MyIp::new();
        assert!(matches!(myip.set_v4("not-an-ip"), Err(MyIpError::Invalid(_))));
    }

    // ========================================================================
    // IPv6
    // ========================================================================

    #[test]
    fn test_set_v6_public() {
        let myip = MyIp::new();
        myip.set_v6("2001:db8::1234").unwrap();
        assert_eq!(myip.v6(), Some("2001:db8::1234".parse().unwrap()));
    }

    #[test]
    fn test_set_v6_rejects_non_public() {
        let myip = MyIp::new();
        for bad in ["::", "::1", "fc00::1", "fd12:3456::1", "fe80::1", "ff02::1"] {
            assert_eq!(
                myip.set_v6(bad),
                Err(MyIpError::NotPublic(bad.to_string())),
                "address {bad}"
            );
        }
    }

    #[test]
    fn test_set_v6_rejects_wrong_family() {
        let myip = MyIp::new();
        assert!(matches!(
            myip.set_v6("203.0.113.5"),
            Err(MyIpError::WrongFamily { family: 6, .. })
        ));
    }

    // ========================================================================
    // Family Dispatch
    // ========================================================================

    #[test]
    fn test_set_dispatches_by_family() {
        let myip = MyIp::new();
        myip.set("203.0.113.5").unwrap();
        myip.set("2001:db8::1").unwrap();
        assert!(myip.v4().is_some());
        assert!(myip.v6().is_some());
    }

    #[test]
    fn test_overwrite_keeps_last_value() {
        let myip = MyIp::new();
        myip.set_v4("203.0.113.5").unwrap();
        myip.set_v4("198.51.100.7").unwrap();
        assert_eq!(myip.v4(), Some(Ipv4Addr::new(198, 51, 100, 7)));
    }
}
