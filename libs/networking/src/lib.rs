//! Tenant networking model for the node agent.
//!
//! This library provides:
//! - IPv4 subnet arithmetic for tenant subnets
//! - MAC address parsing and classification
//! - `VnicConfig`, the validated request for one instance network interface
//! - Linux interface naming and MTU rules

use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Invalid MAC address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Address is not usable for a VNIC in the given subnet.
    #[error("address {addr} not usable in subnet {subnet}: {detail}")]
    AddressNotUsable {
        addr: Ipv4Addr,
        subnet: String,
        detail: &'static str,
    },

    /// Invalid MTU value.
    #[error("invalid MTU: {value} (must be between {min} and {max})")]
    InvalidMtu { value: u16, min: u16, max: u16 },

    /// Interface name violates kernel limits.
    #[error("invalid interface name '{0}'")]
    InvalidInterfaceName(String),
}

// ============================================================================
// Subnets
// ============================================================================

/// IPv4 tenant subnet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Subnet {
    /// Network address (host bits cleared).
    network: Ipv4Addr,

    /// Prefix length (0-32).
    prefix_len: u8,
}

impl Ipv4Subnet {
    /// Create a subnet, masking `address` to the prefix.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }

        Ok(Self {
            network: Ipv4Addr::from(u32::from(address) & mask(prefix_len)),
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "172.16.0.0/24").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Netmask in dotted form.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask(self.prefix_len))
    }

    /// Check if an address is within this subnet.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask(self.prefix_len) == u32::from(self.network)
    }

    /// Broadcast address of the subnet.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !mask(self.prefix_len))
    }

    /// Gateway address handed to instances: the first host address.
    ///
    /// `None` for /31 and /32, which have no room for a gateway.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        if self.prefix_len > 30 {
            return None;
        }
        Some(Ipv4Addr::from(u32::from(self.network) + 1))
    }
}

impl std::fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix_len)
    }
}

fn mask(prefix_len: u8) -> u32 {
    match prefix_len {
        0 => 0,
        n if n >= 32 => u32::MAX,
        n => u32::MAX << (32 - n),
    }
}

// ============================================================================
// MAC addresses
// ============================================================================

/// Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Group bit set (multicast or broadcast).
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl FromStr for MacAddr {
    type Err = NetworkError;

    /// Accepts `aa:bb:cc:dd:ee:ff` or `aa-bb-cc-dd-ee-ff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || NetworkError::InvalidMac(s.to_string());

        let parts: Vec<&str> = s.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }

        Ok(Self(octets))
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

// ============================================================================
// MTU Configuration
// ============================================================================

/// Minimum MTU accepted for a tenant interface.
pub const MTU_MIN_IPV4: u16 = 576;

/// Maximum MTU for jumbo frames.
pub const MTU_MAX_JUMBO: u16 = 9000;

/// Default MTU for Ethernet.
pub const MTU_DEFAULT_ETHERNET: u16 = 1500;

/// Validate an MTU value.
pub fn validate_mtu(mtu: u16) -> Result<u16, NetworkError> {
    if !(MTU_MIN_IPV4..=MTU_MAX_JUMBO).contains(&mtu) {
        return Err(NetworkError::InvalidMtu {
            value: mtu,
            min: MTU_MIN_IPV4,
            max: MTU_MAX_JUMBO,
        });
    }
    Ok(mtu)
}

// ============================================================================
// Interface naming
// ============================================================================

/// Longest Linux interface name (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Validate a Linux interface name.
pub fn validate_ifname(name: &str) -> Result<&str, NetworkError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_IFNAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !ok {
        return Err(NetworkError::InvalidInterfaceName(name.to_string()));
    }
    Ok(name)
}

/// Bridge shared by all VNICs of one tenant subnet.
pub fn bridge_name(subnet_key: u32) -> String {
    format!("br{:08x}", subnet_key)
}

/// TAP device for one VNIC: `vn` plus the last 12 hex digits of the VNIC ID.
pub fn tap_name(vnic_id: &Uuid) -> String {
    let simple = vnic_id.simple().to_string();
    format!("vn{}", &simple[simple.len() - 12..])
}

// ============================================================================
// VNIC requests
// ============================================================================

/// What kind of workload a VNIC is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VnicRole {
    TenantVm,
    TenantContainer,
}

/// Validated request for one instance network interface.
///
/// Built once per start request; the same value is used to allocate the
/// interface and, on rollback, to release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnicConfig {
    pub role: VnicRole,
    pub instance_id: String,
    pub tenant_id: Uuid,
    pub vnic_id: Uuid,
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub subnet: Ipv4Subnet,
    /// Controller-assigned key identifying the tenant subnet on this cluster.
    pub subnet_key: u32,
    /// Compute network concentrator that tunnels this subnet.
    pub concentrator_ip: Ipv4Addr,
    pub mtu: u16,
}

impl VnicConfig {
    /// Check the cross-field rules a VNIC must satisfy.
    ///
    /// The guest address must be a host address of the subnet other than the
    /// gateway, and the MAC must be unicast.
    pub fn validate(&self) -> Result<(), NetworkError> {
        let unusable = |detail| NetworkError::AddressNotUsable {
            addr: self.ip,
            subnet: self.subnet.to_string(),
            detail,
        };

        if !self.subnet.contains(self.ip) {
            return Err(unusable("outside subnet"));
        }
        let gateway = self.subnet.gateway().ok_or(unusable("subnet too small"))?;
        if self.ip == self.subnet.network() || self.ip == self.subnet.broadcast() {
            return Err(unusable("network or broadcast address"));
        }
        if self.ip == gateway {
            return Err(unusable("reserved for gateway"));
        }
        if self.mac.is_multicast() {
            return Err(NetworkError::InvalidMac(format!(
                "{} is not a unicast address",
                self.mac
            )));
        }
        validate_mtu(self.mtu)?;

        Ok(())
    }

    /// Gateway address of the VNIC's subnet.
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.subnet.gateway()
    }

    pub fn bridge_name(&self) -> String {
        bridge_name(self.subnet_key)
    }

    pub fn tap_name(&self) -> String {
        tap_name(&self.vnic_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vnic() -> VnicConfig {
        VnicConfig {
            role: VnicRole::TenantVm,
            instance_id: "vm-001".to_string(),
            tenant_id: Uuid::from_u128(0x1111),
            vnic_id: Uuid::from_u128(0xabcdef0123456789),
            mac: "02:00:ac:10:00:05".parse().unwrap(),
            ip: "172.16.0.5".parse().unwrap(),
            subnet: Ipv4Subnet::from_cidr("172.16.0.0/24").unwrap(),
            subnet_key: 0x0010_0001,
            concentrator_ip: "192.168.1.10".parse().unwrap(),
            mtu: MTU_DEFAULT_ETHERNET,
        }
    }

    #[test]
    fn test_subnet_masks_host_bits() {
        let subnet = Ipv4Subnet::from_cidr("172.16.3.77/22").unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(172, 16, 0, 0));
        assert_eq!(subnet.to_string(), "172.16.0.0/22");
        assert_eq!(subnet.netmask(), Ipv4Addr::new(255, 255, 252, 0));
        assert_eq!(subnet.broadcast(), Ipv4Addr::new(172, 16, 3, 255));
        assert_eq!(subnet.gateway(), Some(Ipv4Addr::new(172, 16, 0, 1)));
    }

    #[test]
    fn test_subnet_contains() {
        let subnet = Ipv4Subnet::from_cidr("10.0.0.0/8").unwrap();
        assert!(subnet.contains("10.255.1.2".parse().unwrap()));
        assert!(!subnet.contains("11.0.0.1".parse().unwrap()));

        let all = Ipv4Subnet::from_cidr("0.0.0.0/0").unwrap();
        assert!(all.contains("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_subnet_parse_errors() {
        assert!(matches!(
            Ipv4Subnet::from_cidr("10.0.0.0"),
            Err(NetworkError::InvalidPrefix(_))
        ));
        assert!(matches!(
            Ipv4Subnet::from_cidr("10.0.0/8"),
            Err(NetworkError::InvalidAddress(_))
        ));
        assert!(matches!(
            Ipv4Subnet::from_cidr("10.0.0.0/33"),
            Err(NetworkError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_tiny_subnets_have_no_gateway() {
        assert_eq!(Ipv4Subnet::from_cidr("10.0.0.0/31").unwrap().gateway(), None);
        assert!(Ipv4Subnet::from_cidr("10.0.0.0/30").unwrap().gateway().is_some());
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "02-AB-cd-00-11-ff".parse().unwrap();
        assert_eq!(mac.to_string(), "02:ab:cd:00:11:ff");
        assert!(mac.is_locally_administered());
        assert!(!mac.is_multicast());

        for bad in ["", "02:ab:cd:00:11", "02:ab:cd:00:11:fg", "2:ab:cd:00:11:ff"] {
            assert!(bad.parse::<MacAddr>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_mtu_validation() {
        assert!(validate_mtu(576).is_ok());
        assert!(validate_mtu(1500).is_ok());
        assert!(validate_mtu(9000).is_ok());

        assert!(validate_mtu(575).is_err());
        assert!(validate_mtu(9001).is_err());
    }

    #[test]
    fn test_interface_names_fit_ifnamsiz() {
        let cfg = vnic();
        assert_eq!(cfg.bridge_name(), "br00100001");
        assert_eq!(cfg.tap_name(), "vnef0123456789");
        assert!(validate_ifname(&cfg.tap_name()).is_ok());
        assert!(validate_ifname(&bridge_name(u32::MAX)).is_ok());
        assert!(validate_ifname("a-name-that-is-too-long").is_err());
        assert!(validate_ifname("").is_err());
    }

    #[test]
    fn test_vnic_validate_ok() {
        let cfg = vnic();
        cfg.validate().unwrap();
        assert_eq!(cfg.gateway(), Some(Ipv4Addr::new(172, 16, 0, 1)));
    }

    #[test]
    fn test_vnic_validate_rejects_bad_addresses() {
        for ip in ["172.16.1.5", "172.16.0.0", "172.16.0.255", "172.16.0.1"] {
            let cfg = VnicConfig {
                ip: ip.parse().unwrap(),
                ..vnic()
            };
            assert!(
                matches!(cfg.validate(), Err(NetworkError::AddressNotUsable { .. })),
                "{ip} should be rejected"
            );
        }
    }

    #[test]
    fn test_vnic_validate_rejects_multicast_mac_and_bad_mtu() {
        let cfg = VnicConfig {
            mac: "01:00:5e:00:00:01".parse().unwrap(),
            ..vnic()
        };
        assert!(matches!(cfg.validate(), Err(NetworkError::InvalidMac(_))));

        let cfg = VnicConfig { mtu: 100, ..vnic() };
        assert!(matches!(cfg.validate(), Err(NetworkError::InvalidMtu { .. })));
    }
}
