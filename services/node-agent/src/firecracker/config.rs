//! Firecracker API configuration objects.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/api_server/swagger/firecracker.yaml

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Guest interface name used for the instance VNIC and the metadata service.
pub const GUEST_IFACE: &str = "eth0";

/// Kernel command line shared by every guest.
const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Machine configuration for the microVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of vCPUs (1-32).
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smt: Option<bool>,
}

impl MachineConfig {
    pub fn new(vcpu_count: u8, mem_size_mib: u32) -> Self {
        Self {
            vcpu_count: vcpu_count.clamp(1, 32),
            mem_size_mib: mem_size_mib.max(128),
            smt: Some(false),
        }
    }
}

/// Boot source configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

impl BootSource {
    /// Boot `kernel_image_path`, with a static address when `network` is given.
    pub fn new(kernel_image_path: PathBuf, network: Option<&GuestNetwork>) -> Self {
        let boot_args = match network {
            Some(net) => format!("{BASE_BOOT_ARGS} {}", net.kernel_ip_arg()),
            None => BASE_BOOT_ARGS.to_string(),
        };
        Self {
            kernel_image_path,
            boot_args,
        }
    }
}

/// Static guest addressing handed to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestNetwork {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl GuestNetwork {
    /// `ip=<client>::<gateway>:<netmask>::<device>:off`
    pub fn kernel_ip_arg(&self) -> String {
        format!(
            "ip={}::{}:{}::{}:off",
            self.ip, self.gateway, self.netmask, GUEST_IFACE
        )
    }
}

/// Block device configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

impl DriveConfig {
    /// Writable root disk. Each instance owns its own copy.
    pub fn root_disk(path: PathBuf) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    /// Host TAP device.
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

impl NetworkInterface {
    pub fn new(host_dev_name: &str) -> Self {
        Self {
            iface_id: GUEST_IFACE.to_string(),
            host_dev_name: host_dev_name.to_string(),
            guest_mac: None,
        }
    }

    pub fn with_mac(mut self, mac: impl ToString) -> Self {
        self.guest_mac = Some(mac.to_string());
        self
    }
}

/// Metadata service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmdsConfig {
    pub version: String,
    pub network_interfaces: Vec<String>,
}

impl Default for MmdsConfig {
    fn default() -> Self {
        Self {
            version: "V2".to_string(),
            network_interfaces: vec![GUEST_IFACE.to_string()],
        }
    }
}

/// Contents of the metadata store seen by the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmdsData {
    pub instance_id: String,
    pub boot_id: String,
    pub node_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_cluster_id: Option<String>,
    pub user_data: String,
    pub meta_data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config_bounds() {
        let config = MachineConfig::new(0, 64);
        assert_eq!(config.vcpu_count, 1);
        assert_eq!(config.mem_size_mib, 128);

        let config = MachineConfig::new(2, 1024);
        assert_eq!((config.vcpu_count, config.mem_size_mib), (2, 1024));
    }

    #[test]
    fn test_boot_args_with_static_ip() {
        let net = GuestNetwork {
            ip: Ipv4Addr::new(10, 0, 0, 5),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
        };
        let boot = BootSource::new("/k/vmlinux".into(), Some(&net));
        assert_eq!(
            boot.boot_args,
            "console=ttyS0 reboot=k panic=1 pci=off ip=10.0.0.5::10.0.0.1:255.255.255.0::eth0:off"
        );

        let boot = BootSource::new("/k/vmlinux".into(), None);
        assert!(!boot.boot_args.contains("ip="));
    }

    #[test]
    fn test_wire_shapes() {
        let iface = NetworkInterface::new("vn0123").with_mac("02:00:00:00:00:01");
        let json = serde_json::to_value(&iface).unwrap();
        assert_eq!(json["iface_id"], "eth0");
        assert_eq!(json["host_dev_name"], "vn0123");

        let json = serde_json::to_value(MmdsConfig::default()).unwrap();
        assert_eq!(json, serde_json::json!({"version": "V2", "network_interfaces": ["eth0"]}));

        let json = serde_json::to_value(DriveConfig::root_disk("/d/rootfs.ext4".into())).unwrap();
        assert_eq!(json["is_root_device"], true);
        assert_eq!(json["is_read_only"], false);
    }
}
