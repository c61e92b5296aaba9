//! Device identity: IP and MAC address

use std::fs;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::path::Path;

use log::debug;

/// Fallback when no route is available
pub const FALLBACK_IP: &str = "127.0.0.1";
/// Fallback when no interface reports a hardware address
pub const FALLBACK_MAC: &str = "00:00:00:00:00:00";

const NET_CLASS_DIR: &str = "/sys/class/net";

/// Address the default route would leave from
///
/// Connecting a UDP socket sends nothing; it only selects the outgoing
/// interface.
pub fn local_ip() -> String {
    let lookup = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(("8.8.8.8", 80))?;
        Ok(socket.local_addr()?.ip())
    };

    match lookup() {
        Ok(ip) => ip.to_string(),
        Err(err) => {
            debug!("IP lookup failed ({}), using {}", err, FALLBACK_IP);
            FALLBACK_IP.to_string()
        }
    }
}

/// MAC of the first non-loopback interface
pub fn mac_address() -> String {
    mac_address_in(Path::new(NET_CLASS_DIR))
}

/// [`mac_address`] over an arbitrary `net` class directory
pub fn mac_address_in(dir: &Path) -> String {
    let Ok(entries) = fs::read_dir(dir) else {
        return FALLBACK_MAC.to_string();
    };

    let mut names: Vec<_> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    names
        .iter()
        .filter_map(|name| fs::read_to_string(dir.join(name).join("address")).ok())
        .map(|address| address.trim().to_string())
        .find(|address| !address.is_empty() && address != FALLBACK_MAC)
        .unwrap_or_else(|| FALLBACK_MAC.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn interface(dir: &Path, name: &str, address: &str) {
        fs::create_dir_all(dir.join(name)).unwrap();
        fs::write(dir.join(name).join("address"), format!("{}\n", address)).unwrap();
    }

    #[test]
    fn loopback_and_zero_addresses_are_skipped() {
        let dir = TempDir::new().unwrap();
        interface(dir.path(), "lo", "00:00:00:00:00:00");
        interface(dir.path(), "dummy0", "00:00:00:00:00:00");
        interface(dir.path(), "eth0", "b8:27:eb:12:34:56");
        interface(dir.path(), "wlan0", "b8:27:eb:ab:cd:ef");

        assert_eq!(mac_address_in(dir.path()), "b8:27:eb:12:34:56");
    }

    #[test]
    fn missing_directory_falls_back() {
        let dir = TempDir::new().unwrap();
        assert_eq!(mac_address_in(&dir.path().join("absent")), FALLBACK_MAC);
    }

    #[test]
    fn local_ip_is_an_address() {
        assert!(local_ip().parse::<IpAddr>().is_ok());
    }
}
