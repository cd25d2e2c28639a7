use crate::error::{AgentError, Result};
use crate::record::{Address, ConfigurationRecord, IpVersion, Resolver, Route};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, trace, warn};

/// Default location of the kernel's network interface table.
pub const SYS_CLASS_NET: &str = "/sys/class/net";

const ZERO_MAC: &str = "00:00:00:00:00:00";

/// Local interfaces keyed by lowercase MAC address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceTable {
    by_mac: BTreeMap<String, String>,
}

impl InterfaceTable {
    /// Read `<dir>/<iface>/address` for every interface under `dir`.
    ///
    /// Interfaces whose address cannot be read are skipped.
    pub fn scan(dir: &Path) -> Self {
        let mut table = Self::default();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cannot read interface table");
                return table;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            match std::fs::read_to_string(entry.path().join("address")) {
                Ok(mac) => table.insert(mac.trim(), &name),
                Err(e) => trace!(interface = %name, error = %e, "No address for interface"),
            }
        }

        debug!(interfaces = ?table.by_mac, "Scanned local interfaces");
        table
    }

    pub fn from_pairs<I, M, N>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (M, N)>,
        M: AsRef<str>,
        N: AsRef<str>,
    {
        let mut table = Self::default();
        for (mac, name) in pairs {
            table.insert(mac.as_ref(), name.as_ref());
        }
        table
    }

    fn insert(&mut self, mac: &str, name: &str) {
        self.by_mac.insert(mac.to_ascii_lowercase(), name.to_string());
    }

    pub fn lookup(&self, mac: &str) -> Option<&str> {
        self.by_mac
            .get(&mac.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    /// MAC addresses of real interfaces (loopback and friends report all zeros).
    pub fn macs(&self) -> impl Iterator<Item = &str> {
        self.by_mac
            .keys()
            .map(String::as_str)
            .filter(|mac| *mac != ZERO_MAC)
    }

    pub fn is_empty(&self) -> bool {
        self.by_mac.is_empty()
    }
}

/// Join an address and a netmask into CIDR notation.
///
/// The netmask is either a prefix length (`"64"`) or a dotted quad whose set
/// bits are counted (`"255.255.255.0"` → 24).
pub fn cidr(ip: &str, netmask: &str) -> Result<String> {
    let netmask = netmask.trim();
    let prefix = match netmask.parse::<u32>() {
        Ok(prefix) => prefix,
        Err(_) => {
            let octets: Vec<u8> = netmask
                .split('.')
                .map(|o| o.parse::<u8>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|_| AgentError::Other(format!("invalid netmask '{}'", netmask)))?;
            if octets.len() != 4 {
                return Err(AgentError::Other(format!("invalid netmask '{}'", netmask)));
            }
            u32::from_be_bytes([octets[0], octets[1], octets[2], octets[3]]).count_ones()
        }
    };
    Ok(format!("{}/{}", ip, prefix))
}

/// Translate one raw payload into a configuration record.
pub fn translate(payload: &[u8], interfaces: &InterfaceTable) -> ConfigurationRecord {
    let parsed: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Payload is not valid JSON");
            return ConfigurationRecord::default();
        }
    };
    translate_value(&parsed, interfaces)
}

pub fn translate_value(parsed: &Value, interfaces: &InterfaceTable) -> ConfigurationRecord {
    let mut record = ConfigurationRecord::default();

    match parsed.get("name").and_then(Value::as_str) {
        Some(name) => record.function = name.to_string(),
        None => debug!("Message carries no 'name'"),
    }

    match parsed.get("value") {
        Some(Value::String(s)) => record.arguments = Some(s.clone()),
        Some(Value::Null) | None => debug!("Message carries no 'value'"),
        Some(other) => record.arguments = Some(other.to_string()),
    }

    if let Some(hostname) = parsed.get("hostname").and_then(Value::as_str) {
        record.hostname = Some(hostname.to_string());
    }

    let Some(mac) = parsed.get("mac").and_then(Value::as_str) else {
        trace!("Message carries no 'mac'");
        return record;
    };

    let Some(interface) = interfaces.lookup(mac) else {
        info!(mac = %mac, "MAC does not belong to a local interface, skipping its addresses");
        return record;
    };

    for (key, version) in [("ips", IpVersion::Ipv4), ("ip6s", IpVersion::Ipv6)] {
        for entry in array(parsed, key) {
            let (Some(ip), Some(netmask)) = (text(entry, "ip"), text(entry, "netmask")) else {
                warn!(field = key, entry = %entry, "Address entry lacks 'ip' or 'netmask'");
                continue;
            };
            match cidr(&ip, &netmask) {
                Ok(cidr) => record.add_address(interface, Address { cidr, version }),
                Err(e) => warn!(field = key, error = %e, "Skipping address entry"),
            }
            if let Some(gateway) = text(entry, "gateway") {
                record.add_route(interface, default_route(gateway, version));
            }
        }
    }

    if let Some(gateway) = text(parsed, "gateway") {
        let version = IpVersion::of(&gateway);
        record.add_route(interface, default_route(gateway, version));
    }

    for entry in array(parsed, "routes") {
        let (Some(route), Some(netmask), Some(gateway)) = (
            text(entry, "route"),
            text(entry, "netmask"),
            text(entry, "gateway"),
        ) else {
            warn!(entry = %entry, "Route entry lacks 'route', 'netmask' or 'gateway'");
            continue;
        };
        match cidr(&route, &netmask) {
            Ok(destination) => record.add_route(
                interface,
                Route {
                    destination,
                    gateway,
                    version: IpVersion::Ipv4,
                },
            ),
            Err(e) => warn!(error = %e, "Skipping route entry"),
        }
    }

    for entry in array(parsed, "dns") {
        if let Some(address) = entry.as_str() {
            record.add_resolver(Resolver {
                address: address.to_string(),
                version: IpVersion::of(address),
                interface: interface.to_string(),
            });
        }
    }

    record.prune();
    debug!(function = %record.function, interface = %interface, "Translated message");
    record
}

fn default_route(gateway: String, version: IpVersion) -> Route {
    Route {
        destination: "default".to_string(),
        gateway,
        version,
    }
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// String or number field rendered as text.
fn text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC: &str = r#"{
        "label": "public",
        "ips": [{"netmask": "255.255.255.0", "enabled": "1", "ip": "198.101.227.76"}],
        "mac": "40:40:97:83:78:2E",
        "ip6s": [{"netmask": "96", "enabled": "0",
                  "ip": "2001:4800:780F:0511:1E87:052F:FF83:782E", "gateway": "fe80::def"}],
        "gateway": "198.101.227.1",
        "dns": ["72.3.128.240", "72.3.128.241"]
    }"#;

    const PRIVATE: &str = r#"{
        "label": "private",
        "ips": [{"netmask": "255.255.128.0", "enabled": "1", "ip": "10.180.144.116"}],
        "routes": [
            {"route": "10.176.0.0", "netmask": "255.240.0.0", "gateway": "10.180.128.1"},
            {"route": "10.191.192.0", "netmask": "255.255.192.0", "gateway": "10.180.128.1"}
        ],
        "mac": "40:40:a1:47:e2:af"
    }"#;

    fn table() -> InterfaceTable {
        InterfaceTable::from_pairs([
            ("40:40:97:83:78:2e", "eth0"),
            ("40:40:a1:47:e2:af", "eth1"),
            ("00:00:00:00:00:00", "lo"),
        ])
    }

    #[test]
    fn test_cidr_dotted_quad() {
        assert_eq!(
            cidr("198.101.227.76", "255.255.255.0").unwrap(),
            "198.101.227.76/24"
        );
        assert_eq!(cidr("10.176.0.0", "255.240.0.0").unwrap(), "10.176.0.0/12");
    }

    #[test]
    fn test_cidr_integer_passes_through() {
        assert_eq!(cidr("fe80::1", "64").unwrap(), "fe80::1/64");
    }

    #[test]
    fn test_cidr_prefix_matches_popcount() {
        for prefix in 0..=32u32 {
            let mask: u32 = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            let dotted = std::net::Ipv4Addr::from(mask).to_string();
            let result = cidr("10.0.0.1", &dotted).unwrap();
            let got: u32 = result.rsplit('/').next().unwrap().parse().unwrap();
            assert_eq!(got, mask.count_ones());
        }
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!(cidr("10.0.0.1", "255.255.0").is_err());
        assert!(cidr("10.0.0.1", "mask").is_err());
    }

    #[test]
    fn test_name_and_value() {
        let record = translate(br#"{"name":"version","value":"agent"}"#, &table());
        assert_eq!(record.function, "version");
        assert_eq!(record.arguments.as_deref(), Some("agent"));
        assert!(record.ips.is_empty());
    }

    #[test]
    fn test_malformed_payload_degrades() {
        let record = translate(b"not json", &table());
        assert!(record.function.is_empty());
        assert_eq!(record, ConfigurationRecord::default());
    }

    #[test]
    fn test_public_interface() {
        let record = translate(PUBLIC.as_bytes(), &table());

        let eth0 = &record.ips["eth0"];
        assert_eq!(eth0.len(), 2);
        assert_eq!(eth0[0].cidr, "198.101.227.76/24");
        assert_eq!(eth0[0].version, IpVersion::Ipv4);
        assert_eq!(eth0[1].cidr, "2001:4800:780F:0511:1E87:052F:FF83:782E/96");
        assert_eq!(eth0[1].version, IpVersion::Ipv6);

        let routes = &record.routes["eth0"];
        assert!(routes.contains(&Route {
            destination: "default".into(),
            gateway: "fe80::def".into(),
            version: IpVersion::Ipv6,
        }));
        assert!(routes.contains(&Route {
            destination: "default".into(),
            gateway: "198.101.227.1".into(),
            version: IpVersion::Ipv4,
        }));

        assert_eq!(record.resolvers.len(), 2);
        assert_eq!(record.resolvers[0].interface, "eth0");
    }

    #[test]
    fn test_private_routes() {
        let record = translate(PRIVATE.as_bytes(), &table());
        let routes = &record.routes["eth1"];
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].destination, "10.176.0.0/12");
        assert_eq!(routes[1].destination, "10.191.192.0/18");
        assert_eq!(routes[1].gateway, "10.180.128.1");
        assert!(record.resolvers.is_empty());
    }

    #[test]
    fn test_single_address_known_mac() {
        let payload = r#"{"mac":"40:40:97:83:78:2e","ips":[{"ip":"10.0.0.5","netmask":"255.255.255.0"}]}"#;
        let record = translate(payload.as_bytes(), &table());
        assert_eq!(record.ips.len(), 1);
        assert_eq!(
            record.ips["eth0"],
            vec![Address {
                cidr: "10.0.0.5/24".into(),
                version: IpVersion::Ipv4
            }]
        );
    }

    #[test]
    fn test_unknown_mac_prunes_ips() {
        let payload = r#"{"mac":"de:ad:be:ef:00:01","ips":[{"ip":"10.0.0.5","netmask":"255.255.255.0"}]}"#;
        let record = translate(payload.as_bytes(), &table());
        assert!(record.ips.is_empty());
        assert!(record.routes.is_empty());
        assert!(!record.has("ips"));
    }

    #[test]
    fn test_scan_reads_sysfs_layout() {
        let dir = tempfile::tempdir().unwrap();
        for (name, mac) in [("eth0", "52:54:00:12:34:56\n"), ("lo", "00:00:00:00:00:00\n")] {
            std::fs::create_dir(dir.path().join(name)).unwrap();
            std::fs::write(dir.path().join(name).join("address"), mac).unwrap();
        }
        std::fs::create_dir(dir.path().join("bond0")).unwrap();

        let table = InterfaceTable::scan(dir.path());
        assert_eq!(table.lookup("52:54:00:12:34:56"), Some("eth0"));
        assert_eq!(table.macs().collect::<Vec<_>>(), vec!["52:54:00:12:34:56"]);
    }
}
