use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Named classes of configuration intent (`network`, `hosts`, ...).
pub type CapabilitySet = BTreeSet<String>;

/// Every capability the built-in handlers understand.
pub const DEFAULT_FUNCTIONS: &[&str] = &[
    "network",
    "hosts",
    "hostname",
    "resolvers",
    "password",
    "file",
    "update",
    "version",
    "features",
];

/// Parse a comma separated capability list, ignoring blanks.
pub fn parse_functions(list: &str) -> CapabilitySet {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn default_functions() -> CapabilitySet {
    DEFAULT_FUNCTIONS.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    Ipv4,
    Ipv6,
}

impl IpVersion {
    /// Guess the family from the textual form of an address.
    pub fn of(address: &str) -> Self {
        if address.contains(':') {
            IpVersion::Ipv6
        } else {
            IpVersion::Ipv4
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IpVersion::Ipv4 => "ipv4",
            IpVersion::Ipv6 => "ipv6",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub cidr: String,
    pub version: IpVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    /// Destination CIDR or `default`.
    pub destination: String,
    pub gateway: String,
    pub version: IpVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolver {
    pub address: String,
    pub version: IpVersion,
    pub interface: String,
}

/// Normalized intent for one inbound message.
///
/// `ips` and `routes` never hold an interface with an empty sequence; use
/// [`ConfigurationRecord::add_address`] and [`ConfigurationRecord::add_route`]
/// or call [`ConfigurationRecord::prune`] after touching the maps directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfigurationRecord {
    pub function: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub ips: BTreeMap<String, Vec<Address>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub routes: BTreeMap<String, Vec<Route>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub resolvers: Vec<Resolver>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl ConfigurationRecord {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            ..Default::default()
        }
    }

    pub fn add_address(&mut self, interface: &str, address: Address) {
        self.ips
            .entry(interface.to_string())
            .or_default()
            .push(address);
    }

    pub fn add_route(&mut self, interface: &str, route: Route) {
        self.routes
            .entry(interface.to_string())
            .or_default()
            .push(route);
    }

    pub fn add_resolver(&mut self, resolver: Resolver) {
        if !self.resolvers.contains(&resolver) {
            self.resolvers.push(resolver);
        }
    }

    /// Drop interfaces that ended up without addresses or routes.
    pub fn prune(&mut self) {
        self.ips.retain(|_, v| !v.is_empty());
        self.routes.retain(|_, v| !v.is_empty());
    }

    /// Fold a per-interface record into this one.
    ///
    /// Address and route maps are merged per interface, resolvers are
    /// appended, and scalar fields from `other` overwrite ours when present.
    pub fn merge(&mut self, other: ConfigurationRecord) {
        for (interface, addresses) in other.ips {
            self.ips.insert(interface, addresses);
        }
        for (interface, routes) in other.routes {
            self.routes.insert(interface, routes);
        }
        for resolver in other.resolvers {
            self.add_resolver(resolver);
        }
        if !other.function.is_empty() {
            self.function = other.function;
        }
        if other.arguments.is_some() {
            self.arguments = other.arguments;
        }
        if other.hostname.is_some() {
            self.hostname = other.hostname;
        }
        if other.password.is_some() {
            self.password = other.password;
        }
        self.prune();
    }

    /// Whether the named record field carries a value.
    ///
    /// Used by handler runnability checks that only care about presence.
    pub fn has(&self, field: &str) -> bool {
        match field {
            "function" => !self.function.is_empty(),
            "arguments" => self.arguments.is_some(),
            "ips" => !self.ips.is_empty(),
            "routes" => !self.routes.is_empty(),
            "resolvers" => !self.resolvers.is_empty(),
            "hostname" => self.hostname.is_some(),
            "password" => self.password.is_some(),
            _ => false,
        }
    }
}
