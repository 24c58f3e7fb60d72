//! Network-type classification of hosts and addresses.

use std::net::IpAddr;
use url::Host;

/// Where an address lives relative to this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetType {
    Localhost,
    Private,
    Public,
    Undetermined,
}

impl NetType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Localhost => "localhost",
            Self::Private => "private",
            Self::Public => "public",
            Self::Undetermined => "undetermined",
        }
    }

    pub fn from_type_name(value: &str) -> Option<Self> {
        match value {
            "localhost" => Some(Self::Localhost),
            "private" => Some(Self::Private),
            "public" => Some(Self::Public),
            "undetermined" => Some(Self::Undetermined),
            _ => None,
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Localhost => 1,
            Self::Private => 2,
            Self::Public => 3,
            Self::Undetermined => 0,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Localhost,
            2 => Self::Private,
            3 => Self::Public,
            _ => Self::Undetermined,
        }
    }

    /// Local addresses are never sent to external reputation services.
    pub fn is_local(self) -> bool {
        matches!(self, Self::Localhost | Self::Private)
    }

    /// Whether a load limited to `self` may reach an address of type `target`.
    ///
    /// A limit of `Public` refuses private and loopback targets, `Private`
    /// refuses loopback. `Undetermined` on either side never refuses.
    pub fn allows(self, target: NetType) -> bool {
        match (self, target) {
            (Self::Undetermined, _) | (_, Self::Undetermined) => true,
            (Self::Public, Self::Public) => true,
            (Self::Public, _) => false,
            (Self::Private, Self::Localhost) => false,
            _ => true,
        }
    }
}

pub fn classify_ip(address: IpAddr) -> NetType {
    match address {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_unspecified() {
                NetType::Localhost
            } else if v4.is_private() || v4.is_link_local() {
                NetType::Private
            } else {
                NetType::Public
            }
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return classify_ip(IpAddr::V4(mapped));
            }
            if v6.is_loopback() || v6.is_unspecified() {
                NetType::Localhost
            } else if v6.is_unique_local() || v6.is_unicast_link_local() {
                NetType::Private
            } else {
                NetType::Public
            }
        }
    }
}

/// Classifies a host name without resolving it.
///
/// Names are `Undetermined` unless they are address literals or reserved
/// local names.
pub fn classify_host(host: &str) -> NetType {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return NetType::Localhost;
    }
    if host.ends_with(".local") {
        return NetType::Private;
    }

    match Host::parse(&host) {
        Ok(Host::Ipv4(v4)) => classify_ip(IpAddr::V4(v4)),
        Ok(Host::Ipv6(v6)) => classify_ip(IpAddr::V6(v6)),
        _ => NetType::Undetermined,
    }
}

/// Most local type among resolved addresses.
pub fn classify_addresses(addresses: &[IpAddr]) -> NetType {
    let mut result = NetType::Undetermined;
    for address in addresses {
        let kind = classify_ip(*address);
        result = match (result, kind) {
            (NetType::Localhost, _) | (_, NetType::Localhost) => NetType::Localhost,
            (NetType::Private, _) | (_, NetType::Private) => NetType::Private,
            _ => NetType::Public,
        };
    }
    result
}

#[cfg(test)]
mod tests {
    use super::NetType;
    use super::classify_addresses;
    use super::classify_host;
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    #[test]
    fn classifies_reserved_names_and_literals() {
        assert_eq!(classify_host("localhost"), NetType::Localhost);
        assert_eq!(classify_host("printer.local."), NetType::Private);
        assert_eq!(classify_host("127.0.0.1"), NetType::Localhost);
        assert_eq!(classify_host("[::1]"), NetType::Localhost);
        assert_eq!(classify_host("10.1.2.3"), NetType::Private);
        assert_eq!(classify_host("192.168.0.10"), NetType::Private);
        assert_eq!(classify_host("93.184.216.34"), NetType::Public);
        assert_eq!(classify_host("example.com"), NetType::Undetermined);
    }

    #[test]
    fn mixed_addresses_pick_most_local() {
        let addresses = [
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
        ];
        assert_eq!(classify_addresses(&addresses), NetType::Private);
        assert_eq!(classify_addresses(&[]), NetType::Undetermined);
    }

    #[test]
    fn public_limit_refuses_local_targets() {
        assert!(!NetType::Public.allows(NetType::Private));
        assert!(!NetType::Public.allows(NetType::Localhost));
        assert!(!NetType::Private.allows(NetType::Localhost));
        assert!(NetType::Private.allows(NetType::Public));
        assert!(NetType::Localhost.allows(NetType::Localhost));
        assert!(NetType::Public.allows(NetType::Undetermined));
    }

    #[test]
    fn numeric_form_round_trips() {
        for kind in [NetType::Localhost, NetType::Private, NetType::Public] {
            assert_eq!(NetType::from_u32(kind.to_u32()), kind);
        }
    }
}
