//! Asynchronous name resolution contracts.

use carta_core::CartaError;
use carta_core::CartaResult;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::net::ToSocketAddrs;
use tracing::debug;

/// Identifies one outstanding lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolveTicket(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveEvent {
    Resolved {
        ticket: ResolveTicket,
        addresses: Vec<IpAddr>,
    },
    Failed {
        ticket: ResolveTicket,
        error: CartaError,
    },
}

impl ResolveEvent {
    pub fn ticket(&self) -> ResolveTicket {
        match self {
            Self::Resolved { ticket, .. } | Self::Failed { ticket, .. } => *ticket,
        }
    }
}

/// Name resolution abstraction.
///
/// `start` never reports the outcome itself; results surface from a later
/// `poll`.
pub trait NameResolver {
    fn start(&mut self, host: &str) -> CartaResult<ResolveTicket>;

    fn cancel(&mut self, ticket: ResolveTicket);

    fn poll(&mut self) -> Vec<ResolveEvent>;
}

/// Uses the operating system resolver.
///
/// The lookup itself runs inside `start`; only the notification is deferred.
#[derive(Debug, Default)]
pub struct SystemResolver {
    next_ticket: u64,
    ready: VecDeque<ResolveEvent>,
}

impl NameResolver for SystemResolver {
    fn start(&mut self, host: &str) -> CartaResult<ResolveTicket> {
        self.next_ticket = self.next_ticket.saturating_add(1);
        let ticket = ResolveTicket(self.next_ticket);

        let query = format!("{host}:0");
        let event = match query.to_socket_addrs() {
            Ok(addresses) => {
                let addresses: Vec<IpAddr> = addresses.map(|address| address.ip()).collect();
                if addresses.is_empty() {
                    ResolveEvent::Failed {
                        ticket,
                        error: CartaError::network(
                            "net.dns.no_results",
                            format!("resolver returned no addresses for `{host}`"),
                        ),
                    }
                } else {
                    ResolveEvent::Resolved { ticket, addresses }
                }
            }
            Err(error) => ResolveEvent::Failed {
                ticket,
                error: CartaError::network(
                    "net.dns.resolve_failed",
                    format!("failed to resolve `{host}`: {error}"),
                ),
            },
        };

        self.ready.push_back(event);
        Ok(ticket)
    }

    fn cancel(&mut self, ticket: ResolveTicket) {
        self.ready.retain(|event| event.ticket() != ticket);
    }

    fn poll(&mut self) -> Vec<ResolveEvent> {
        self.ready.drain(..).collect()
    }
}

/// Table-driven resolver for tests and offline setups.
///
/// Unknown hosts fail with `net.dns.no_results`.
#[derive(Debug, Default)]
pub struct StaticResolver {
    table: HashMap<String, Vec<IpAddr>>,
    next_ticket: u64,
    ready: VecDeque<ResolveEvent>,
    started: Vec<String>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addresses: Vec<IpAddr>) -> Self {
        self.insert(host, addresses);
        self
    }

    pub fn insert(&mut self, host: &str, addresses: Vec<IpAddr>) {
        self.table.insert(host.to_ascii_lowercase(), addresses);
    }

    /// Hosts passed to `start`, in call order.
    pub fn started(&self) -> &[String] {
        &self.started
    }
}

impl NameResolver for StaticResolver {
    fn start(&mut self, host: &str) -> CartaResult<ResolveTicket> {
        self.next_ticket = self.next_ticket.saturating_add(1);
        let ticket = ResolveTicket(self.next_ticket);
        let key = host.to_ascii_lowercase();
        self.started.push(key.clone());

        let event = match self.table.get(&key) {
            Some(addresses) if !addresses.is_empty() => ResolveEvent::Resolved {
                ticket,
                addresses: addresses.clone(),
            },
            _ => ResolveEvent::Failed {
                ticket,
                error: CartaError::network(
                    "net.dns.no_results",
                    format!("no static addresses for `{host}`"),
                ),
            },
        };

        debug!(host, ticket = ticket.0, "static resolve queued");
        self.ready.push_back(event);
        Ok(ticket)
    }

    fn cancel(&mut self, ticket: ResolveTicket) {
        self.ready.retain(|event| event.ticket() != ticket);
    }

    fn poll(&mut self) -> Vec<ResolveEvent> {
        self.ready.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::NameResolver;
    use super::ResolveEvent;
    use super::StaticResolver;
    use std::net::IpAddr;
    use std::net::Ipv4Addr;

    #[test]
    fn static_resolver_defers_results_to_poll() {
        let address = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        let mut resolver = StaticResolver::new().with_host("Example.com", vec![address]);

        let ticket = match resolver.start("example.com") {
            Ok(value) => value,
            Err(error) => panic!("{error}"),
        };
        let events = resolver.poll();
        assert_eq!(
            events,
            vec![ResolveEvent::Resolved {
                ticket,
                addresses: vec![address]
            }]
        );
        assert!(resolver.poll().is_empty());
    }

    #[test]
    fn unknown_host_fails() {
        let mut resolver = StaticResolver::new();
        assert!(resolver.start("nowhere.invalid").is_ok());
        let events = resolver.poll();
        assert!(matches!(
            events.as_slice(),
            [ResolveEvent::Failed { error, .. }] if error.code == "net.dns.no_results"
        ));
    }

    #[test]
    fn cancel_drops_pending_result() {
        let mut resolver = StaticResolver::new();
        let ticket = resolver
            .start("a.example")
            .unwrap_or_else(|_| unreachable!());
        resolver.cancel(ticket);
        assert!(resolver.poll().is_empty());
        assert_eq!(resolver.started(), ["a.example".to_owned()]);
    }
}
