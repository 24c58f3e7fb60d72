//! Shared per-host state.

use carta_net::NetType;
use carta_security::Advisory;
use carta_security::FraudList;
use carta_security::FraudMatch;
use carta_security::TrustRating;
use std::cell::Cell;
use std::cell::Ref;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// One host name, shared by every resource on that host.
///
/// The trust fields change when a reputation check completes, so two reads
/// may observe different snapshots.
#[derive(Debug)]
pub struct ServerName {
    name: String,
    trust: Cell<TrustRating>,
    trust_expires: Cell<Option<u64>>,
    bypassed: Cell<bool>,
    net_type: Cell<NetType>,
    fraud: RefCell<FraudList>,
}

impl ServerName {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            trust: Cell::new(TrustRating::NotSet),
            trust_expires: Cell::new(None),
            bypassed: Cell::new(false),
            net_type: Cell::new(NetType::Undetermined),
            fraud: RefCell::new(FraudList::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trust_rating(&self) -> TrustRating {
        self.trust.get()
    }

    /// Records a rating valid until `expires` (seconds since the epoch).
    pub fn set_trust_rating(&self, rating: TrustRating, expires: Option<u64>) {
        self.trust.set(rating);
        self.trust_expires.set(expires);
    }

    pub fn trust_expires(&self) -> Option<u64> {
        self.trust_expires.get()
    }

    /// True when the cached rating is missing or past its client expiry.
    pub fn needs_online_check(&self, now: u64) -> bool {
        match self.trust.get() {
            TrustRating::NotSet => true,
            _ => self.trust_expires.get().is_some_and(|expires| now >= expires),
        }
    }

    /// Rating for one URL on this host, given as `host/path`.
    ///
    /// A host with listed URLs only rates the listed ones as untrusted.
    pub fn trust_rating_for(&self, url_key: &str) -> TrustRating {
        match self.trust.get() {
            TrustRating::UntrustedAskAdvisory => {
                if self.fraud.borrow().match_url(url_key).is_some() {
                    TrustRating::UntrustedAskAdvisory
                } else {
                    TrustRating::NoFraud
                }
            }
            other => other,
        }
    }

    pub fn set_trust_rating_bypassed(&self, bypassed: bool) {
        self.bypassed.set(bypassed);
    }

    pub fn is_trust_rating_bypassed(&self) -> bool {
        self.bypassed.get()
    }

    pub fn net_type(&self) -> NetType {
        self.net_type.get()
    }

    pub fn set_net_type(&self, net_type: NetType) {
        self.net_type.set(net_type);
    }

    pub fn fraud_list(&self) -> Ref<'_, FraudList> {
        self.fraud.borrow()
    }

    pub fn merge_fraud_list(&self, list: FraudList) {
        self.fraud.borrow_mut().merge(list);
    }

    pub fn add_advisory(&self, advisory: Advisory) {
        self.fraud.borrow_mut().add_advisory(advisory);
    }

    pub fn is_url_in_fraud_list(&self, url_key: &str) -> Option<u32> {
        self.fraud.borrow().is_url_listed(url_key)
    }

    pub fn match_fraud_url(&self, url_key: &str) -> Option<FraudMatch> {
        self.fraud.borrow().match_url(url_key)
    }

    /// Advisory joined to the blacklist entry matching `url_key`.
    pub fn advisory_for(&self, url_key: &str) -> Option<Advisory> {
        let list = self.fraud.borrow();
        list.match_url(url_key)
            .and_then(|found| list.advisory(found.source_id).cloned())
    }
}

/// Interns [`ServerName`] entries by lower-cased host.
#[derive(Debug, Default)]
pub struct ServerNameRegistry {
    names: RefCell<HashMap<String, Rc<ServerName>>>,
}

impl ServerNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, host: &str) -> Rc<ServerName> {
        let key = host.to_ascii_lowercase();
        let mut names = self.names.borrow_mut();
        Rc::clone(
            names
                .entry(key)
                .or_insert_with_key(|key| Rc::new(ServerName::new(key))),
        )
    }

    pub fn find(&self, host: &str) -> Option<Rc<ServerName>> {
        self.names.borrow().get(&host.to_ascii_lowercase()).cloned()
    }

    pub fn len(&self) -> usize {
        self.names.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.borrow().is_empty()
    }

    /// Drops hosts no resource refers to and that carry no trust state.
    pub fn prune(&self) -> usize {
        let mut names = self.names.borrow_mut();
        let before = names.len();
        names.retain(|_, server| {
            Rc::strong_count(server) > 1
                || server.trust_rating() != TrustRating::NotSet
                || server.is_trust_rating_bypassed()
        });
        before - names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::ServerNameRegistry;
    use carta_security::FraudList;
    use carta_security::TrustRating;
    use std::rc::Rc;

    #[test]
    fn registry_interns_case_insensitively() {
        let registry = ServerNameRegistry::new();
        let first = registry.get_or_create("Example.COM");
        let second = registry.get_or_create("example.com");
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(first.name(), "example.com");
    }

    #[test]
    fn rating_expires_after_client_expiry() {
        let registry = ServerNameRegistry::new();
        let server = registry.get_or_create("a.test");
        assert!(server.needs_online_check(0));
        server.set_trust_rating(TrustRating::NoFraud, Some(100));
        assert!(!server.needs_online_check(99));
        assert!(server.needs_online_check(100));
    }

    #[test]
    fn ask_advisory_only_applies_to_listed_urls() {
        let registry = ServerNameRegistry::new();
        let server = registry.get_or_create("mixed.test");
        let mut list = FraudList::new();
        list.add_url("mixed.test/bad", 3);
        server.merge_fraud_list(list);
        server.set_trust_rating(TrustRating::UntrustedAskAdvisory, None);

        assert_eq!(
            server.trust_rating_for("mixed.test/bad"),
            TrustRating::UntrustedAskAdvisory
        );
        assert_eq!(server.trust_rating_for("mixed.test/good"), TrustRating::NoFraud);
        assert_eq!(server.is_url_in_fraud_list("mixed.test/bad"), Some(3));
    }

    #[test]
    fn prune_keeps_rated_hosts() {
        let registry = ServerNameRegistry::new();
        registry
            .get_or_create("rated.test")
            .set_trust_rating(TrustRating::Phishing, None);
        let _ = registry.get_or_create("plain.test");
        assert_eq!(registry.prune(), 1);
        assert!(registry.find("rated.test").is_some());
        assert!(registry.find("plain.test").is_none());
    }
}
