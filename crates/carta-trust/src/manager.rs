//! Navigation-time trust decisions and the checks behind them.

use crate::TrustConfig;
use crate::checker::CheckContext;
use crate::checker::CheckOutcome;
use crate::checker::CheckerId;
use crate::checker::ServerTrustChecker;
use crate::normalize::url_key;
use crate::throttle::RequestThrottler;
use carta_core::CartaError;
use carta_core::CartaResult;
use carta_net::NameResolver;
use carta_net::NetType;
use carta_net::nettype::classify_host;
use carta_security::Advisory;
use carta_security::SecurityPolicy;
use carta_security::TrustRating;
use carta_url::Handle;
use carta_url::NameVariant;
use carta_url::ServerName;
use carta_url::UintAttr;
use carta_url::UrlAttr;
use carta_url::UrlManager;
use carta_url::UrlType;
use std::rc::Rc;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Name of generated fraud warning documents.
pub const WARNING_PAGE_URL: &str = "about:site-warning";

const WARNING_PAGE_MIME: &str = "text/html; charset=utf-8";

/// What a navigation may do right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDecision {
    /// A rating is known or no check is wanted.
    Rated(TrustRating),
    /// A check is in flight; a [`TrustVerdict`] follows from
    /// [`TrustCheckManager::process`].
    Pending,
    /// The URL is listed. `warning` is the page to show instead.
    Blocked { rating: TrustRating, warning: Handle },
}

/// Result of a finished check for one waiting URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustVerdict {
    pub url: Handle,
    pub rating: TrustRating,
    pub advisory: Option<Advisory>,
    /// Generated for the current navigation when it is blocked.
    pub warning: Option<Handle>,
}

/// Owns the running checks and the request backoff.
pub struct TrustCheckManager {
    config: TrustConfig,
    policy: SecurityPolicy,
    throttler: RequestThrottler,
    checkers: Vec<ServerTrustChecker>,
    next_id: u32,
    resolver: Box<dyn NameResolver>,
    /// Verdicts settled by a `process` call that then failed.
    undelivered: Vec<TrustVerdict>,
}

impl core::fmt::Debug for TrustCheckManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TrustCheckManager")
            .field("config", &self.config)
            .field("policy", &self.policy)
            .field("throttler", &self.throttler)
            .field("checkers", &self.checkers)
            .finish_non_exhaustive()
    }
}

impl TrustCheckManager {
    pub fn new(
        config: TrustConfig,
        policy: SecurityPolicy,
        resolver: Box<dyn NameResolver>,
    ) -> CartaResult<Self> {
        config.validate()?;
        policy.validate()?;
        Ok(Self {
            throttler: RequestThrottler::new(config.throttle_min_secs, config.throttle_max_secs),
            config,
            policy,
            checkers: Vec::new(),
            next_id: 0,
            resolver,
            undelivered: Vec::new(),
        })
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }

    pub fn throttler(&self) -> &RequestThrottler {
        &self.throttler
    }

    pub fn active_checks(&self) -> usize {
        self.checkers.len()
    }

    pub fn checkers(&self) -> &[ServerTrustChecker] {
        &self.checkers
    }

    /// Decides whether `url` may be shown.
    ///
    /// A cached rating is used while it is fresh. Otherwise, when online
    /// checks are allowed, a check of the host is started or joined and
    /// [`TrustDecision::Pending`] is returned. `offline_only` forbids network
    /// checks; `force` checks even with fraud protection off.
    pub fn check_trust_rating(
        &mut self,
        urls: &mut UrlManager,
        url: &Handle,
        offline_only: bool,
        force: bool,
    ) -> CartaResult<TrustDecision> {
        if url.url_type() == UrlType::Javascript {
            return Ok(TrustDecision::Rated(TrustRating::NotSet));
        }
        let Some(server) = url.server() else {
            return Ok(TrustDecision::Rated(TrustRating::NotSet));
        };

        let now = urls.clock().now_secs();
        let online_allowed = !offline_only && (force || self.policy.fraud_protection);

        if online_allowed && server.needs_online_check(now) {
            if is_local_host(&server) {
                debug!(host = server.name(), "local host trusted without sitecheck");
                server.set_trust_rating(TrustRating::UnknownTrust, None);
                return Ok(TrustDecision::Rated(TrustRating::UnknownTrust));
            }
            if self.checkers.iter().any(|checker| checker.belongs_to_server(&server)) {
                self.add_trust_check(urls, url, &server)?;
                return Ok(TrustDecision::Pending);
            }
            if !self.throttler.allow_request_now(now) {
                info!(host = server.name(), "sitecheck skipped while throttled");
                return Ok(TrustDecision::Rated(TrustRating::UnknownTrust));
            }
            self.add_trust_check(urls, url, &server)?;
            return Ok(TrustDecision::Pending);
        }

        let (mut rating, advisory) = rate_url(&server, url);
        if rating.is_fraud() && !server.is_trust_rating_bypassed() {
            let warning = generate_warning_page(urls, url, rating, advisory.as_ref())?;
            return Ok(TrustDecision::Blocked { rating, warning });
        }
        if rating == TrustRating::NotSet && online_allowed {
            rating = TrustRating::UnknownTrust;
        }
        Ok(TrustDecision::Rated(rating))
    }

    fn add_trust_check(
        &mut self,
        urls: &mut UrlManager,
        url: &Handle,
        server: &Rc<ServerName>,
    ) -> CartaResult<()> {
        if let Some(checker) = self
            .checkers
            .iter_mut()
            .find(|checker| checker.belongs_to_server(server))
        {
            debug!(host = server.name(), "joining running sitecheck");
            checker.add_url(url);
            return Ok(());
        }

        self.next_id = self.next_id.wrapping_add(1);
        let mut checker = ServerTrustChecker::new(CheckerId(self.next_id), url)?;
        let resolve_first =
            self.config.resolve_before_check && server.net_type() == NetType::Undetermined;
        let mut ctx = CheckContext {
            urls,
            resolver: self.resolver.as_mut(),
            config: &self.config,
            max_pattern_bytes: self.policy.max_pattern_bytes,
        };
        checker.start_check(resolve_first, &mut ctx)?;
        self.checkers.push(checker);
        Ok(())
    }

    /// Advances running checks and settles the finished ones.
    ///
    /// Call after [`UrlManager::process_events`] so load messages for the
    /// sitecheck requests have been delivered.
    ///
    /// Every finished check is settled even when one of them fails. The
    /// verdicts of a failed call are returned by the next one.
    pub fn process(&mut self, urls: &mut UrlManager) -> CartaResult<Vec<TrustVerdict>> {
        let events = self.resolver.poll();
        {
            let mut ctx = CheckContext {
                urls: &mut *urls,
                resolver: self.resolver.as_mut(),
                config: &self.config,
                max_pattern_bytes: self.policy.max_pattern_bytes,
            };
            for event in &events {
                for checker in &mut self.checkers {
                    if checker.handle_resolve(event, &mut ctx) {
                        break;
                    }
                }
            }
            for checker in &mut self.checkers {
                checker.handle_messages(ctx.urls);
            }
        }

        let mut verdicts = std::mem::take(&mut self.undelivered);
        let mut failure = None;
        let mut index = 0;
        while index < self.checkers.len() {
            if self.checkers[index].is_done() {
                let checker = self.checkers.remove(index);
                if let Err(error) = self.check_done(urls, checker, &mut verdicts) {
                    failure.get_or_insert(error);
                }
            } else {
                index += 1;
            }
        }
        match failure {
            Some(error) => {
                self.undelivered = verdicts;
                Err(error)
            }
            None => Ok(verdicts),
        }
    }

    fn check_done(
        &mut self,
        urls: &mut UrlManager,
        mut checker: ServerTrustChecker,
        verdicts: &mut Vec<TrustVerdict>,
    ) -> CartaResult<()> {
        let server = Rc::clone(checker.server());
        let now = urls.clock().now_secs();

        match checker.take_outcome() {
            Some(CheckOutcome::Verified(info)) => {
                self.throttler.request_succeeded();
                let rating = if info.list.is_empty() {
                    TrustRating::NoFraud
                } else {
                    TrustRating::UntrustedAskAdvisory
                };
                let lifetime = info
                    .client_expiry
                    .unwrap_or(self.config.default_client_expiry_secs);
                if let Some(answered) = info.host.as_deref() {
                    if !answered.eq_ignore_ascii_case(server.name()) {
                        debug!(host = server.name(), answered, "sitecheck answered for another host name");
                    }
                }
                server.merge_fraud_list(info.list);
                server.set_trust_rating(rating, Some(now.saturating_add(lifetime)));
                info!(host = server.name(), rating = rating.as_str(), lifetime, "sitecheck verified");
            }
            Some(CheckOutcome::Failed(error)) => {
                self.throttler.request_failed(now);
                let retry = now.saturating_add(self.throttler.grace_period());
                server.set_trust_rating(TrustRating::UnknownTrust, Some(retry));
                warn!(host = server.name(), %error, "sitecheck failed");
            }
            Some(CheckOutcome::Unresolved(error)) => {
                let retry = now.saturating_add(self.config.throttle_min_secs);
                server.set_trust_rating(TrustRating::UnknownTrust, Some(retry));
                debug!(host = server.name(), %error, "sitecheck skipped for unresolved host");
            }
            Some(CheckOutcome::Local) => {
                server.set_trust_rating(TrustRating::UnknownTrust, None);
            }
            None => {}
        }

        let mut failure = None;
        for url in checker.urls() {
            let (rating, advisory) = rate_url(&server, url);
            let blocks = rating.is_fraud()
                && url.same_resource(checker.current())
                && !server.is_trust_rating_bypassed();
            let warning = if blocks {
                match generate_warning_page(urls, url, rating, advisory.as_ref()) {
                    Ok(page) => Some(page),
                    Err(error) => {
                        warn!(host = server.name(), %error, "warning page not generated");
                        failure.get_or_insert(error);
                        None
                    }
                }
            } else {
                None
            };
            verdicts.push(TrustVerdict {
                url: url.clone(),
                rating,
                advisory,
                warning,
            });
        }
        failure.map_or(Ok(()), Err)
    }

    /// Lets the user continue to `url` despite its rating, for the lifetime
    /// of the host entry.
    pub fn bypass(&mut self, url: &Handle) -> CartaResult<()> {
        if !self.policy.allow_warning_bypass {
            return Err(CartaError::policy(
                "trust.bypass.disallowed",
                "warning pages cannot be bypassed",
            ));
        }
        let Some(server) = url.server() else {
            return Err(CartaError::null_pointer(
                "trust.check.no_server",
                "resource has no host to bypass",
            ));
        };
        info!(host = server.name(), "trust warning bypassed");
        server.set_trust_rating_bypassed(true);
        Ok(())
    }

    /// Stops every running check. Their hosts keep whatever rating they had.
    pub fn abandon_checks(&mut self, urls: &mut UrlManager) {
        let mut ctx = CheckContext {
            urls,
            resolver: self.resolver.as_mut(),
            config: &self.config,
            max_pattern_bytes: self.policy.max_pattern_bytes,
        };
        for checker in &mut self.checkers {
            checker.abandon(&mut ctx);
        }
        self.checkers.clear();
    }
}

fn is_local_host(server: &ServerName) -> bool {
    server.net_type().is_local() || classify_host(server.name()).is_local()
}

/// Rating of one URL from its host's cached state, with the advisory of the
/// matching blacklist entry.
fn rate_url(server: &ServerName, url: &Handle) -> (TrustRating, Option<Advisory>) {
    let key = url_key(url);
    match server.trust_rating_for(&key) {
        TrustRating::UntrustedAskAdvisory => {
            let advisory = server.advisory_for(&key);
            let rating = advisory
                .as_ref()
                .map_or(TrustRating::Phishing, |advisory| advisory.fraud_type.rating());
            (rating, advisory)
        }
        rating => (rating, None),
    }
}

/// Writes a click-through warning document for `blocked`.
fn generate_warning_page(
    urls: &mut UrlManager,
    blocked: &Handle,
    rating: TrustRating,
    advisory: Option<&Advisory>,
) -> CartaResult<Handle> {
    let page = urls.new_unique(WARNING_PAGE_URL)?;
    let shown = blocked.name(NameVariant::NameUsernamePasswordHidden);
    let html = render_warning(&shown, rating, advisory);
    urls.write_document_data(&page, WARNING_PAGE_MIME, html.as_bytes(), true)?;
    page.set_uint(UintAttr::IsClickThroughPage, 1)?;
    page.set_url(UrlAttr::Referrer, blocked.clone())?;
    page.set_url(UrlAttr::BlockedUrl, blocked.clone())?;
    info!(url = %shown, rating = rating.as_str(), "fraud warning page generated");
    Ok(page)
}

fn render_warning(shown: &str, rating: TrustRating, advisory: Option<&Advisory>) -> String {
    let headline = match rating {
        TrustRating::Malware => "This site is known to distribute malicious software",
        _ => "This site has been reported as a fraudulent site",
    };

    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>Warning</title></head><body>\n");
    html.push_str(&format!("<h1>{}</h1>\n", escape_html(headline)));
    html.push_str(&format!("<p class=\"blocked\">{}</p>\n", escape_html(shown)));
    if let Some(advisory) = advisory {
        if !advisory.text.is_empty() {
            html.push_str(&format!("<p class=\"advisory\">{}</p>\n", escape_html(&advisory.text)));
        }
        if !advisory.advisory_url.is_empty() {
            html.push_str(&format!(
                "<p><a href=\"{0}\">{0}</a></p>\n",
                escape_html(&advisory.advisory_url)
            ));
        }
        if !advisory.homepage.is_empty() {
            html.push_str(&format!(
                "<p>Reported by <a href=\"{0}\">{0}</a></p>\n",
                escape_html(&advisory.homepage)
            ));
        }
    }
    html.push_str(&format!(
        "<p><a href=\"{}\">Continue anyway</a></p>\n</body></html>\n",
        escape_html(shown)
    ));
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
