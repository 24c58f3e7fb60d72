//! One reputation check, shared by every URL waiting on the same host.

use crate::TrustConfig;
use crate::parser::TrustInfo;
use crate::parser::TrustInfoParser;
use crate::request;
use carta_core::CartaError;
use carta_core::CartaResult;
use carta_event::MessageKind;
use carta_event::SinkId;
use carta_net::NameResolver;
use carta_net::ResolveEvent;
use carta_net::ResolveTicket;
use carta_net::nettype::classify_addresses;
use carta_url::CommState;
use carta_url::DataDescriptor;
use carta_url::DescriptorOptions;
use carta_url::Handle;
use carta_url::LoadOptions;
use carta_url::Redirect;
use carta_url::ServerName;
use carta_url::UintAttr;
use carta_url::UrlManager;
use carta_url::UrlType;
use std::rc::Rc;
use tracing::debug;
use tracing::info;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CheckerId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Idle,
    /// Waiting for the host's addresses.
    Resolving(ResolveTicket),
    /// Fetching and parsing the answer.
    Checking,
    Done,
}

/// How a finished check ended.
#[derive(Debug, Clone)]
pub enum CheckOutcome {
    Verified(TrustInfo),
    /// The sitecheck request failed or its answer was unusable.
    Failed(CartaError),
    /// The checked host itself did not resolve; the service was not asked.
    Unresolved(CartaError),
    /// The host resolved to a local address and was never sent out.
    Local,
}

/// Borrowed collaborators a checker drives.
pub struct CheckContext<'a> {
    pub urls: &'a mut UrlManager,
    pub resolver: &'a mut dyn NameResolver,
    pub config: &'a TrustConfig,
    pub max_pattern_bytes: usize,
}

/// Checks one host and remembers which URLs wait for the answer.
pub struct ServerTrustChecker {
    id: CheckerId,
    server: Rc<ServerName>,
    urls: Vec<Handle>,
    current: Handle,
    state: CheckState,
    suspended: bool,
    request: Option<Handle>,
    sink: Option<SinkId>,
    descriptor: Option<DataDescriptor>,
    parser: Option<TrustInfoParser>,
    max_pattern_bytes: usize,
    outcome: Option<CheckOutcome>,
}

impl core::fmt::Debug for ServerTrustChecker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerTrustChecker")
            .field("id", &self.id)
            .field("server", &self.server.name())
            .field("urls", &self.urls.len())
            .field("state", &self.state)
            .field("suspended", &self.suspended)
            .finish_non_exhaustive()
    }
}

impl ServerTrustChecker {
    /// Prepares a check of the host of `url`. Names without a host cannot be
    /// checked.
    pub fn new(id: CheckerId, url: &Handle) -> CartaResult<Self> {
        let Some(server) = url.server() else {
            return Err(CartaError::null_pointer(
                "trust.check.no_server",
                "resource has no host to check",
            ));
        };
        Ok(Self {
            id,
            server,
            urls: vec![url.clone()],
            current: url.clone(),
            state: CheckState::Idle,
            suspended: false,
            request: None,
            sink: None,
            descriptor: None,
            parser: None,
            max_pattern_bytes: 0,
            outcome: None,
        })
    }

    pub fn id(&self) -> CheckerId {
        self.id
    }

    pub fn server(&self) -> &Rc<ServerName> {
        &self.server
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == CheckState::Done
    }

    /// True while waiting on an asynchronous step.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// URLs batched into this check, in arrival order.
    pub fn urls(&self) -> &[Handle] {
        &self.urls
    }

    /// The URL most recently navigated to.
    pub fn current(&self) -> &Handle {
        &self.current
    }

    /// The sitecheck request, once issued.
    pub fn request(&self) -> Option<&Handle> {
        self.request.as_ref()
    }

    pub fn belongs_to_server(&self, server: &Rc<ServerName>) -> bool {
        Rc::ptr_eq(&self.server, server)
    }

    pub fn is_checking_url(&self, url: &Handle) -> bool {
        self.urls.iter().any(|waiting| waiting.same_resource(url))
    }

    /// Adds `url` to the batch and makes it the current navigation.
    pub fn add_url(&mut self, url: &Handle) {
        if !self.is_checking_url(url) {
            self.urls.push(url.clone());
        }
        self.current = url.clone();
    }

    /// Starts the check, resolving the host first when `resolve_first` is set.
    pub fn start_check(&mut self, resolve_first: bool, ctx: &mut CheckContext<'_>) -> CartaResult<()> {
        if self.state != CheckState::Idle {
            return Err(CartaError::invalid_state(
                "trust.check.already_started",
                format!("check of `{}` already started", self.server.name()),
            ));
        }

        if resolve_first {
            let ticket = ctx.resolver.start(self.server.name())?;
            debug!(host = self.server.name(), ticket = ticket.0, "resolving before sitecheck");
            self.state = CheckState::Resolving(ticket);
            self.suspended = true;
            return Ok(());
        }

        self.check_url(ctx)
    }

    /// Consumes `event` if it answers this checker's lookup.
    pub fn handle_resolve(&mut self, event: &ResolveEvent, ctx: &mut CheckContext<'_>) -> bool {
        let CheckState::Resolving(ticket) = self.state else {
            return false;
        };
        if event.ticket() != ticket {
            return false;
        }
        self.suspended = false;

        match event {
            ResolveEvent::Resolved { addresses, .. } => {
                let net_type = classify_addresses(addresses);
                self.server.set_net_type(net_type);
                if net_type.is_local() {
                    debug!(host = self.server.name(), net_type = net_type.as_str(), "local host, no sitecheck");
                    self.done(CheckOutcome::Local, ctx.urls);
                } else if let Err(error) = self.check_url(ctx) {
                    self.done(CheckOutcome::Failed(error), ctx.urls);
                }
            }
            ResolveEvent::Failed { error, .. } => {
                info!(host = self.server.name(), %error, "sitecheck abandoned, host did not resolve");
                self.done(CheckOutcome::Unresolved(error.clone()), ctx.urls);
            }
        }
        true
    }

    /// Issues the sitecheck request.
    fn check_url(&mut self, ctx: &mut CheckContext<'_>) -> CartaResult<()> {
        let secure = self.current.url_type() == UrlType::Https;
        let target = request::check_url(ctx.config, self.server.name(), secure);
        let handle = ctx.urls.new_unique(&target)?;
        handle.set_uint(UintAttr::BlockUserInteraction, 1)?;
        handle.set_uint(UintAttr::DisableCookies, 1)?;
        handle.set_uint(UintAttr::SkipContentBlocker, 1)?;
        handle.set_uint(UintAttr::MaxDurationSecs, ctx.config.request_timeout_secs)?;

        let sink = ctx.urls.queue().open_sink();
        self.request = Some(handle.clone());
        self.sink = Some(sink);
        self.max_pattern_bytes = ctx.max_pattern_bytes;
        self.parser = Some(TrustInfoParser::new(self.max_pattern_bytes));
        self.state = CheckState::Checking;
        self.suspended = true;
        info!(host = self.server.name(), "sitecheck requested");

        match ctx.urls.load(&handle, sink, &LoadOptions::default())? {
            CommState::Loading => {}
            CommState::RequestFinished => self.read_answer(ctx.urls, true),
            CommState::RequestFailed => self.done(
                CheckOutcome::Failed(CartaError::network(
                    "trust.check.request_failed",
                    "sitecheck request could not be started",
                )),
                ctx.urls,
            ),
        }
        Ok(())
    }

    /// Drains load messages for the sitecheck request.
    pub fn handle_messages(&mut self, urls: &mut UrlManager) {
        if self.state != CheckState::Checking {
            return;
        }
        let Some(sink) = self.sink else {
            return;
        };

        for message in urls.queue().take(sink) {
            match message.kind {
                MessageKind::DataLoaded { finished } => self.read_answer(urls, finished),
                MessageKind::MultipartReload => {
                    self.descriptor = None;
                    self.parser = Some(TrustInfoParser::new(self.max_pattern_bytes));
                }
                MessageKind::LoadingFailed { failure } => {
                    let error = CartaError::network(
                        "trust.check.load_failed",
                        format!("sitecheck load failed: {}", failure.as_str()),
                    );
                    self.done(CheckOutcome::Failed(error), urls);
                }
                MessageKind::HeaderLoaded { .. } | MessageKind::Moved { .. } => {}
            }
            if self.state != CheckState::Checking {
                break;
            }
        }
    }

    fn read_answer(&mut self, urls: &mut UrlManager, finished: bool) {
        if let Err(error) = self.pump(urls, finished) {
            warn!(host = self.server.name(), %error, "sitecheck answer rejected");
            self.done(CheckOutcome::Failed(error), urls);
        }
    }

    fn pump(&mut self, urls: &mut UrlManager, finished: bool) -> CartaResult<()> {
        let Some(request) = self.request.clone() else {
            return Ok(());
        };

        if finished {
            let (answer, _) = request.follow_redirects();
            let status = answer.uint(UintAttr::HttpResponseCode);
            if status >= 400 {
                return Err(CartaError::network(
                    "trust.check.http_status",
                    format!("sitecheck answered with status {status}"),
                ));
            }
        }

        if self.descriptor.is_none() {
            self.descriptor =
                urls.get_descriptor(&request, self.sink, Redirect::Follow, &DescriptorOptions::default());
        }

        let Some(parser) = self.parser.as_mut() else {
            return Ok(());
        };
        if let Some(descriptor) = self.descriptor.as_mut() {
            loop {
                let (buffered, more) = descriptor.retrieve_data()?;
                if let Some(text) = descriptor.text() {
                    parser.feed(text)?;
                }
                descriptor.consume_data(buffered);
                if !more || buffered == 0 {
                    break;
                }
            }
        }

        if finished {
            if let Some(parser) = self.parser.take() {
                let info = parser.finish()?;
                self.done(CheckOutcome::Verified(info), urls);
            }
        }
        Ok(())
    }

    fn done(&mut self, outcome: CheckOutcome, urls: &mut UrlManager) {
        self.release(urls);
        self.state = CheckState::Done;
        self.suspended = false;
        self.outcome = Some(outcome);
    }

    fn release(&mut self, urls: &mut UrlManager) {
        self.descriptor = None;
        self.parser = None;
        if let Some(sink) = self.sink.take() {
            if let Some(request) = self.request.as_ref() {
                urls.stop_loading(request, sink);
            }
            urls.queue().close_sink(sink);
        }
    }

    /// Stops whatever is in flight. The check ends as failed.
    pub fn abandon(&mut self, ctx: &mut CheckContext<'_>) {
        if self.is_done() {
            return;
        }
        if let CheckState::Resolving(ticket) = self.state {
            ctx.resolver.cancel(ticket);
        }
        debug!(host = self.server.name(), "sitecheck abandoned");
        self.done(
            CheckOutcome::Failed(CartaError::invalid_state(
                "trust.check.abandoned",
                "check abandoned",
            )),
            ctx.urls,
        );
    }

    /// The outcome, once. `None` while the check runs.
    pub fn take_outcome(&mut self) -> Option<CheckOutcome> {
        self.outcome.take()
    }
}

#[cfg(test)]
mod tests {
    use super::CheckState;
    use super::CheckerId;
    use super::ServerTrustChecker;
    use carta_core::ManualClock;
    use carta_event::MessageQueue;
    use carta_event::QueueConfig;
    use carta_net::MemoryTransport;
    use carta_url::ManagerConfig;
    use carta_url::UrlManager;
    use std::rc::Rc;

    fn manager() -> UrlManager {
        let queue = match MessageQueue::new(QueueConfig::default()) {
            Ok(queue) => queue,
            Err(error) => panic!("{error}"),
        };
        match UrlManager::new(
            ManagerConfig::default(),
            queue,
            Box::new(MemoryTransport::new()),
            Rc::new(ManualClock::at_secs(0)),
        ) {
            Ok(urls) => urls,
            Err(error) => panic!("{error}"),
        }
    }

    #[test]
    fn hostless_names_cannot_be_checked() {
        let mut urls = manager();
        let url = urls.get_url("data:,x");
        assert!(matches!(
            ServerTrustChecker::new(CheckerId(1), &url),
            Err(error) if error.code == "trust.check.no_server"
        ));
    }

    #[test]
    fn batches_urls_of_one_server() {
        let mut urls = manager();
        let first = urls.get_url("http://batch.example/a");
        let second = urls.get_url("http://batch.example/b#part");
        let elsewhere = urls.get_url("http://other.example/");

        let mut checker = match ServerTrustChecker::new(CheckerId(1), &first) {
            Ok(checker) => checker,
            Err(error) => panic!("{error}"),
        };
        assert_eq!(checker.state(), CheckState::Idle);
        assert!(!checker.is_suspended());

        checker.add_url(&second);
        checker.add_url(&first);
        assert_eq!(checker.urls().len(), 2);
        assert!(checker.current().same_resource(&first));
        assert!(checker.is_checking_url(&second));
        assert!(!checker.is_checking_url(&elsewhere));

        let Some(server) = second.server() else {
            panic!("http name without server");
        };
        assert!(checker.belongs_to_server(&server));
        let Some(other_server) = elsewhere.server() else {
            panic!("http name without server");
        };
        assert!(!checker.belongs_to_server(&other_server));
    }
}
