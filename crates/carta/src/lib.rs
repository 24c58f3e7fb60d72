//! Resource loading with site reputation checks.
//!
//! [`Engine`] owns a [`UrlManager`] and a [`TrustCheckManager`] and drives both
//! from one cooperative loop: callers [`navigate`](Engine::navigate), then call
//! [`tick`](Engine::tick) until the work they wait for is done.

pub mod config;


use carta_core::CartaError;
use carta_core::CartaResult;
use carta_core::Clock;
use carta_core::SystemClock;
use carta_event::MessageQueue;
use carta_event::SinkId;
use carta_net::NameResolver;
use carta_net::SystemResolver;
use carta_net::Transport;
use carta_security::TrustRating;
use carta_trust::TrustCheckManager;
use carta_trust::TrustDecision;
use carta_trust::TrustVerdict;
use carta_url::CommState;
use carta_url::Handle;
use carta_url::LoadOptions;
use carta_url::NameVariant;
use carta_url::Redirect;
use carta_url::UrlAttr;
use carta_url::UrlManager;
use std::rc::Rc;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub use config::EngineConfig;

/// What became of a navigation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Navigation {
    /// The load was started or served from cache. `trust` is
    /// [`TrustDecision::Pending`] while a reputation check is still running.
    Loading {
        handle: Handle,
        state: CommState,
        trust: TrustDecision,
    },
    /// The cached rating already forbids the page; nothing was loaded.
    Blocked {
        handle: Handle,
        rating: TrustRating,
        warning: Handle,
    },
}

impl Navigation {
    pub fn handle(&self) -> &Handle {
        match self {
            Self::Loading { handle, .. } | Self::Blocked { handle, .. } => handle,
        }
    }
}

/// Work done by one [`Engine::tick`].
#[derive(Debug, Default)]
pub struct Tick {
    pub events: usize,
    pub verdicts: Vec<TrustVerdict>,
}

impl Tick {
    pub fn is_idle(&self) -> bool {
        self.events == 0 && self.verdicts.is_empty()
    }
}

#[derive(Debug)]
struct PendingNavigation {
    handle: Handle,
    sink: SinkId,
}

pub struct Engine {
    urls: UrlManager,
    trust: TrustCheckManager,
    pending: Vec<PendingNavigation>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        transport: Box<dyn Transport>,
        resolver: Box<dyn NameResolver>,
        clock: Rc<dyn Clock>,
    ) -> CartaResult<Self> {
        config.validate()?;
        let queue = MessageQueue::new(config.queue)?;
        let urls = UrlManager::new(config.urls, queue, transport, clock)?
            .with_storage_config(config.storage)?
            .with_privacy(config.privacy)?;
        let trust = TrustCheckManager::new(config.trust, config.security, resolver)?;
        info!(
            sitecheck = %trust.config().sitecheck_host,
            fraud_protection = trust.policy().fraud_protection,
            "engine ready"
        );
        Ok(Self {
            urls,
            trust,
            pending: Vec::new(),
        })
    }

    /// Engine on the operating system resolver and clock.
    pub fn with_system(config: EngineConfig, transport: Box<dyn Transport>) -> CartaResult<Self> {
        Self::new(
            config,
            transport,
            Box::new(SystemResolver::default()),
            Rc::new(SystemClock),
        )
    }

    pub fn urls(&self) -> &UrlManager {
        &self.urls
    }

    pub fn urls_mut(&mut self) -> &mut UrlManager {
        &mut self.urls
    }

    pub fn trust(&self) -> &TrustCheckManager {
        &self.trust
    }

    pub fn queue(&self) -> &MessageQueue {
        self.urls.queue()
    }

    pub fn open_sink(&self) -> SinkId {
        self.urls.queue().open_sink()
    }

    /// Navigates `sink` to `text`.
    ///
    /// A page whose cached rating is fraudulent is not loaded; the warning
    /// page is returned instead. Otherwise the load starts right away and a
    /// pending check may still block it from a later [`tick`](Self::tick).
    pub fn navigate(
        &mut self,
        text: &str,
        sink: SinkId,
        options: &LoadOptions,
    ) -> CartaResult<Navigation> {
        let handle = self.urls.get_url(text);
        if !handle.is_valid() {
            return Err(CartaError::parse(
                "engine.navigate.invalid_url",
                format!("`{text}` is not a loadable name"),
            ));
        }

        let trust = self
            .trust
            .check_trust_rating(&mut self.urls, &handle, false, false)?;
        if let TrustDecision::Blocked { rating, warning } = trust {
            info!(url = %handle.name(NameVariant::NameEscaped), ?rating, "navigation blocked");
            return Ok(Navigation::Blocked {
                handle,
                rating,
                warning,
            });
        }

        self.forget_pending(&handle, sink);
        let state = self.urls.load(&handle, sink, options)?;
        if trust == TrustDecision::Pending {
            self.pending.push(PendingNavigation {
                handle: handle.clone(),
                sink,
            });
        }
        debug!(url = %handle.name(NameVariant::NameEscaped), ?state, "navigation started");
        Ok(Navigation::Loading {
            handle,
            state,
            trust,
        })
    }

    /// Navigations still waiting for a verdict.
    pub fn pending_navigations(&self) -> usize {
        self.pending.len()
    }

    /// Drops what `sink` was waiting for before it moves to `handle`.
    /// A load of another resource is stopped for that sink.
    fn forget_pending(&mut self, handle: &Handle, sink: SinkId) {
        let mut index = 0;
        while index < self.pending.len() {
            if self.pending[index].sink != sink {
                index += 1;
                continue;
            }
            let replaced = self.pending.swap_remove(index);
            if !replaced.handle.same_resource(handle) {
                debug!(
                    url = %replaced.handle.name(NameVariant::NameEscaped),
                    "navigation replaced before its check finished"
                );
                self.urls.stop_loading(&replaced.handle, sink);
            }
        }
    }

    /// Runs one round of transfers and reputation checks.
    ///
    /// A verdict that carries a warning page stops the blocked load for the
    /// sink that navigated to it.
    pub fn tick(&mut self) -> CartaResult<Tick> {
        let events = self.urls.process_events();
        let verdicts = self.trust.process(&mut self.urls)?;
        for verdict in &verdicts {
            let mut index = 0;
            while index < self.pending.len() {
                if !self.pending[index].handle.same_resource(&verdict.url) {
                    index += 1;
                    continue;
                }
                let navigation = self.pending.swap_remove(index);
                if verdict.warning.is_some() {
                    warn!(
                        url = %navigation.handle.name(NameVariant::NameEscaped),
                        rating = ?verdict.rating,
                        "stopping load of listed page"
                    );
                    self.urls.stop_loading(&navigation.handle, navigation.sink);
                }
            }
        }
        Ok(Tick { events, verdicts })
    }

    /// Ticks until nothing is loading or being checked, at most `max_ticks`
    /// times. Returns every verdict seen on the way.
    pub fn run_until_idle(&mut self, max_ticks: usize) -> CartaResult<Vec<TrustVerdict>> {
        let mut verdicts = Vec::new();
        for _ in 0..max_ticks {
            let mut tick = self.tick()?;
            verdicts.append(&mut tick.verdicts);
            if tick.events == 0
                && self.trust.active_checks() == 0
                && self.urls.active_transfers() == 0
            {
                break;
            }
        }
        Ok(verdicts)
    }

    /// Accepts the risk shown on `warning` and returns the page it blocked.
    pub fn bypass_warning(&mut self, warning: &Handle) -> CartaResult<Handle> {
        let blocked = warning.url(UrlAttr::BlockedUrl, Redirect::NoRedirect);
        if blocked.is_empty() {
            return Err(CartaError::invalid_state(
                "engine.bypass.not_a_warning",
                "handle does not name a blocked page",
            ));
        }
        self.trust.bypass(&blocked)?;
        Ok(blocked)
    }

    /// Stops every reputation check and drops resources nothing refers to.
    /// Returns the number of resources dropped.
    pub fn shutdown(&mut self) -> usize {
        self.trust.abandon_checks(&mut self.urls);
        self.pending.clear();
        let freed = self.urls.free_unused_resources();
        info!(freed, "engine stopped");
        freed
    }
}
