//! Resource table and the load state machine.

use crate::attr::DynamicAttr;
use crate::attr::DynamicKind;
use crate::attr::DynamicRegistry;
use crate::attr::StrAttr;
use crate::attr::UintAttr;
use crate::attr::UrlAttr;
use crate::attr::ValueAttr;
use crate::cache;
use crate::cache::CheckExpiry;
use crate::cache::ExpiryCheck;
use crate::content::ContentType;
use crate::content::encoding_for_label;
use crate::data_url::decode_data_url;
use crate::descriptor::DataDescriptor;
use crate::descriptor::DescriptorOptions;
use crate::handle::Handle;
use crate::handle::Redirect;
use crate::name::NameComponents;
use crate::name::NameFormat;
use crate::name::NameVariant;
use crate::rep::DataStorage;
use crate::rep::LoadStatus;
use crate::rep::ResourceRep;
use crate::rep::TransferSlot;
use crate::scheme::UrlType;
use crate::server::ServerNameRegistry;
use carta_core::CartaError;
use carta_core::CartaResult;
use carta_core::Clock;
use carta_core::ErrorKind;
use carta_event::LoadFailure;
use carta_event::Message;
use carta_event::MessageKind;
use carta_event::MessageQueue;
use carta_event::ResourceId;
use carta_event::SinkId;
use carta_net::Header;
use carta_net::NetType;
use carta_net::ResponseHead;
use carta_net::TransferEventKind;
use carta_net::TransferFlags;
use carta_net::TransferId;
use carta_net::TransferRequest;
use carta_net::Transport;
use carta_net::http::find_header;
use carta_net::http::is_redirect_status;
use carta_privacy::PrivacyPolicy;
use carta_privacy::ThirdParty;
use carta_privacy::determine_third_party;
use carta_security::SecurityLevel;
use carta_storage::CacheType;
use carta_storage::ResourceStorage;
use carta_storage::StorageConfig;
use carta_storage::parse_content_encodings;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

const DEFAULT_MAX_REDIRECTS: u32 = 20;
const DEFAULT_DOCUMENT_EXPIRY_SECS: u64 = 300;
const DEFAULT_INLINE_EXPIRY_SECS: u64 = 3600;
const DEFAULT_CHUNK_BYTES: usize = 32 * 1024;
const DEFAULT_CHARSET: &str = "windows-1252";

/// Manager policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub max_redirects: u32,
    pub document_expiry: CheckExpiry,
    pub inline_expiry: CheckExpiry,
    /// Upper bound on bytes a descriptor pulls per `retrieve_data`.
    pub descriptor_chunk_bytes: usize,
    /// Charset label assumed when neither the response nor the caller names one.
    pub default_charset: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            document_expiry: CheckExpiry::After(DEFAULT_DOCUMENT_EXPIRY_SECS),
            inline_expiry: CheckExpiry::After(DEFAULT_INLINE_EXPIRY_SECS),
            descriptor_chunk_bytes: DEFAULT_CHUNK_BYTES,
            default_charset: DEFAULT_CHARSET.to_owned(),
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> CartaResult<()> {
        if self.max_redirects == 0 {
            return Err(CartaError::policy(
                "url.config.max_redirects_invalid",
                "max_redirects must be greater than zero",
            ));
        }

        if self.descriptor_chunk_bytes == 0 {
            return Err(CartaError::policy(
                "url.config.chunk_bytes_invalid",
                "descriptor_chunk_bytes must be greater than zero",
            ));
        }

        if encoding_for_label(&self.default_charset).is_none() {
            return Err(CartaError::policy(
                "url.config.default_charset_invalid",
                format!("`{}` is not a known charset", self.default_charset),
            ));
        }

        Ok(())
    }
}

/// Per-call load parameters.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Document that led to this load; empty for typed navigations.
    pub referrer: Handle,
    /// Staleness check for cached content. Documents by default.
    pub expiry: Option<ExpiryCheck>,
    pub user_initiated: bool,
}

impl LoadOptions {
    pub fn with_referrer(referrer: &Handle) -> Self {
        Self {
            referrer: referrer.clone(),
            ..Self::default()
        }
    }

    /// Uses the inline-load staleness policy.
    pub fn inline(mut self) -> Self {
        self.expiry = Some(ExpiryCheck::inline());
        self
    }

    fn expiry(&self) -> ExpiryCheck {
        self.expiry.unwrap_or_else(ExpiryCheck::document)
    }
}

/// Immediate outcome of a load request. Progress always arrives later as
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommState {
    /// A transfer is running or was joined; messages follow.
    Loading,
    /// Cached content is fresh; no messages follow.
    RequestFinished,
    /// The name cannot be loaded; no messages follow.
    RequestFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadKind {
    /// Revalidate with `If-None-Match`/`If-Modified-Since` when possible.
    Conditional,
    Unconditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub state: CommState,
    /// The request actually carried validators.
    pub conditional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartMode {
    Fresh,
    Conditional,
    Resume(u64),
}

/// Owns every shared resource and drives their loads.
///
/// Everything runs on one thread. Calls return immediately and
/// [`UrlManager::process_events`] pumps the transport, completes in-process
/// loads, enforces timeouts and delivers queued messages.
pub struct UrlManager {
    config: ManagerConfig,
    storage_config: StorageConfig,
    privacy: PrivacyPolicy,
    clock: Rc<dyn Clock>,
    queue: MessageQueue,
    transport: Box<dyn Transport>,
    servers: ServerNameRegistry,
    table: HashMap<String, Rc<ResourceRep>>,
    transfers: HashMap<TransferId, Rc<ResourceRep>>,
    local: VecDeque<Rc<ResourceRep>>,
    dynamic: DynamicRegistry,
    next_id: u64,
}

impl core::fmt::Debug for UrlManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UrlManager")
            .field("config", &self.config)
            .field("resources", &self.table.len())
            .field("transfers", &self.transfers.len())
            .field("servers", &self.servers.len())
            .finish_non_exhaustive()
    }
}

fn empty_handle() -> CartaError {
    CartaError::null_pointer("url.handle.empty", "operation on an empty handle")
}

fn failure_for(error: &CartaError) -> LoadFailure {
    match error.kind {
        ErrorKind::OutOfMemory => LoadFailure::OutOfMemory,
        ErrorKind::NoAccess => LoadFailure::NoAccess,
        _ => LoadFailure::Network,
    }
}

impl UrlManager {
    pub fn new(
        config: ManagerConfig,
        queue: MessageQueue,
        transport: Box<dyn Transport>,
        clock: Rc<dyn Clock>,
    ) -> CartaResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            storage_config: StorageConfig::default(),
            privacy: PrivacyPolicy::default(),
            clock,
            queue,
            transport,
            servers: ServerNameRegistry::new(),
            table: HashMap::new(),
            transfers: HashMap::new(),
            local: VecDeque::new(),
            dynamic: DynamicRegistry::default(),
            next_id: 0,
        })
    }

    pub fn with_storage_config(mut self, config: StorageConfig) -> CartaResult<Self> {
        config.validate()?;
        self.storage_config = config;
        Ok(self)
    }

    pub fn with_privacy(mut self, policy: PrivacyPolicy) -> CartaResult<Self> {
        policy.validate()?;
        self.privacy = policy;
        Ok(self)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn servers(&self) -> &ServerNameRegistry {
        &self.servers
    }

    pub fn clock(&self) -> Rc<dyn Clock> {
        Rc::clone(&self.clock)
    }

    /// Number of shared resources in the table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    fn allocate_id(&mut self) -> ResourceId {
        self.next_id = self.next_id.saturating_add(1);
        ResourceId(self.next_id)
    }

    /// Handle for `text`, shared with every other handle for the same name.
    ///
    /// Never fails: unparseable text yields a handle flagged invalid so the
    /// text can still be shown.
    pub fn get_url(&mut self, text: &str) -> Handle {
        let parsed = NameComponents::parse(text, &self.servers);
        let key = parsed.components.render(NameFormat::KEY, None);
        let existing = self
            .table
            .get(&key)
            .filter(|rep| !rep.is_unique())
            .cloned();

        let rep = match existing {
            Some(rep) => rep,
            None => {
                let id = self.allocate_id();
                let rep = Rc::new(ResourceRep::new(
                    id,
                    parsed.components,
                    Rc::clone(&self.clock),
                ));
                self.table.insert(key, Rc::clone(&rep));
                rep
            }
        };
        attach_fragment(rep, parsed.fragment.as_deref())
    }

    /// Resolves `text` against `base` and returns the shared handle.
    pub fn get_url_relative(&mut self, base: &Handle, text: &str) -> Handle {
        match base.rep() {
            Some(rep) => {
                let resolved = rep.name().resolve(text);
                self.get_url(&resolved)
            }
            None => self.get_url(text),
        }
    }

    /// A fresh resource for `text` that is never shared through the table.
    pub fn new_unique(&mut self, text: &str) -> CartaResult<Handle> {
        let parsed = NameComponents::parse(text, &self.servers);
        let id = self.allocate_id();
        let rep = Rc::new(ResourceRep::new(
            id,
            parsed.components,
            Rc::clone(&self.clock),
        ));
        rep.mark_unique()?;
        Ok(attach_fragment(rep, parsed.fragment.as_deref()))
    }

    /// Takes the resource behind `handle` out of the shared table. Later
    /// lookups of the same name get a new resource.
    pub fn make_unique(&mut self, handle: &Handle) -> CartaResult<Handle> {
        let rep = handle.rep().ok_or_else(empty_handle)?;
        rep.mark_unique()?;
        let key = rep.key();
        if self
            .table
            .get(&key)
            .is_some_and(|current| Rc::ptr_eq(current, rep))
        {
            self.table.remove(&key);
        }
        debug!(url = %rep.log_name(), "resource made unique");
        Ok(handle.clone())
    }

    /// Starts or joins a load of `handle` on behalf of `sink`.
    pub fn load(
        &mut self,
        handle: &Handle,
        sink: SinkId,
        options: &LoadOptions,
    ) -> CartaResult<CommState> {
        let rep = Rc::clone(handle.rep().ok_or_else(empty_handle)?);
        if !is_loadable(&rep) {
            debug!(url = %rep.log_name(), "name cannot be loaded");
            return Ok(CommState::RequestFailed);
        }

        match rep.status() {
            LoadStatus::Loading => {
                self.join(&rep, sink)?;
                Ok(CommState::Loading)
            }
            LoadStatus::Loaded if !self.is_stale(&rep, options.expiry()) => {
                debug!(url = %rep.log_name(), "served from cache");
                Ok(CommState::RequestFinished)
            }
            _ => self.start_load(&rep, sink, options, StartMode::Fresh, 0),
        }
    }

    /// Loads again, revalidating when `kind` asks for it and validators
    /// exist.
    pub fn reload(
        &mut self,
        handle: &Handle,
        sink: SinkId,
        kind: ReloadKind,
        options: &LoadOptions,
    ) -> CartaResult<ReloadOutcome> {
        let rep = Rc::clone(handle.rep().ok_or_else(empty_handle)?);
        if !is_loadable(&rep) {
            return Ok(ReloadOutcome {
                state: CommState::RequestFailed,
                conditional: false,
            });
        }
        if rep.is_loading() {
            self.join(&rep, sink)?;
            return Ok(ReloadOutcome {
                state: CommState::Loading,
                conditional: false,
            });
        }

        let conditional = kind == ReloadKind::Conditional && allows_conditional(&rep);
        let mode = if conditional {
            StartMode::Conditional
        } else {
            StartMode::Fresh
        };
        let state = self.start_load(&rep, sink, options, mode, 0)?;
        Ok(ReloadOutcome { state, conditional })
    }

    /// Continues an interrupted transfer from the last stored byte.
    pub fn resume_load(
        &mut self,
        handle: &Handle,
        sink: SinkId,
        options: &LoadOptions,
    ) -> CartaResult<CommState> {
        let rep = Rc::clone(handle.rep().ok_or_else(empty_handle)?);
        if !rep.name().url_type().supports_resume() {
            return Ok(self
                .reload(handle, sink, ReloadKind::Unconditional, options)?
                .state);
        }
        if rep.method().forces_unique() {
            return Err(CartaError::invalid_state(
                "url.load.resume_unsupported",
                format!("cannot resume a {} request", rep.method().as_str()),
            ));
        }
        if rep.is_loading() {
            self.join(&rep, sink)?;
            return Ok(CommState::Loading);
        }

        let offset = rep.resume_offset();
        if offset == 0 || !rep.flag(UintAttr::ResumeSupported) {
            return Ok(self
                .reload(handle, sink, ReloadKind::Unconditional, options)?
                .state);
        }

        rep.set_flag(UintAttr::IsResuming, true)?;
        self.start_load(&rep, sink, options, StartMode::Resume(offset), 0)
    }

    /// Withdraws `sink` from the load of `handle` and of its redirect
    /// target. Nothing more is delivered to `sink` about them. A transfer
    /// left without listeners is aborted.
    pub fn stop_loading(&mut self, handle: &Handle, sink: SinkId) {
        let Some(rep) = handle.rep().cloned() else {
            return;
        };
        let (end, _) = handle.follow_redirects();
        self.detach_sink(&rep, sink);
        if let Some(target) = end.rep().cloned() {
            if !Rc::ptr_eq(&target, &rep) {
                self.detach_sink(&target, sink);
            }
        }
    }

    /// Advances every running load once and delivers queued messages.
    /// Returns the number of events handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0_usize;
        while let Some(rep) = self.local.pop_front() {
            self.complete_local(&rep);
            handled += 1;
        }

        for event in self.transport.poll() {
            handled += 1;
            let Some(rep) = self.transfers.get(&event.id).cloned() else {
                trace!(transfer = event.id.0, "event for a finished transfer");
                continue;
            };
            self.touch(&rep);
            match event.kind {
                TransferEventKind::Head(head) => self.on_head(&rep, event.id, head),
                TransferEventKind::Data(bytes) => self.on_data(&rep, &bytes),
                TransferEventKind::MultipartBoundary => self.on_boundary(&rep),
                TransferEventKind::Finished => self.on_finished(&rep, event.id),
                TransferEventKind::Failed(error) => {
                    warn!(url = %rep.log_name(), %error, "transfer failed");
                    self.fail(&rep, failure_for(&error));
                }
            }
        }

        self.check_timeouts();
        self.queue.deliver();
        handled
    }

    /// Drops table entries nothing refers to. Returns how many went.
    pub fn free_unused_resources(&mut self) -> usize {
        let mut freed = 0_usize;
        loop {
            let before = self.table.len();
            self.table.retain(|_, rep| {
                Rc::strong_count(rep) > 1 || rep.in_use_count() > 0 || rep.is_loading()
            });
            let removed = before - self.table.len();
            if removed == 0 {
                break;
            }
            freed += removed;
        }
        let servers = self.servers.prune();
        debug!(freed, servers, "released unused resources");
        freed
    }

    /// Releases the body of `handle` while keeping its metadata. Refused
    /// while it loads or is in use.
    pub fn unload(&mut self, handle: &Handle) -> bool {
        let Some(rep) = handle.rep() else {
            return false;
        };
        if rep.in_use_count() > 0 || !rep.detach_storage() {
            return false;
        }
        rep.set_status(LoadStatus::Unloaded);
        debug!(url = %rep.log_name(), "body released");
        true
    }

    /// Writes generated content into `handle`. The first write replaces any
    /// previous body; `finished` completes the document.
    pub fn write_document_data(
        &mut self,
        handle: &Handle,
        mime: &str,
        data: &[u8],
        finished: bool,
    ) -> CartaResult<()> {
        let rep = Rc::clone(handle.rep().ok_or_else(empty_handle)?);
        let in_transfer = rep
            .state
            .borrow()
            .storage
            .as_ref()
            .is_some_and(|storage| storage.transfer.is_some());
        if in_transfer {
            return Err(CartaError::invalid_state(
                "url.document.loading",
                "cannot write into a resource that is being loaded",
            ));
        }

        if !rep.is_loading() {
            rep.set_str_attr(StrAttr::MimeForceContentType, mime)?;
            rep.set_flag(UintAttr::IsGeneratedDocument, true)?;
            let now = self.clock.now();
            let storage_config = self.storage_config.clone();
            let mut state = rep.state.borrow_mut();
            let storage = state.storage.get_or_insert_with(|| {
                DataStorage::new(ResourceStorage::new(storage_config, CacheType::Memory), now)
            });
            storage.body.clear();
            storage.header_loaded = true;
            state.status = LoadStatus::Loading;
        }

        {
            let mut state = rep.state.borrow_mut();
            if let Some(storage) = state.storage.as_mut() {
                storage.body.append(data)?;
                if finished {
                    storage.body.mark_finished();
                }
            }
            if finished {
                state.status = LoadStatus::Loaded;
            }
        }
        if finished {
            rep.set_value_attr(ValueAttr::LocalTimeLoaded, self.clock.now_secs())?;
            debug!(url = %rep.log_name(), mime, "generated document written");
        }
        Ok(())
    }

    pub fn register_dynamic(&mut self, name: &str, kind: DynamicKind) -> CartaResult<DynamicAttr> {
        self.dynamic.register(name, kind)
    }

    pub fn dynamic_attr(&self, name: &str) -> Option<DynamicAttr> {
        self.dynamic.find(name)
    }

    /// Reader over the body of `handle`, or of the end of its redirect chain.
    /// `None` when there is nothing to read.
    pub fn get_descriptor(
        &self,
        handle: &Handle,
        sink: Option<SinkId>,
        redirect: Redirect,
        options: &DescriptorOptions,
    ) -> Option<DataDescriptor> {
        let target = match redirect {
            Redirect::Follow => handle.follow_redirects().0,
            Redirect::NoRedirect => handle.clone(),
        };
        {
            let rep = target.rep()?;
            let state = rep.state.borrow();
            let storage = state.storage.as_ref()?;
            if storage.body.is_empty() && state.status != LoadStatus::Loading {
                return None;
            }
        }

        let default_charset =
            encoding_for_label(&self.config.default_charset).unwrap_or(encoding_rs::WINDOWS_1252);
        Some(DataDescriptor::new(
            target,
            sink,
            options,
            default_charset,
            self.config.descriptor_chunk_bytes,
        ))
    }

    /// Whether a cached copy of `handle` must be fetched again.
    pub fn is_expired(&self, handle: &Handle, check: ExpiryCheck) -> bool {
        handle.rep().is_none_or(|rep| self.is_stale(rep, check))
    }

    fn is_stale(&self, rep: &ResourceRep, check: ExpiryCheck) -> bool {
        let state = rep.state.borrow();
        if state.storage.is_none() {
            return true;
        }
        cache::is_expired(
            &state,
            self.clock.now_secs(),
            check,
            self.config.document_expiry,
            self.config.inline_expiry,
        )
    }

    fn join(&mut self, rep: &Rc<ResourceRep>, sink: SinkId) -> CartaResult<()> {
        self.queue.set_load_callbacks(sink, rep.id())?;
        let followed = rep.flag(UintAttr::IsFollowed);
        let (header_loaded, has_data) = {
            let mut state = rep.state.borrow_mut();
            match state.storage.as_mut() {
                Some(storage) => {
                    storage.add_sink(sink);
                    (storage.header_loaded, !storage.body.is_empty())
                }
                None => (false, false),
            }
        };

        debug!(url = %rep.log_name(), sink = sink.get(), "joined running load");
        if header_loaded {
            self.queue
                .post(sink, Message::new(rep.id(), MessageKind::HeaderLoaded { followed }))?;
        }
        if has_data {
            self.queue
                .post(sink, Message::new(rep.id(), MessageKind::DataLoaded { finished: false }))?;
        }
        Ok(())
    }

    fn start_load(
        &mut self,
        rep: &Rc<ResourceRep>,
        sink: SinkId,
        options: &LoadOptions,
        mode: StartMode,
        redirect_hops: u32,
    ) -> CartaResult<CommState> {
        self.queue.set_load_callbacks(sink, rep.id())?;
        let relation = self.apply_referrer(rep, &options.referrer)?;
        rep.set_flag(UintAttr::UserInitiated, options.user_initiated)?;
        rep.set_flag(UintAttr::IsFollowed, redirect_hops > 0)?;
        rep.set_uint_attr(UintAttr::RedirectCount, redirect_hops)?;
        rep.set_url_attr(UrlAttr::MovedTo, Handle::default())?;

        let now = self.clock.now();
        let storage_config = self.storage_config.clone();
        {
            let mut state = rep.state.borrow_mut();
            let state = &mut *state;
            if !matches!(mode, StartMode::Resume(_)) {
                state.attrs.clear_response();
                state.max_age_set = false;
            }
            state.response_headers.clear();
            state.status = LoadStatus::Loading;

            let storage = state.storage.get_or_insert_with(|| {
                DataStorage::new(ResourceStorage::new(storage_config, CacheType::Memory), now)
            });
            if mode == StartMode::Fresh {
                storage.body.clear();
            }
            storage.sinks.clear();
            storage.add_sink(sink);
            storage.transfer = None;
            storage.started_at = now;
            storage.last_activity = now;
            storage.header_loaded = false;
            storage.conditional = mode == StartMode::Conditional;
            storage.not_modified = false;
        }
        info!(url = %rep.log_name(), mode = ?mode, sink = sink.get(), "load started");

        if matches!(rep.name().url_type(), UrlType::Data | UrlType::About) {
            set_transfer(rep, Some(TransferSlot::Local));
            self.local.push_back(Rc::clone(rep));
            return Ok(CommState::Loading);
        }

        let request = self.build_request(rep, &options.referrer, relation, mode)?;
        match self.transport.start(request) {
            Ok(id) => {
                set_transfer(rep, Some(TransferSlot::Remote(id)));
                self.transfers.insert(id, Rc::clone(rep));
                Ok(CommState::Loading)
            }
            Err(error) => {
                warn!(url = %rep.log_name(), %error, "transfer could not start");
                self.fail(rep, failure_for(&error));
                Ok(CommState::RequestFailed)
            }
        }
    }

    fn apply_referrer(&self, rep: &Rc<ResourceRep>, referrer: &Handle) -> CartaResult<ThirdParty> {
        let Some(referrer_rep) = referrer.rep() else {
            return Ok(ThirdParty::default());
        };
        let relation = determine_third_party(rep.name().host(), referrer_rep.name().host());
        rep.set_flag(UintAttr::IsThirdParty, relation.third_party)?;
        rep.set_flag(UintAttr::IsThirdPartyReach, relation.outside_reach)?;
        if self.privacy.disables_cookies(relation) {
            rep.set_flag(UintAttr::DisableCookies, true)?;
        }
        if !Rc::ptr_eq(referrer_rep, rep) {
            rep.set_url_attr(UrlAttr::Referrer, referrer.without_fragment())?;
        }
        Ok(relation)
    }

    fn build_request(
        &self,
        rep: &ResourceRep,
        referrer: &Handle,
        relation: ThirdParty,
        mode: StartMode,
    ) -> CartaResult<TransferRequest> {
        let method = rep.method();
        let mut request = TransferRequest::get(&rep.name().render(NameFormat::REQUEST, None));
        request.method = method.as_str().to_owned();

        if !referrer.is_empty() && self.privacy.sends_referrer(relation) {
            request
                .headers
                .push(Header::new("Referer", &referrer.name(NameVariant::NameEscaped))?);
        }

        match mode {
            StartMode::Conditional => {
                let (etag, last_modified) = cache::validators(&rep.state.borrow());
                if let Some(etag) = etag {
                    request.headers.push(Header::new("If-None-Match", &etag)?);
                }
                if let Some(last_modified) = last_modified {
                    request
                        .headers
                        .push(Header::new("If-Modified-Since", &last_modified)?);
                }
            }
            StartMode::Resume(offset) => request.range_start = Some(offset),
            StartMode::Fresh => {}
        }

        if method.forces_unique() {
            request.body = rep.str_attr(StrAttr::FormRequest).into_bytes();
        }

        request.flags = TransferFlags {
            block_user_interaction: rep.flag(UintAttr::BlockUserInteraction),
            disable_cookies: rep.flag(UintAttr::DisableCookies),
            skip_content_blocker: rep.flag(UintAttr::SkipContentBlocker),
            bypass_proxy: rep.flag(UintAttr::BypassProxy),
            user_initiated: rep.flag(UintAttr::UserInitiated),
        };
        let max_duration = rep.uint_attr(UintAttr::MaxDurationSecs);
        if max_duration > 0 {
            request.timeout = Some(Duration::from_secs(u64::from(max_duration)));
        }
        Ok(request)
    }

    fn detach_sink(&mut self, rep: &Rc<ResourceRep>, sink: SinkId) {
        self.queue.unset_callbacks_for(sink, rep.id());
        self.queue.purge(sink, rep.id());

        let (orphaned, transfer) = {
            let mut state = rep.state.borrow_mut();
            let loading = state.status == LoadStatus::Loading;
            match state.storage.as_mut() {
                Some(storage) => {
                    storage.sinks.retain(|known| *known != sink);
                    (loading && storage.sinks.is_empty(), storage.transfer)
                }
                None => (false, None),
            }
        };

        if orphaned && transfer.is_some() {
            self.abort(rep, transfer);
        }
    }

    fn abort(&mut self, rep: &Rc<ResourceRep>, transfer: Option<TransferSlot>) {
        if let Some(TransferSlot::Remote(id)) = transfer {
            self.transport.cancel(id);
            self.transfers.remove(&id);
        }
        self.local.retain(|pending| !Rc::ptr_eq(pending, rep));
        {
            let mut state = rep.state.borrow_mut();
            state.status = LoadStatus::LoadingAborted;
            if let Some(storage) = state.storage.as_mut() {
                storage.transfer = None;
            }
        }
        if let Err(error) = rep.set_flag(UintAttr::IsResuming, false) {
            debug!(%error, "resume flag left set");
        }
        info!(url = %rep.log_name(), "load aborted without listeners");
    }

    fn notify(&self, rep: &ResourceRep, kind: MessageKind) {
        for sink in rep.sinks() {
            if let Err(error) = self.queue.post(sink, Message::new(rep.id(), kind)) {
                warn!(url = %rep.log_name(), sink = sink.get(), %error, "notification dropped");
            }
        }
    }

    fn touch(&self, rep: &ResourceRep) {
        let now = self.clock.now();
        if let Some(storage) = rep.state.borrow_mut().storage.as_mut() {
            storage.last_activity = now;
        }
    }

    fn on_head(&mut self, rep: &Rc<ResourceRep>, id: TransferId, head: ResponseHead) {
        let status = head.status;
        let resuming = rep.flag(UintAttr::IsResuming);
        {
            let mut state = rep.state.borrow_mut();
            let state = &mut *state;
            state.response_headers = head.headers.clone();
            if let Some(storage) = state.storage.as_mut() {
                storage.header_loaded = true;
                if storage.conditional && status == 304 {
                    storage.not_modified = true;
                } else if storage.conditional || (resuming && status != 206) {
                    storage.body.clear();
                }
            }
        }

        if let Err(error) = self.record_response(rep, &head) {
            warn!(url = %rep.log_name(), %error, "response headers not recorded");
            self.fail(rep, failure_for(&error));
            return;
        }
        if head.peer != NetType::Undetermined {
            if let Some(server) = rep.name().server() {
                server.set_net_type(head.peer);
            }
        }

        if rep.name().url_type().is_http() && is_redirect_status(status) {
            if let Some(location) = find_header(&head.headers, "Location") {
                let location = location.to_owned();
                self.redirect(rep, id, status, &location);
                return;
            }
        }

        debug!(url = %rep.log_name(), status, "header loaded");
        let followed = rep.flag(UintAttr::IsFollowed);
        self.notify(rep, MessageKind::HeaderLoaded { followed });
    }

    fn record_response(&self, rep: &ResourceRep, head: &ResponseHead) -> CartaResult<()> {
        let header = |name: &str| find_header(&head.headers, name);
        rep.set_value_attr(ValueAttr::LocalTimeLoaded, self.clock.now_secs())?;
        rep.set_uint_attr(UintAttr::HttpResponseCode, u32::from(head.status))?;
        let security = if rep.name().url_type() == UrlType::Https {
            SecurityLevel::High
        } else {
            SecurityLevel::None
        };
        rep.set_uint_attr(UintAttr::SecurityStatus, security.to_u32())?;

        if let Some(value) = header("Content-Type") {
            rep.set_str_attr(StrAttr::HttpContentType, value)?;
            match rep.set_str_attr(StrAttr::MimeForceContentType, value) {
                Err(error) if error.is_out_of_memory() => return Err(error),
                Err(error) => debug!(%error, "content type ignored"),
                Ok(()) => {}
            }
            if rep.content_type() == ContentType::MultipartReplace {
                rep.set_flag(UintAttr::IsMultipart, true)?;
            }
        }
        if let Some(length) = header("Content-Length").and_then(|value| value.trim().parse().ok()) {
            rep.set_value_attr(ValueAttr::ContentSize, length)?;
        }

        for (name, attr) in [
            ("ETag", StrAttr::HttpEtag),
            ("Last-Modified", StrAttr::HttpLastModified),
            ("Content-Language", StrAttr::HttpContentLanguage),
            ("Content-Disposition", StrAttr::HttpContentDisposition),
            ("Content-Encoding", StrAttr::HttpContentEncoding),
            ("Location", StrAttr::HttpLocation),
            ("Refresh", StrAttr::HttpRefresh),
        ] {
            if let Some(value) = header(name) {
                rep.set_str_attr(attr, value)?;
            }
        }

        if let Some(value) = header("Content-Encoding") {
            if let Some(storage) = rep.state.borrow_mut().storage.as_mut() {
                if !storage.not_modified {
                    storage.body.set_encodings(parse_content_encodings(value));
                }
            }
        }
        if header("Accept-Ranges").is_some_and(|value| value.trim().eq_ignore_ascii_case("bytes")) {
            rep.set_flag(UintAttr::ResumeSupported, true)?;
        }

        // Date and Age feed the freshness computed from the later headers.
        for (name, attr) in [
            ("Date", StrAttr::HttpDateHeader),
            ("Age", StrAttr::HttpAgeHeader),
            ("Cache-Control", StrAttr::HttpCacheControl),
            ("Pragma", StrAttr::HttpPragma),
            ("Expires", StrAttr::HttpExpires),
        ] {
            let Some(value) = header(name) else {
                continue;
            };
            match rep.set_str_attr(attr, value) {
                Err(error) if error.is_out_of_memory() => return Err(error),
                Err(error) => debug!(header = name, %error, "cache header ignored"),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    fn redirect(&mut self, rep: &Rc<ResourceRep>, id: TransferId, status: u16, location: &str) {
        self.transport.cancel(id);
        self.transfers.remove(&id);
        set_transfer(rep, None);

        let hops = rep.uint_attr(UintAttr::RedirectCount).saturating_add(1);
        if hops > self.config.max_redirects {
            warn!(url = %rep.log_name(), hops, "too many redirects");
            self.fail(rep, LoadFailure::RedirectLimit);
            return;
        }

        let method = rep.method();
        let keep_method = matches!(status, 307 | 308) && method.forces_unique();
        let target_text = rep.name().resolve(location);
        let target = if keep_method {
            match self.new_unique(&target_text) {
                Ok(target) => target,
                Err(error) => {
                    self.fail(rep, failure_for(&error));
                    return;
                }
            }
        } else {
            self.get_url(&target_text)
        };
        let Some(target_rep) = target.rep().cloned() else {
            self.fail(rep, LoadFailure::InvalidUrl);
            return;
        };
        if !is_loadable(&target_rep) {
            warn!(url = %rep.log_name(), "redirect to a name that cannot be loaded");
            self.fail(rep, LoadFailure::InvalidUrl);
            return;
        }
        if chain_contains(&target, rep, self.config.max_redirects) {
            warn!(url = %rep.log_name(), "redirect loop");
            self.fail(rep, LoadFailure::RedirectLimit);
            return;
        }

        if let Err(error) = copy_request(rep, &target_rep, keep_method)
            .and_then(|()| rep.set_url_attr(UrlAttr::MovedTo, target.without_fragment()))
        {
            self.fail(rep, failure_for(&error));
            return;
        }

        let sinks = {
            let mut state = rep.state.borrow_mut();
            state.status = LoadStatus::Redirected;
            state
                .storage
                .as_mut()
                .map(|storage| std::mem::take(&mut storage.sinks))
                .unwrap_or_default()
        };
        info!(
            from = %rep.log_name(),
            to = %target_rep.log_name(),
            status,
            hops,
            "redirected"
        );

        let options = LoadOptions {
            referrer: rep.url_attr(UrlAttr::Referrer),
            expiry: None,
            user_initiated: rep.flag(UintAttr::UserInitiated),
        };
        for sink in sinks {
            let moved = Message::new(rep.id(), MessageKind::Moved { target: target_rep.id() });
            if let Err(error) = self.queue.post(sink, moved) {
                warn!(sink = sink.get(), %error, "redirect notification dropped");
            }
            if let Err(error) = self.follow(&target_rep, sink, &options, hops) {
                warn!(url = %target_rep.log_name(), %error, "redirect target not loaded");
            }
        }
    }

    fn follow(
        &mut self,
        target: &Rc<ResourceRep>,
        sink: SinkId,
        options: &LoadOptions,
        hops: u32,
    ) -> CartaResult<()> {
        match target.status() {
            LoadStatus::Loading => self.join(target, sink),
            LoadStatus::Loaded if !self.is_stale(target, options.expiry()) => {
                self.queue.set_load_callbacks(sink, target.id())?;
                target.set_flag(UintAttr::IsFollowed, true)?;
                target.set_uint_attr(UintAttr::RedirectCount, hops)?;
                self.queue.post(
                    sink,
                    Message::new(target.id(), MessageKind::HeaderLoaded { followed: true }),
                )?;
                self.queue.post(
                    sink,
                    Message::new(target.id(), MessageKind::DataLoaded { finished: true }),
                )
            }
            _ => self
                .start_load(target, sink, options, StartMode::Fresh, hops)
                .map(|_| ()),
        }
    }

    fn on_data(&mut self, rep: &Rc<ResourceRep>, bytes: &[u8]) {
        let result = {
            let mut state = rep.state.borrow_mut();
            match state.storage.as_mut() {
                Some(storage) if storage.not_modified => return,
                Some(storage) => storage.body.append(bytes),
                None => Ok(()),
            }
        };
        match result {
            Ok(()) => self.notify(rep, MessageKind::DataLoaded { finished: false }),
            Err(error) => {
                warn!(url = %rep.log_name(), %error, "body not stored");
                self.fail(rep, failure_for(&error));
            }
        }
    }

    fn on_boundary(&mut self, rep: &Rc<ResourceRep>) {
        if let Some(storage) = rep.state.borrow_mut().storage.as_mut() {
            storage.body.start_new_part();
        }
        if let Err(error) = rep.set_flag(UintAttr::IsMultipart, true) {
            debug!(%error, "multipart flag not set");
        }
        self.notify(rep, MessageKind::MultipartReload);
    }

    fn on_finished(&mut self, rep: &Rc<ResourceRep>, id: TransferId) {
        self.transfers.remove(&id);
        let (bytes, revalidated) = {
            let mut state = rep.state.borrow_mut();
            state.status = LoadStatus::Loaded;
            match state.storage.as_mut() {
                Some(storage) => {
                    storage.transfer = None;
                    storage.body.mark_finished();
                    (storage.body.total_loaded(), storage.not_modified)
                }
                None => (0, false),
            }
        };
        if let Err(error) = rep.set_flag(UintAttr::IsResuming, false) {
            debug!(%error, "resume flag left set");
        }

        info!(url = %rep.log_name(), bytes, revalidated, "load finished");
        self.notify(rep, MessageKind::DataLoaded { finished: true });
        clear_sinks(rep);
    }

    fn fail(&mut self, rep: &Rc<ResourceRep>, failure: LoadFailure) {
        let transfer = rep
            .state
            .borrow_mut()
            .storage
            .as_mut()
            .and_then(|storage| storage.transfer.take());
        if let Some(TransferSlot::Remote(id)) = transfer {
            self.transport.cancel(id);
            self.transfers.remove(&id);
        }
        self.local.retain(|pending| !Rc::ptr_eq(pending, rep));

        rep.set_status(match failure {
            LoadFailure::Aborted => LoadStatus::LoadingAborted,
            _ => LoadStatus::LoadingFailure,
        });
        if let Err(error) = rep.set_flag(UintAttr::IsResuming, false) {
            debug!(%error, "resume flag left set");
        }

        warn!(url = %rep.log_name(), failure = failure.as_str(), "load failed");
        self.notify(rep, MessageKind::LoadingFailed { failure });
        clear_sinks(rep);
    }

    fn check_timeouts(&mut self) {
        let now = self.clock.now();
        let expired: Vec<Rc<ResourceRep>> = self
            .transfers
            .values()
            .filter(|rep| timed_out(rep, now))
            .cloned()
            .collect();
        for rep in expired {
            warn!(url = %rep.log_name(), "load timed out");
            self.fail(&rep, LoadFailure::Timeout);
        }
    }

    fn complete_local(&mut self, rep: &Rc<ResourceRep>) {
        let pending = rep.is_loading()
            && rep
                .state
                .borrow()
                .storage
                .as_ref()
                .is_some_and(|storage| storage.transfer == Some(TransferSlot::Local));
        if !pending {
            return;
        }

        let (mime, body) = match rep.name().url_type() {
            UrlType::Data => match decode_data_url(rep.name().path()) {
                Ok(data) => (data.mime, data.body),
                Err(error) => {
                    debug!(url = %rep.log_name(), %error, "data URL rejected");
                    self.fail(rep, LoadFailure::InvalidUrl);
                    return;
                }
            },
            UrlType::About if rep.name().path() == "blank" => ("text/html".to_owned(), Vec::new()),
            _ => {
                self.fail(rep, LoadFailure::InvalidUrl);
                return;
            }
        };

        if let Err(error) = self.store_local(rep, &mime, &body) {
            warn!(url = %rep.log_name(), %error, "in-process load failed");
            self.fail(rep, failure_for(&error));
            return;
        }

        let followed = rep.flag(UintAttr::IsFollowed);
        debug!(url = %rep.log_name(), bytes = body.len(), "in-process load finished");
        self.notify(rep, MessageKind::HeaderLoaded { followed });
        self.notify(rep, MessageKind::DataLoaded { finished: true });
        clear_sinks(rep);
    }

    fn store_local(&self, rep: &ResourceRep, mime: &str, body: &[u8]) -> CartaResult<()> {
        match rep.set_str_attr(StrAttr::MimeForceContentType, mime) {
            Err(error) if error.is_out_of_memory() => return Err(error),
            Err(error) => debug!(%error, "data URL type ignored"),
            Ok(()) => {}
        }
        rep.set_value_attr(ValueAttr::LocalTimeLoaded, self.clock.now_secs())?;

        let mut state = rep.state.borrow_mut();
        if let Some(storage) = state.storage.as_mut() {
            storage.body.append(body)?;
            storage.body.mark_finished();
            storage.header_loaded = true;
            storage.transfer = None;
        }
        state.status = LoadStatus::Loaded;
        Ok(())
    }
}

fn attach_fragment(rep: Rc<ResourceRep>, fragment: Option<&str>) -> Handle {
    let index = match fragment {
        Some(fragment) => match rep.fragment_index(fragment) {
            Ok(index) => Some(index),
            Err(error) => {
                warn!(%error, "fragment dropped");
                None
            }
        },
        None => None,
    };
    Handle::with_fragment(rep, index)
}

fn is_loadable(rep: &ResourceRep) -> bool {
    rep.name().is_valid() && rep.name().url_type().is_loadable()
}

/// Validators exist and the body is not a user file.
fn allows_conditional(rep: &ResourceRep) -> bool {
    let state = rep.state.borrow();
    let Some(storage) = state.storage.as_ref() else {
        return false;
    };
    if storage.body.cache_type() == CacheType::UserFile || !storage.body.is_finished() {
        return false;
    }
    let (etag, last_modified) = cache::validators(&state);
    etag.is_some() || last_modified.is_some()
}

fn set_transfer(rep: &ResourceRep, transfer: Option<TransferSlot>) {
    if let Some(storage) = rep.state.borrow_mut().storage.as_mut() {
        storage.transfer = transfer;
    }
}

fn clear_sinks(rep: &ResourceRep) {
    if let Some(storage) = rep.state.borrow_mut().storage.as_mut() {
        storage.sinks.clear();
    }
}

fn timed_out(rep: &ResourceRep, now: Duration) -> bool {
    let max_duration = rep.uint_attr(UintAttr::MaxDurationSecs);
    let idle = rep.uint_attr(UintAttr::IdleTimeoutSecs);
    let state = rep.state.borrow();
    let Some(storage) = state.storage.as_ref() else {
        return false;
    };
    let over = |since: Duration, limit: u32| {
        limit > 0 && now.saturating_sub(since) >= Duration::from_secs(u64::from(limit))
    };
    over(storage.started_at, max_duration) || over(storage.last_activity, idle)
}

/// True when `needle` is `start` or is reached from it through `MovedTo`.
fn chain_contains(start: &Handle, needle: &Rc<ResourceRep>, limit: u32) -> bool {
    let mut current = start.clone();
    for _ in 0..=limit {
        let Some(rep) = current.rep().cloned() else {
            return false;
        };
        if Rc::ptr_eq(&rep, needle) {
            return true;
        }
        current = rep.url_attr(UrlAttr::MovedTo);
    }
    false
}

/// Carries the request over to a redirect target. Method and body only
/// survive 307 and 308.
fn copy_request(from: &ResourceRep, to: &ResourceRep, keep_method: bool) -> CartaResult<()> {
    if keep_method {
        let method = from.method();
        to.set_str_attr(StrAttr::HttpSpecialMethod, method.as_str())?;
        to.set_str_attr(StrAttr::FormRequest, &from.str_attr(StrAttr::FormRequest))?;
    }
    for attr in [
        UintAttr::BlockUserInteraction,
        UintAttr::SkipContentBlocker,
        UintAttr::BypassProxy,
        UintAttr::DisableCookies,
    ] {
        if from.flag(attr) {
            to.set_flag(attr, true)?;
        }
    }
    let referrer = from.url_attr(UrlAttr::Referrer);
    if !referrer.is_empty() {
        to.set_url_attr(UrlAttr::Referrer, referrer)?;
    }
    Ok(())
}
