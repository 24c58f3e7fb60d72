//! Shared record of one logical resource.

use crate::attr::AttributeStore;
use crate::attr::DynamicAttr;
use crate::attr::DynamicKind;
use crate::attr::Slot;
use crate::attr::StrAttr;
use crate::attr::UintAttr;
use crate::attr::UrlAttr;
use crate::attr::ValueAttr;
use crate::cache;
use crate::content::ContentType;
use crate::content::MimeType;
use crate::content::charset_id;
use crate::handle::Handle;
use crate::name::NameComponents;
use crate::name::NameFormat;
use crate::name::NameVariant;
use carta_core::CartaError;
use carta_core::CartaResult;
use carta_core::Clock;
use carta_core::try_owned_string;
use carta_event::ResourceId;
use carta_event::SinkId;
use carta_net::Header;
use carta_net::HttpMethod;
use carta_net::TransferId;
use carta_net::http::find_header;
use carta_net::http::is_token;
use carta_storage::CacheType;
use carta_storage::ResourceStorage;
use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

/// Load state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LoadStatus {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    LoadingFailure,
    LoadingAborted,
    Redirected,
}

impl LoadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading => "loading",
            Self::Loaded => "loaded",
            Self::LoadingFailure => "loading_failure",
            Self::LoadingAborted => "loading_aborted",
            Self::Redirected => "redirected",
        }
    }

    pub fn to_u32(self) -> u32 {
        match self {
            Self::Unloaded => 0,
            Self::Loading => 1,
            Self::Loaded => 2,
            Self::LoadingFailure => 3,
            Self::LoadingAborted => 4,
            Self::Redirected => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferSlot {
    Remote(TransferId),
    /// Served in-process, completed by the manager on the next pump.
    Local,
}

/// Body and live load bookkeeping. Attached on first load, detachable.
#[derive(Debug)]
pub(crate) struct DataStorage {
    pub body: ResourceStorage,
    pub sinks: Vec<SinkId>,
    pub transfer: Option<TransferSlot>,
    pub started_at: Duration,
    pub last_activity: Duration,
    pub header_loaded: bool,
    pub conditional: bool,
    /// The conditional request was answered with 304; the cached body stays.
    pub not_modified: bool,
}

impl DataStorage {
    pub fn new(body: ResourceStorage, now: Duration) -> Self {
        Self {
            body,
            sinks: Vec::new(),
            transfer: None,
            started_at: now,
            last_activity: now,
            header_loaded: false,
            conditional: false,
            not_modified: false,
        }
    }

    pub fn add_sink(&mut self, sink: SinkId) {
        if !self.sinks.contains(&sink) {
            self.sinks.push(sink);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RepState {
    pub attrs: AttributeStore,
    pub status: LoadStatus,
    pub content_type: ContentType,
    pub fragments: Vec<String>,
    pub storage: Option<DataStorage>,
    pub response_headers: Vec<Header>,
    pub max_age_set: bool,
}

/// One logical resource. Only reachable through [`Handle`].
pub struct ResourceRep {
    id: ResourceId,
    name: NameComponents,
    clock: Rc<dyn Clock>,
    pub(crate) state: RefCell<RepState>,
    in_use: Cell<u32>,
}

impl core::fmt::Debug for ResourceRep {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResourceRep")
            .field("id", &self.id)
            .field("name", &self.name.render(NameVariant::NameUsernamePasswordHidden.format(), None))
            .field("status", &self.state.borrow().status)
            .field("in_use", &self.in_use.get())
            .finish_non_exhaustive()
    }
}

fn read_only(attr: &str) -> CartaError {
    CartaError::invalid_state("url.attr.read_only", format!("attribute `{attr}` is read-only"))
}

impl ResourceRep {
    pub(crate) fn new(id: ResourceId, name: NameComponents, clock: Rc<dyn Clock>) -> Self {
        let content_type = ContentType::from_path(name.path());
        Self {
            id,
            name,
            clock,
            state: RefCell::new(RepState {
                content_type,
                ..RepState::default()
            }),
            in_use: Cell::new(0),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &NameComponents {
        &self.name
    }

    pub(crate) fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Table key: full escaped name with credentials, without fragment.
    pub(crate) fn key(&self) -> String {
        self.name.render(NameFormat::KEY, None)
    }

    /// Name safe for logs.
    pub(crate) fn log_name(&self) -> String {
        self.name
            .render(NameVariant::NameUsernamePasswordHiddenEscaped.format(), None)
    }

    pub fn status(&self) -> LoadStatus {
        self.state.borrow().status
    }

    pub(crate) fn set_status(&self, status: LoadStatus) {
        self.state.borrow_mut().status = status;
    }

    pub fn content_type(&self) -> ContentType {
        self.state.borrow().content_type
    }

    pub fn in_use_count(&self) -> u32 {
        self.in_use.get()
    }

    pub fn is_unique(&self) -> bool {
        self.state.borrow().attrs.flag(UintAttr::IsUnique)
    }

    pub(crate) fn mark_unique(&self) -> CartaResult<()> {
        self.state
            .borrow_mut()
            .attrs
            .set_flag(UintAttr::IsUnique, true)
    }

    pub fn is_loading(&self) -> bool {
        self.status() == LoadStatus::Loading
    }

    pub fn method(&self) -> HttpMethod {
        let state = self.state.borrow();
        let code = state.attrs.uint(Slot::Fixed(UintAttr::HttpMethod));
        let special = state.attrs.string(Slot::Fixed(StrAttr::HttpSpecialMethod));
        match HttpMethod::from_u32(code) {
            Some(method) => method,
            None if !special.is_empty() => HttpMethod::Special(special.to_owned()),
            None => HttpMethod::Get,
        }
    }

    /// Index of the fragment record for `fragment`, creating it on demand.
    pub(crate) fn fragment_index(&self, fragment: &str) -> CartaResult<usize> {
        let mut state = self.state.borrow_mut();
        if let Some(index) = state.fragments.iter().position(|known| known == fragment) {
            return Ok(index);
        }
        state.fragments.try_reserve(1).map_err(|error| {
            CartaError::out_of_memory("url.fragment.out_of_memory", error.to_string())
        })?;
        state
            .fragments
            .push(try_owned_string(fragment, "url.fragment.out_of_memory")?);
        Ok(state.fragments.len() - 1)
    }

    pub(crate) fn fragment(&self, index: usize) -> Option<String> {
        self.state.borrow().fragments.get(index).cloned()
    }

    pub fn uint_attr(&self, attr: UintAttr) -> u32 {
        let state = self.state.borrow();
        match attr {
            UintAttr::LoadStatus => state.status.to_u32(),
            UintAttr::ContentType => state.content_type.to_u32(),
            UintAttr::TrustRating => self
                .name
                .server()
                .map_or(0, |server| {
                    server.trust_rating_for(&self.trust_key()).to_u32()
                }),
            UintAttr::HeaderLoaded => {
                u32::from(state.storage.as_ref().is_some_and(|storage| storage.header_loaded))
            }
            UintAttr::CacheType => state.storage.as_ref().map_or_else(
                || state.attrs.uint(Slot::Fixed(attr)),
                |storage| storage.body.cache_type().to_u32(),
            ),
            _ => state.attrs.uint(Slot::Fixed(attr)),
        }
    }

    pub fn set_uint_attr(&self, attr: UintAttr, value: u32) -> CartaResult<()> {
        if attr.is_read_only() {
            return Err(read_only(attr.as_str()));
        }
        if attr.is_http_only() && !self.name.url_type().is_http() {
            return Ok(());
        }
        if let Some((min, max)) = attr.range() {
            if value < min || value > max {
                return Err(CartaError::invalid_state(
                    "url.attr.out_of_range",
                    format!("{value} is outside {min}..={max} for `{}`", attr.as_str()),
                ));
            }
        }

        match attr {
            UintAttr::ContentType => {
                self.state.borrow_mut().content_type = ContentType::from_u32(value);
                Ok(())
            }
            UintAttr::HttpMethod => {
                self.state
                    .borrow_mut()
                    .attrs
                    .set_uint(Slot::Fixed(attr), value)?;
                if HttpMethod::from_u32(value).is_some_and(|method| method.forces_unique()) {
                    self.mark_unique()?;
                }
                Ok(())
            }
            UintAttr::CacheType => {
                let mut state = self.state.borrow_mut();
                state.attrs.set_uint(Slot::Fixed(attr), value)?;
                if let Some(storage) = state.storage.as_mut() {
                    storage.body.set_cache_type(CacheType::from_u32(value));
                }
                Ok(())
            }
            _ => self
                .state
                .borrow_mut()
                .attrs
                .set_uint(Slot::Fixed(attr), value),
        }
    }

    pub(crate) fn set_flag(&self, attr: UintAttr, value: bool) -> CartaResult<()> {
        self.state.borrow_mut().attrs.set_flag(attr, value)
    }

    pub(crate) fn flag(&self, attr: UintAttr) -> bool {
        self.state.borrow().attrs.flag(attr)
    }

    pub fn str_attr(&self, attr: StrAttr) -> String {
        match attr {
            StrAttr::ServerName => self.name.host().to_owned(),
            _ => self
                .state
                .borrow()
                .attrs
                .string(Slot::Fixed(attr))
                .to_owned(),
        }
    }

    pub fn set_str_attr(&self, attr: StrAttr, value: &str) -> CartaResult<()> {
        if attr.is_read_only() {
            return Err(read_only(attr.as_str()));
        }
        if attr.is_http_only() && !self.name.url_type().is_http() {
            return Ok(());
        }

        let now = self.clock.now_secs();
        let https_get = self.name.url_type().is_secure() && self.method() == HttpMethod::Get;
        let mut state = self.state.borrow_mut();
        match attr {
            StrAttr::HttpCacheControl => cache::apply_cache_control(&mut state, value, now, https_get),
            StrAttr::HttpPragma => cache::apply_pragma(&mut state, value),
            StrAttr::HttpExpires => cache::apply_expires(&mut state, value, now),
            StrAttr::HttpAgeHeader => cache::apply_age(&mut state, value, now),
            StrAttr::HttpDateHeader => cache::apply_date(&mut state, value),
            StrAttr::MimeForceContentType => force_content_type(&mut state, value),
            StrAttr::HttpSpecialMethod => {
                if !is_token(value) {
                    return Err(CartaError::parse(
                        "url.attr.method_invalid",
                        format!("`{value}` is not a method token"),
                    ));
                }
                let method = HttpMethod::parse(value)?;
                let mut staged = state.attrs.clone();
                staged.set_string(Slot::Fixed(attr), method.as_str())?;
                staged.set_uint(Slot::Fixed(UintAttr::HttpMethod), method.to_u32())?;
                if method.forces_unique() {
                    staged.set_flag(UintAttr::IsUnique, true)?;
                }
                state.attrs = staged;
                Ok(())
            }
            _ => state.attrs.set_string(Slot::Fixed(attr), value),
        }
    }

    pub fn value_attr(&self, attr: ValueAttr) -> u64 {
        let state = self.state.borrow();
        match attr {
            ValueAttr::ContentLoaded => state
                .storage
                .as_ref()
                .map_or(0, |storage| storage.body.total_loaded()),
            _ => state.attrs.value(attr),
        }
    }

    pub fn set_value_attr(&self, attr: ValueAttr, value: u64) -> CartaResult<()> {
        if attr.is_read_only() {
            return Err(read_only(attr.as_str()));
        }
        self.state.borrow_mut().attrs.set_value(attr, value)
    }

    pub fn url_attr(&self, attr: UrlAttr) -> Handle {
        self.state.borrow().attrs.url(Slot::Fixed(attr))
    }

    pub fn set_url_attr(&self, attr: UrlAttr, target: Handle) -> CartaResult<()> {
        self.state
            .borrow_mut()
            .attrs
            .set_url(Slot::Fixed(attr), target)
    }

    pub fn dynamic_uint(&self, attr: DynamicAttr) -> u32 {
        if attr.kind() != DynamicKind::Uint {
            return 0;
        }
        self.state.borrow().attrs.uint(Slot::Dynamic(attr.id()))
    }

    pub fn set_dynamic_uint(&self, attr: DynamicAttr, value: u32) -> CartaResult<()> {
        expect_kind(attr, DynamicKind::Uint)?;
        self.state
            .borrow_mut()
            .attrs
            .set_uint(Slot::Dynamic(attr.id()), value)
    }

    pub fn dynamic_str(&self, attr: DynamicAttr) -> String {
        if attr.kind() != DynamicKind::Str {
            return String::new();
        }
        self.state
            .borrow()
            .attrs
            .string(Slot::Dynamic(attr.id()))
            .to_owned()
    }

    pub fn set_dynamic_str(&self, attr: DynamicAttr, value: &str) -> CartaResult<()> {
        expect_kind(attr, DynamicKind::Str)?;
        self.state
            .borrow_mut()
            .attrs
            .set_string(Slot::Dynamic(attr.id()), value)
    }

    pub fn dynamic_url(&self, attr: DynamicAttr) -> Handle {
        if attr.kind() != DynamicKind::Url {
            return Handle::default();
        }
        self.state.borrow().attrs.url(Slot::Dynamic(attr.id()))
    }

    pub fn set_dynamic_url(&self, attr: DynamicAttr, target: Handle) -> CartaResult<()> {
        expect_kind(attr, DynamicKind::Url)?;
        self.state
            .borrow_mut()
            .attrs
            .set_url(Slot::Dynamic(attr.id()), target)
    }

    /// Value of a response header from the last load, if it was received.
    pub fn response_header(&self, name: &str) -> Option<String> {
        find_header(&self.state.borrow().response_headers, name).map(str::to_owned)
    }

    /// `host[:port]/path` form used by blacklist matching.
    pub(crate) fn trust_key(&self) -> String {
        let mut key = self.name.host_and_port();
        key.push_str(self.name.path());
        key
    }

    /// Byte offset a resumed load would continue from.
    pub(crate) fn resume_offset(&self) -> u64 {
        self.state
            .borrow()
            .storage
            .as_ref()
            .map_or(0, |storage| storage.body.total_loaded())
    }

    pub(crate) fn sinks(&self) -> Vec<SinkId> {
        self.state
            .borrow()
            .storage
            .as_ref()
            .map(|storage| storage.sinks.clone())
            .unwrap_or_default()
    }

    pub(crate) fn has_body(&self) -> bool {
        self.state
            .borrow()
            .storage
            .as_ref()
            .is_some_and(|storage| !storage.body.is_empty())
    }

    /// Releases the body while keeping metadata. Refused while loading.
    pub(crate) fn detach_storage(&self) -> bool {
        let mut state = self.state.borrow_mut();
        if state.status == LoadStatus::Loading {
            return false;
        }
        state.storage.take().is_some()
    }

    fn enter(&self) {
        self.in_use.set(self.in_use.get().saturating_add(1));
    }

    fn leave(&self) {
        self.in_use.set(self.in_use.get().saturating_sub(1));
    }
}

fn expect_kind(attr: DynamicAttr, kind: DynamicKind) -> CartaResult<()> {
    if attr.kind() == kind {
        Ok(())
    } else {
        Err(CartaError::invalid_state(
            "url.attr.dynamic_kind_mismatch",
            format!("dynamic attribute {} is not a {kind:?} attribute", attr.id()),
        ))
    }
}

/// Applies a forced MIME type. Every value is computed before any field is
/// written so a failure leaves the previous type intact.
fn force_content_type(state: &mut RepState, value: &str) -> CartaResult<()> {
    let mime = MimeType::parse(value)?;
    let content_type = ContentType::from_mime(&mime.essence);
    let charset = match (&mime.charset, mime.is_text()) {
        (Some(label), true) => Some((label.clone(), charset_id(label))),
        _ => None,
    };

    let mut staged = state.attrs.clone();
    staged.set_string(Slot::Fixed(StrAttr::MimeType), &mime.essence)?;
    if let Some((label, id)) = &charset {
        staged.set_string(Slot::Fixed(StrAttr::CharsetName), label)?;
        staged.set_uint(Slot::Fixed(UintAttr::Charset), *id)?;
    }

    state.attrs = staged;
    state.content_type = content_type;
    Ok(())
}

/// Marks a resource in use for its lifetime; in-use resources are never
/// evicted.
#[derive(Debug)]
pub struct InUse {
    rep: Option<Rc<ResourceRep>>,
}

impl InUse {
    pub fn new(handle: &Handle) -> Self {
        let rep = handle.rep().cloned();
        if let Some(rep) = &rep {
            rep.enter();
        }
        Self { rep }
    }

    pub fn handle(&self) -> Handle {
        self.rep.clone().map(Handle::from_rep).unwrap_or_default()
    }
}

impl Drop for InUse {
    fn drop(&mut self) {
        if let Some(rep) = &self.rep {
            rep.leave();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InUse;
    use super::LoadStatus;
    use super::ResourceRep;
    use crate::attr::StrAttr;
    use crate::attr::UintAttr;
    use crate::attr::ValueAttr;
    use crate::content::ContentType;
    use crate::handle::Handle;
    use crate::name::NameComponents;
    use crate::server::ServerNameRegistry;
    use carta_core::ManualClock;
    use carta_event::ResourceId;
    use std::rc::Rc;

    fn rep(text: &str) -> Rc<ResourceRep> {
        let registry = ServerNameRegistry::new();
        let parsed = NameComponents::parse(text, &registry);
        Rc::new(ResourceRep::new(
            ResourceId(1),
            parsed.components,
            Rc::new(ManualClock::at_secs(1_000)),
        ))
    }

    #[test]
    fn read_only_attributes_reject_writes() {
        let rep = rep("http://a.test/");
        match rep.set_uint_attr(UintAttr::LoadStatus, 2) {
            Err(error) => assert_eq!(error.code, "url.attr.read_only"),
            Ok(()) => panic!("read-only write accepted"),
        }
        assert_eq!(rep.status(), LoadStatus::Unloaded);
    }

    #[test]
    fn range_is_enforced() {
        let rep = rep("http://a.test/");
        let result = rep.set_uint_attr(UintAttr::IsThirdParty, 2);
        assert!(matches!(result, Err(error) if error.code == "url.attr.out_of_range"));
        assert!(rep.set_uint_attr(UintAttr::IsThirdParty, 1).is_ok());
        assert_eq!(rep.uint_attr(UintAttr::IsThirdParty), 1);
    }

    #[test]
    fn post_method_makes_resource_unique() {
        let rep = rep("http://a.test/form");
        assert!(!rep.is_unique());
        assert!(rep.set_uint_attr(UintAttr::HttpMethod, 1).is_ok());
        assert!(rep.is_unique());
        assert_eq!(rep.method().as_str(), "POST");
    }

    #[test]
    fn special_method_must_be_a_token() {
        let rep = rep("http://a.test/");
        let bad = rep.set_str_attr(StrAttr::HttpSpecialMethod, "BAD METHOD");
        assert!(matches!(bad, Err(error) if error.code == "url.attr.method_invalid"));
        assert!(rep.set_str_attr(StrAttr::HttpSpecialMethod, "PROPFIND").is_ok());
        assert_eq!(rep.method().as_str(), "PROPFIND");
    }

    #[test]
    fn rejected_special_method_keeps_previous_method() {
        let rep = rep("http://a.test/dav");
        assert!(rep.set_str_attr(StrAttr::HttpSpecialMethod, "PROPFIND").is_ok());
        let method_id = rep.uint_attr(UintAttr::HttpMethod);

        assert!(rep.set_str_attr(StrAttr::HttpSpecialMethod, "NOT A TOKEN").is_err());
        assert_eq!(rep.str_attr(StrAttr::HttpSpecialMethod), "PROPFIND");
        assert_eq!(rep.uint_attr(UintAttr::HttpMethod), method_id);
        assert_eq!(rep.method().as_str(), "PROPFIND");
    }

    #[test]
    fn http_only_attributes_are_ignored_elsewhere() {
        let rep = rep("ftp://files.test/readme");
        assert!(rep.set_uint_attr(UintAttr::HttpResponseCode, 200).is_ok());
        assert_eq!(rep.uint_attr(UintAttr::HttpResponseCode), 0);
    }

    #[test]
    fn forced_content_type_sets_charset_for_text() {
        let rep = rep("http://a.test/file.bin");
        assert!(rep
            .set_str_attr(StrAttr::MimeForceContentType, "text/html; charset=utf-8")
            .is_ok());
        assert_eq!(rep.content_type(), ContentType::Html);
        assert_eq!(rep.str_attr(StrAttr::MimeType), "text/html");
        assert_eq!(rep.str_attr(StrAttr::CharsetName), "utf-8");
        assert_ne!(rep.uint_attr(UintAttr::Charset), 0);
    }

    #[test]
    fn failed_force_leaves_type_untouched() {
        let rep = rep("http://a.test/page.html");
        assert!(rep.set_str_attr(StrAttr::MimeForceContentType, "nonsense").is_err());
        assert_eq!(rep.content_type(), ContentType::Html);
        assert_eq!(rep.str_attr(StrAttr::MimeType), "");
    }

    #[test]
    fn in_use_guard_counts_scopes() {
        let rep = rep("http://a.test/");
        let handle = Handle::from_rep(Rc::clone(&rep));
        {
            let _outer = InUse::new(&handle);
            let _inner = InUse::new(&handle);
            assert_eq!(rep.in_use_count(), 2);
        }
        assert_eq!(rep.in_use_count(), 0);
        assert_eq!(rep.value_attr(ValueAttr::ContentLoaded), 0);
    }
}
