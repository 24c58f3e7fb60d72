//! Cooperative message delivery between resources and their listeners.

use carta_core::CartaError;
use carta_core::CartaResult;
use serde::Deserialize;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::rc::Rc;
use tracing::trace;

const DEFAULT_MAX_PENDING_MESSAGES: usize = 64 * 1024;

/// Listener identity handed out by [`MessageQueue::open_sink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SinkId(u64);

impl SinkId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Identity of the resource a message is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

/// Why a load ended without data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadFailure {
    Network,
    Timeout,
    RedirectLimit,
    Aborted,
    OutOfMemory,
    NoAccess,
    InvalidUrl,
    HttpStatus(u16),
}

impl LoadFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RedirectLimit => "redirect_limit",
            Self::Aborted => "aborted",
            Self::OutOfMemory => "out_of_memory",
            Self::NoAccess => "no_access",
            Self::InvalidUrl => "invalid_url",
            Self::HttpStatus(_) => "http_status",
        }
    }

    /// Numeric code carried by `LoadingFailed` notifications.
    pub fn code(self) -> u32 {
        match self {
            Self::Network => 1,
            Self::Timeout => 2,
            Self::RedirectLimit => 3,
            Self::Aborted => 4,
            Self::OutOfMemory => 5,
            Self::NoAccess => 6,
            Self::InvalidUrl => 7,
            Self::HttpStatus(status) => 1000 + u32::from(status),
        }
    }
}

/// Message identifiers a sink can register callbacks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    HeaderLoaded,
    DataLoaded,
    MultipartReload,
    LoadingFailed,
    Moved,
}

impl MessageId {
    /// Every load progress message, in the order a load emits them.
    pub const LOAD_PROGRESS: [MessageId; 5] = [
        MessageId::HeaderLoaded,
        MessageId::DataLoaded,
        MessageId::MultipartReload,
        MessageId::LoadingFailed,
        MessageId::Moved,
    ];
}

/// Load progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    HeaderLoaded { followed: bool },
    DataLoaded { finished: bool },
    MultipartReload,
    LoadingFailed { failure: LoadFailure },
    Moved { target: ResourceId },
}

impl MessageKind {
    pub fn id(self) -> MessageId {
        match self {
            Self::HeaderLoaded { .. } => MessageId::HeaderLoaded,
            Self::DataLoaded { .. } => MessageId::DataLoaded,
            Self::MultipartReload => MessageId::MultipartReload,
            Self::LoadingFailed { .. } => MessageId::LoadingFailed,
            Self::Moved { .. } => MessageId::Moved,
        }
    }

    /// True for the last message a sink receives for one load.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::DataLoaded { finished: true } | Self::LoadingFailed { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub source: ResourceId,
    pub kind: MessageKind,
}

impl Message {
    pub fn new(source: ResourceId, kind: MessageKind) -> Self {
        Self { source, kind }
    }
}

/// Queue limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_pending_messages: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> CartaResult<()> {
        if self.max_pending_messages == 0 {
            return Err(CartaError::policy(
                "event.max_pending_invalid",
                "queue max_pending_messages must be greater than zero",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct QueueState {
    next_sink: u64,
    pending: VecDeque<(SinkId, Message)>,
    inboxes: HashMap<SinkId, VecDeque<Message>>,
    callbacks: HashMap<SinkId, HashSet<(MessageId, ResourceId)>>,
}

/// Single-threaded message queue.
///
/// Posting only enqueues. Messages reach a sink's inbox on the next
/// [`MessageQueue::deliver`], and only if the sink still has a callback for
/// that (message, source) pair at that moment. Clones share one queue.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    config: QueueConfig,
    state: Rc<RefCell<QueueState>>,
}

impl MessageQueue {
    pub fn new(config: QueueConfig) -> CartaResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: Rc::new(RefCell::new(QueueState::default())),
        })
    }

    pub fn open_sink(&self) -> SinkId {
        let mut state = self.state.borrow_mut();
        state.next_sink = state.next_sink.saturating_add(1);
        let sink = SinkId(state.next_sink);
        state.inboxes.insert(sink, VecDeque::new());
        sink
    }

    pub fn is_open(&self, sink: SinkId) -> bool {
        self.state.borrow().inboxes.contains_key(&sink)
    }

    /// Drops the sink with every queued and delivered message for it.
    pub fn close_sink(&self, sink: SinkId) {
        let mut state = self.state.borrow_mut();
        state.inboxes.remove(&sink);
        state.callbacks.remove(&sink);
        state.pending.retain(|(target, _)| *target != sink);
    }

    pub fn set_callback(&self, sink: SinkId, id: MessageId, source: ResourceId) -> CartaResult<()> {
        let mut state = self.state.borrow_mut();
        if !state.inboxes.contains_key(&sink) {
            return Err(CartaError::null_pointer(
                "event.sink_closed",
                format!("sink {} is not open", sink.0),
            ));
        }
        state.callbacks.entry(sink).or_default().insert((id, source));
        Ok(())
    }

    pub fn set_load_callbacks(&self, sink: SinkId, source: ResourceId) -> CartaResult<()> {
        for id in MessageId::LOAD_PROGRESS {
            self.set_callback(sink, id, source)?;
        }
        Ok(())
    }

    pub fn has_callback(&self, sink: SinkId, id: MessageId, source: ResourceId) -> bool {
        self.state
            .borrow()
            .callbacks
            .get(&sink)
            .is_some_and(|set| set.contains(&(id, source)))
    }

    /// Removes every callback `sink` holds for `source`.
    pub fn unset_callbacks_for(&self, sink: SinkId, source: ResourceId) {
        if let Some(set) = self.state.borrow_mut().callbacks.get_mut(&sink) {
            set.retain(|(_, registered)| *registered != source);
        }
    }

    /// Removes every callback `sink` holds.
    pub fn unset_callbacks(&self, sink: SinkId) {
        self.state.borrow_mut().callbacks.remove(&sink);
    }

    pub fn post(&self, sink: SinkId, message: Message) -> CartaResult<()> {
        let mut state = self.state.borrow_mut();
        if state.pending.len() >= self.config.max_pending_messages {
            return Err(CartaError::invalid_state(
                "event.queue_full",
                format!(
                    "message queue holds {} undelivered messages",
                    state.pending.len()
                ),
            ));
        }
        state.pending.push_back((sink, message));
        Ok(())
    }

    /// Drops queued and delivered messages from `source` addressed to `sink`.
    pub fn purge(&self, sink: SinkId, source: ResourceId) {
        let mut state = self.state.borrow_mut();
        state
            .pending
            .retain(|(target, message)| !(*target == sink && message.source == source));
        if let Some(inbox) = state.inboxes.get_mut(&sink) {
            inbox.retain(|message| message.source != source);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Moves queued messages into inboxes. Returns how many were delivered.
    pub fn deliver(&self) -> usize {
        let mut state = self.state.borrow_mut();
        let pending = std::mem::take(&mut state.pending);
        let mut delivered = 0_usize;

        for (sink, message) in pending {
            let wanted = state
                .callbacks
                .get(&sink)
                .is_some_and(|set| set.contains(&(message.kind.id(), message.source)));
            if !wanted {
                trace!(sink = sink.0, source = message.source.0, "dropping unwanted message");
                continue;
            }

            if let Some(inbox) = state.inboxes.get_mut(&sink) {
                inbox.push_back(message);
                delivered = delivered.saturating_add(1);
            }
        }

        delivered
    }

    /// Drains the sink's inbox in delivery order.
    pub fn take(&self, sink: SinkId) -> Vec<Message> {
        self.state
            .borrow_mut()
            .inboxes
            .get_mut(&sink)
            .map(|inbox| inbox.drain(..).collect())
            .unwrap_or_default()
    }
}
