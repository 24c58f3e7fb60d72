//! Transfer transport contracts and an in-memory implementation.

use crate::http::Header;
use crate::nettype::NetType;
use carta_core::CartaError;
use carta_core::CartaResult;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;
use tracing::debug;

/// Identifies one started transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(pub u64);

/// Request-side switches that change how a transfer is performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferFlags {
    pub block_user_interaction: bool,
    pub disable_cookies: bool,
    pub skip_content_blocker: bool,
    pub bypass_proxy: bool,
    pub user_initiated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
    /// First byte to request when resuming.
    pub range_start: Option<u64>,
    pub flags: TransferFlags,
    pub timeout: Option<Duration>,
}

impl TransferRequest {
    pub fn get(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            method: "GET".to_owned(),
            headers: Vec::new(),
            body: Vec::new(),
            range_start: None,
            flags: TransferFlags::default(),
            timeout: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::http::find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<Header>,
    pub peer: NetType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEventKind {
    Head(ResponseHead),
    Data(Vec<u8>),
    /// A new body part of a multipart response starts after this point.
    MultipartBoundary,
    Finished,
    Failed(CartaError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEvent {
    pub id: TransferId,
    pub kind: TransferEventKind,
}

/// Non-blocking transfer engine.
///
/// `start` returns immediately. Progress is reported by later `poll` calls
/// as a head, zero or more data chunks and one terminal event.
pub trait Transport {
    fn start(&mut self, request: TransferRequest) -> CartaResult<TransferId>;

    /// Stops reporting events for `id`. Unknown ids are ignored.
    fn cancel(&mut self, id: TransferId);

    fn poll(&mut self) -> Vec<TransferEvent>;
}

/// Scripted response served by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<Vec<u8>>,
    pub peer: NetType,
    pub failure: Option<CartaError>,
    /// Number of chunks emitted per `poll`; zero means all at once.
    pub chunks_per_poll: usize,
    /// Each chunk after the first starts a new body part.
    pub multipart: bool,
}

impl MemoryResponse {
    pub fn ok(content_type: &str, body: &[u8]) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".to_owned(), content_type.to_owned())],
            chunks: vec![body.to_vec()],
            peer: NetType::Public,
            failure: None,
            chunks_per_poll: 0,
            multipart: false,
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self {
            status,
            headers: vec![("Location".to_owned(), location.to_owned())],
            chunks: Vec::new(),
            peer: NetType::Public,
            failure: None,
            chunks_per_poll: 0,
            multipart: false,
        }
    }

    pub fn failure(error: CartaError) -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            chunks: Vec::new(),
            peer: NetType::Undetermined,
            failure: Some(error),
            chunks_per_poll: 0,
            multipart: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn multipart(mut self, parts: Vec<Vec<u8>>) -> Self {
        self.chunks = parts;
        self.multipart = true;
        self
    }

    pub fn with_chunks(mut self, chunks: Vec<Vec<u8>>, chunks_per_poll: usize) -> Self {
        self.chunks = chunks;
        self.chunks_per_poll = chunks_per_poll;
        self
    }
}

#[derive(Debug)]
struct ActiveTransfer {
    id: TransferId,
    url: String,
    response: Option<MemoryResponse>,
    head_sent: bool,
    next_chunk: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    responses: HashMap<String, VecDeque<MemoryResponse>>,
    fallback: HashMap<String, MemoryResponse>,
    active: Vec<ActiveTransfer>,
    started: Vec<TransferRequest>,
    cancelled: Vec<TransferId>,
}

/// In-memory transport keyed by exact request URL.
///
/// Transfers for URLs without a scripted response stay pending until one is
/// added. Clones share state so a test can keep a view while the manager owns
/// the boxed transport.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `response` to every request for `url`.
    pub fn respond(&self, url: &str, response: MemoryResponse) {
        self.state
            .borrow_mut()
            .fallback
            .insert(url.to_owned(), response);
    }

    /// Serves `response` to the next request for `url` only.
    pub fn respond_once(&self, url: &str, response: MemoryResponse) {
        self.state
            .borrow_mut()
            .responses
            .entry(url.to_owned())
            .or_default()
            .push_back(response);
    }

    /// Every request passed to `start`, in order.
    pub fn started(&self) -> Vec<TransferRequest> {
        self.state.borrow().started.clone()
    }

    pub fn started_count(&self) -> usize {
        self.state.borrow().started.len()
    }

    pub fn cancelled(&self) -> Vec<TransferId> {
        self.state.borrow().cancelled.clone()
    }

    pub fn active_count(&self) -> usize {
        self.state.borrow().active.len()
    }
}

impl Transport for MemoryTransport {
    fn start(&mut self, request: TransferRequest) -> CartaResult<TransferId> {
        let mut state = self.state.borrow_mut();
        state.next_id = state.next_id.saturating_add(1);
        let id = TransferId(state.next_id);
        debug!(transfer = id.0, url = %request.url, "memory transfer started");
        state.active.push(ActiveTransfer {
            id,
            url: request.url.clone(),
            response: None,
            head_sent: false,
            next_chunk: 0,
        });
        state.started.push(request);
        Ok(id)
    }

    fn cancel(&mut self, id: TransferId) {
        let mut state = self.state.borrow_mut();
        let before = state.active.len();
        state.active.retain(|transfer| transfer.id != id);
        if state.active.len() != before {
            state.cancelled.push(id);
        }
    }

    fn poll(&mut self) -> Vec<TransferEvent> {
        let mut state = self.state.borrow_mut();
        let mut events = Vec::new();
        let active = std::mem::take(&mut state.active);
        let mut still_active = Vec::with_capacity(active.len());

        for mut transfer in active {
            if transfer.response.is_none() {
                let once = state
                    .responses
                    .get_mut(&transfer.url)
                    .and_then(VecDeque::pop_front);
                transfer.response = once.or_else(|| state.fallback.get(&transfer.url).cloned());
            }

            let Some(response) = transfer.response.as_ref() else {
                still_active.push(transfer);
                continue;
            };

            if let Some(error) = response.failure.clone() {
                events.push(TransferEvent {
                    id: transfer.id,
                    kind: TransferEventKind::Failed(error),
                });
                continue;
            }

            if !transfer.head_sent {
                let headers = response
                    .headers
                    .iter()
                    .filter_map(|(name, value)| Header::new(name, value).ok())
                    .collect();
                events.push(TransferEvent {
                    id: transfer.id,
                    kind: TransferEventKind::Head(ResponseHead {
                        status: response.status,
                        headers,
                        peer: response.peer,
                    }),
                });
            }

            let per_poll = if response.chunks_per_poll == 0 {
                response.chunks.len()
            } else {
                response.chunks_per_poll
            };
            let end = transfer
                .next_chunk
                .saturating_add(per_poll)
                .min(response.chunks.len());
            for (index, chunk) in response
                .chunks
                .iter()
                .enumerate()
                .take(end)
                .skip(transfer.next_chunk)
            {
                if response.multipart && index > 0 {
                    events.push(TransferEvent {
                        id: transfer.id,
                        kind: TransferEventKind::MultipartBoundary,
                    });
                }
                events.push(TransferEvent {
                    id: transfer.id,
                    kind: TransferEventKind::Data(chunk.clone()),
                });
            }
            let done = end >= response.chunks.len();

            transfer.head_sent = true;
            transfer.next_chunk = end;
            if done {
                events.push(TransferEvent {
                    id: transfer.id,
                    kind: TransferEventKind::Finished,
                });
            } else {
                still_active.push(transfer);
            }
        }

        state.active = still_active;
        events
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryResponse;
    use super::MemoryTransport;
    use super::TransferEventKind;
    use super::TransferRequest;
    use super::Transport;
    use carta_core::CartaError;

    #[test]
    fn unscripted_transfer_stays_pending() {
        let mut transport = MemoryTransport::new();
        assert!(transport.start(TransferRequest::get("http://a.test/")).is_ok());
        assert!(transport.poll().is_empty());
        assert_eq!(transport.active_count(), 1);

        transport.respond("http://a.test/", MemoryResponse::ok("text/plain", b"hi"));
        let kinds: Vec<TransferEventKind> =
            transport.poll().into_iter().map(|event| event.kind).collect();
        assert_eq!(kinds.len(), 3);
        assert!(matches!(kinds[0], TransferEventKind::Head(ref head) if head.status == 200));
        assert_eq!(kinds[1], TransferEventKind::Data(b"hi".to_vec()));
        assert_eq!(kinds[2], TransferEventKind::Finished);
        assert_eq!(transport.active_count(), 0);
    }

    #[test]
    fn chunks_can_be_spread_over_polls() {
        let mut transport = MemoryTransport::new();
        transport.respond(
            "http://a.test/",
            MemoryResponse::ok("text/plain", b"").with_chunks(vec![b"a".to_vec(), b"b".to_vec()], 1),
        );
        assert!(transport.start(TransferRequest::get("http://a.test/")).is_ok());
        assert_eq!(transport.poll().len(), 2);
        assert_eq!(transport.poll().len(), 2);
        assert!(transport.poll().is_empty());
    }

    #[test]
    fn multipart_parts_are_separated_by_boundaries() {
        let mut transport = MemoryTransport::new();
        transport.respond(
            "http://cam.test/",
            MemoryResponse::ok("multipart/x-mixed-replace", b"")
                .multipart(vec![b"one".to_vec(), b"two".to_vec()]),
        );
        assert!(transport.start(TransferRequest::get("http://cam.test/")).is_ok());
        let kinds: Vec<TransferEventKind> =
            transport.poll().into_iter().map(|event| event.kind).collect();
        assert_eq!(kinds[1], TransferEventKind::Data(b"one".to_vec()));
        assert_eq!(kinds[2], TransferEventKind::MultipartBoundary);
        assert_eq!(kinds[3], TransferEventKind::Data(b"two".to_vec()));
        assert_eq!(kinds[4], TransferEventKind::Finished);
    }

    #[test]
    fn cancelled_transfer_reports_nothing() {
        let mut transport = MemoryTransport::new();
        transport.respond("http://a.test/", MemoryResponse::ok("text/plain", b"x"));
        let id = transport
            .start(TransferRequest::get("http://a.test/"))
            .unwrap_or_else(|_| unreachable!());
        transport.cancel(id);
        assert!(transport.poll().is_empty());
        assert_eq!(transport.cancelled(), vec![id]);
    }

    #[test]
    fn failure_is_terminal() {
        let mut transport = MemoryTransport::new();
        transport.respond(
            "http://down.test/",
            MemoryResponse::failure(CartaError::network("net.transport.refused", "refused")),
        );
        assert!(transport.start(TransferRequest::get("http://down.test/")).is_ok());
        let events = transport.poll();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].kind, TransferEventKind::Failed(_)));
    }
}
