//! Networking seams: name resolution, network classification, HTTP message
//! pieces and the transfer transport.

pub mod http;
pub mod nettype;
pub mod resolver;
pub mod transport;

pub use http::Header;
pub use http::HttpMethod;
pub use nettype::NetType;
pub use resolver::NameResolver;
pub use resolver::ResolveEvent;
pub use resolver::ResolveTicket;
pub use resolver::StaticResolver;
pub use resolver::SystemResolver;
pub use transport::MemoryResponse;
pub use transport::MemoryTransport;
pub use transport::ResponseHead;
pub use transport::TransferEvent;
pub use transport::TransferEventKind;
pub use transport::TransferFlags;
pub use transport::TransferId;
pub use transport::TransferRequest;
pub use transport::Transport;
