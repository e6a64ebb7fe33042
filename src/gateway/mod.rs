//! Connection to the conversational AI gateway

pub mod protocol;
pub mod retry;
pub mod session;
pub mod transport;

pub use protocol::{InboundMessage, MessageId, OutboundMessage, ToolRequest};
pub use retry::{Backoff, RetryPolicy};
pub use session::{ConnectionState, GatewaySession, SessionEvent, SessionOptions};
pub use transport::{Connector, MemoryConnector, PeerHandle, WsConnector};
