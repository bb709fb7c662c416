//! Agent/server transport: message types, framing, batching and the TCP
//! endpoints on either side.

pub mod batch;
pub mod client;
pub mod codec;
pub mod listener;
pub mod message;

pub use batch::BatchingBuffer;
pub use client::{connect_with_retry, ConnectError, TransportClient};
pub use codec::{MessageCodec, ProtocolError, PROTOCOL_VERSION};
pub use listener::TransportListener;
pub use message::{DataRecord, Message};
