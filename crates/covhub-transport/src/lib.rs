//! Request/response transport for agent tunnels
//!
//! An agent tunnel is a message socket. Two layers sit on top of it:
//!
//! - [`MessageStream`] adapts a message socket into a plain byte stream
//!   (`AsyncRead + AsyncWrite`): every write becomes one outbound message and
//!   inbound messages are read back to back.
//! - [`RpcClient`] issues JSON-RPC calls over any byte stream, multiplexing
//!   concurrent calls by id with an independent timeout per call.
//!
//! [`serve_rpc`] is the agent side of the same protocol.

pub mod error;
pub mod rpc;
pub mod stream;

pub use error::{TransportError, TransportResult};
pub use rpc::{serve_rpc, RpcClient, RpcHandler};
pub use stream::{MessagePipe, MessageStream};
