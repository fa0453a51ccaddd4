//! Covhub Protocol Definitions
//!
//! This crate defines the wire types shared by the coverage registry and the
//! instrumented agents: the registration handshake, the JSON-RPC frames that
//! travel through an agent tunnel, and the newline-delimited JSON codec used
//! to frame them on a byte stream.

pub mod codec;
pub mod messages;

pub use codec::{ClientCodec, CodecError, JsonLinesCodec, ServerCodec};
pub use messages::*;

/// Maximum size of a single encoded RPC frame (64MB, profiles can be large)
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Agent tunnel upgrade endpoint
pub const TUNNEL_PATH: &str = "/v2/internal/ws/rpcstream";

/// Agent watch push endpoint
pub const WATCH_PUSH_PATH: &str = "/v2/internal/ws/watchstream";

/// Watch subscriber endpoint
pub const WATCH_SUBSCRIBE_PATH: &str = "/v2/cover/ws/watch";
