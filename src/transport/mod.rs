//! JSON-RPC transport
//!
//! Framing, request correlation, and dispatch of server-initiated
//! messages over a duplex byte stream (the analysis server's stdio).

pub mod codec;
pub mod dispatcher;
pub mod message;
mod session;

pub use dispatcher::{Dispatcher, HandlerError};
pub use message::{Message, RequestId, RpcError};
pub use session::Session;
