//! The proxy data path: HTTP pass-through, streaming frame forwarding,
//! WebSocket bridging, and token/tool accounting.

pub mod http;
pub mod streaming;
pub mod usage;
pub mod ws;
