pub mod client;
pub mod frames;

pub use client::{unwrap_response, WsClient};
pub use frames::{ConnectionState, FnHandler, Frame, FrameHandler, PostKind};
