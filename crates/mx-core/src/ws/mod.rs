//! Streaming sessions: a generic WebSocket state machine driven by a
//! per-exchange [`StreamProtocol`].

pub mod session;

pub use session::{Heartbeat, Inbound, SessionEvent, SessionState, SessionTimeouts, StreamProtocol, StreamSession};
