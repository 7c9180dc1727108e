//! Streaming telemetry sessions.
//!
//! A session is one client connection that receives a periodic stream of
//! envelopes for a single tenant and provider. See [`SessionManager::run`]
//! for the lifecycle.

mod manager;
mod normalize;
mod params;
mod state;
mod transport;


pub use manager::{SessionConfig, SessionInfo, SessionManager, SessionReport, SessionStats};
pub use normalize::{Lookbacks, cost_breakdown, latest_sample};
pub use params::{ClientFrame, IntervalBounds, MAX_CLIENT_FRAME, SessionParams, StreamPatch, StreamRequest};
pub use state::{CloseReason, SessionState};
pub use transport::{Inbound, Transport};
