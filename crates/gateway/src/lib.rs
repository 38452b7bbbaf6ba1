//! Gateway: WebSocket session handling, live delivery, pending queue,
//! presence and the diagnostic HTTP surface.
//!
//! Lifecycle:
//! 1. Connect to the durable store (fatal if unreachable)
//! 2. Subscribe to the `new_message` topic
//! 3. Start the liveness reaper and the pending reconciler
//! 4. Serve `/ws` and the diagnostic endpoints until shutdown

pub mod delivery;
pub mod error;
pub mod pending;
pub mod presence;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod ws;

pub use {
    server::{build_gateway_app, start_gateway},
    state::GatewayState,
};
