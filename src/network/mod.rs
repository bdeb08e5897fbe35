//! Network Layer
//!
//! Connection admission, event delivery and the WebSocket host.
//! Nothing here decides game outcomes; that lives in `game/` and `session/`.

pub mod auth;
pub mod channel;
pub mod gate;
pub mod local;
pub mod networked;
pub mod protocol;
pub mod server;
pub mod tracker;

pub use auth::{
    AuthConfig, AuthError, ConnectionValidator, Identity, OpenValidator, RosterValidator,
    TokenClaims, TokenValidator, validate_token,
};
pub use channel::{
    Arrivals, ChannelError, EventChannel, InboundEvent, InboundHandler, InboundHub, InboundKind,
    OutboundEvent,
};
pub use gate::{Admission, ConnectionGate, ConnectionRequest, ConnectionResponse, GateError};
pub use local::LocalChannel;
pub use networked::NetworkedChannel;
pub use protocol::{ClientMessage, ErrorCode, HelloRequest, ServerError, ServerMessage};
pub use server::{GameServer, GameServerError};
pub use tracker::{ConnectionTracker, TrackerError, TrackerEvent};
