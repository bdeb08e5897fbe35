//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every message is a JSON object tagged by `type`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::game::round::PersonalizedResult;
use crate::network::channel::{InboundKind, OutboundEvent};
use crate::network::gate::ConnectionResponse;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Ask to join, carrying the identity payload.
    Hello(HelloRequest),

    /// Move for a round.
    SelectMove {
        /// Round the move is for.
        round: u32,
        /// "rock", "paper" or "scissors".
        choice: String,
    },

    /// Continue/quit vote after a result.
    ConfirmResult {
        /// Round being confirmed.
        round: u32,
        /// Keep playing.
        keep_playing: bool,
    },

    /// Acknowledge a game-aborted message.
    ConfirmAbort,

    /// Ping for latency measurement.
    Ping {
        /// Client timestamp, echoed back.
        timestamp: u64,
    },

    /// Player is leaving.
    Leave,
}

/// Join request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    /// Identity entries ("name", "token", ...).
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
    /// Client version for compatibility check.
    #[serde(default)]
    pub client_version: String,
}

impl ClientMessage {
    /// Gameplay notification carried by this message, if any.
    pub fn into_inbound(self) -> Option<InboundKind> {
        match self {
            ClientMessage::SelectMove { round, choice } => {
                Some(InboundKind::MoveSelected { round, choice })
            }
            ClientMessage::ConfirmResult { round, keep_playing } => {
                Some(InboundKind::ResultConfirmed { round, keep_playing })
            }
            ClientMessage::ConfirmAbort => Some(InboundKind::AbortConfirmed),
            ClientMessage::Hello(_) | ClientMessage::Ping { .. } | ClientMessage::Leave => None,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Answer to `hello`; `pending` answers are followed by a final one.
    Connection(ConnectionResponse),

    /// Channel open for play.
    ChannelReady,

    /// Both slots known.
    PlayersReady {
        /// Recipient's name.
        you: String,
        /// Opponent's name.
        opponent: String,
    },

    /// Round began.
    RoundStarted {
        /// Round number.
        round: u32,
        /// Recipient's name.
        you: String,
        /// Opponent's name.
        opponent: String,
    },

    /// Round resolved, from the recipient's side.
    RoundResult(PersonalizedResult),

    /// Game stopped by a fault.
    GameAborted {
        /// Human-readable reason.
        reason: String,
    },

    /// Pong response.
    Pong {
        /// Echoed client timestamp.
        timestamp: u64,
        /// Server time (Unix millis).
        server_time: u64,
    },

    /// Request could not be processed.
    Error(ServerError),

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Server error detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Message could not be parsed.
    InvalidInput,
    /// Gameplay message before approval.
    NotApproved,
    /// `hello` sent twice.
    AlreadyJoined,
    /// Unexpected server failure.
    InternalError,
}

impl From<OutboundEvent> for ServerMessage {
    fn from(event: OutboundEvent) -> Self {
        match event {
            OutboundEvent::ChannelReady => ServerMessage::ChannelReady,
            OutboundEvent::PlayersReady { self_name, opponent_name } => ServerMessage::PlayersReady {
                you: self_name,
                opponent: opponent_name,
            },
            OutboundEvent::RoundStarted { round, self_name, opponent_name } => {
                ServerMessage::RoundStarted {
                    round,
                    you: self_name,
                    opponent: opponent_name,
                }
            }
            OutboundEvent::RoundResult(result) => ServerMessage::RoundResult(result),
            OutboundEvent::GameAborted { reason } => ServerMessage::GameAborted { reason },
        }
    }
}

impl ServerMessage {
    /// Protocol error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::moves::{Move, Outcome};
    use crate::game::participant::ParticipantId;

    #[test]
    fn test_client_message_wire_shape() {
        let hello = ClientMessage::from_json(
            r#"{"type":"hello","payload":{"name":"ana"},"client_version":"0.1.0"}"#,
        )
        .unwrap();
        match hello {
            ClientMessage::Hello(req) => assert_eq!(req.payload.get("name").map(String::as_str), Some("ana")),
            other => panic!("Wrong message: {:?}", other),
        }

        let select = ClientMessage::from_json(r#"{"type":"select_move","round":2,"choice":"paper"}"#).unwrap();
        assert_eq!(
            select.into_inbound(),
            Some(InboundKind::MoveSelected { round: 2, choice: "paper".into() })
        );

        let confirm =
            ClientMessage::from_json(r#"{"type":"confirm_result","round":2,"keep_playing":false}"#).unwrap();
        assert_eq!(
            confirm.into_inbound(),
            Some(InboundKind::ResultConfirmed { round: 2, keep_playing: false })
        );

        assert!(ClientMessage::from_json(r#"{"type":"ping","timestamp":5}"#)
            .unwrap()
            .into_inbound()
            .is_none());
        assert!(ClientMessage::from_json(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn test_server_message_json() {
        let result = ServerMessage::RoundResult(PersonalizedResult {
            round: 1,
            your_move: Move::Rock,
            your_outcome: Outcome::Lose,
            opponent_move: Move::Paper,
            can_continue: true,
        });
        let json = result.to_json().unwrap();
        assert!(json.contains("\"type\":\"round_result\""));
        assert_eq!(ServerMessage::from_json(&json).unwrap(), result);

        let connection = ServerMessage::Connection(ConnectionResponse {
            participant_id: ParticipantId(4),
            approved: false,
            pending: true,
            reason: None,
            display_name: Some("ana".into()),
        });
        let json = connection.to_json().unwrap();
        assert!(json.contains("\"pending\":true"));
        assert!(!json.contains("reason"));
    }

    #[test]
    fn test_outbound_conversion() {
        let msg: ServerMessage = OutboundEvent::RoundStarted {
            round: 3,
            self_name: "ana".into(),
            opponent_name: "Bot 2".into(),
        }
        .into();
        assert_eq!(
            msg,
            ServerMessage::RoundStarted { round: 3, you: "ana".into(), opponent: "Bot 2".into() }
        );
    }

    #[test]
    fn test_error_codes() {
        let msg = ServerMessage::error(ErrorCode::NotApproved, "join first");
        let json = msg.to_json().unwrap();
        assert!(json.contains("not_approved"));
    }
}
