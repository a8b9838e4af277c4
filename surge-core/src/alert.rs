//! Alerts reported by a session.
//!
//! Sessions never call out to observers directly. Everything noteworthy is
//! queued as an [`Alert`] and handed over by [`crate::Session::pop_alerts`].

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use surge_sim::SimTime;

use crate::protocol::Transport;
use crate::session::TorrentState;
use crate::torrent::{InfoHash, PieceIndex};

/// Why a peer connection ended or was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// Session shutting down
    Shutdown,
    /// Address rejected by the IP filter
    Blocked,
    /// A connection to this endpoint already exists
    Duplicate,
    /// Session is at its connection limit
    TooManyConnections,
    /// No encryption level both sides accept
    EncryptionMismatch,
    /// No transport both sides accept
    TransportMismatch,
    /// Handshake named a torrent the responder does not have
    UnknownTorrent,
    /// Torrent is paused
    Paused,
    /// Handshake not answered in time
    Timeout,
    /// Malformed frame received
    ProtocolError,
}

impl CloseReason {
    /// Wire code sent in a close message.
    pub fn code(self) -> u8 {
        match self {
            Self::Shutdown => 0,
            Self::Blocked => 1,
            Self::Duplicate => 2,
            Self::TooManyConnections => 3,
            Self::EncryptionMismatch => 4,
            Self::TransportMismatch => 5,
            Self::UnknownTorrent => 6,
            Self::Paused => 7,
            Self::Timeout => 8,
            Self::ProtocolError => 9,
        }
    }

    /// Decodes a wire code; unknown codes map to `ProtocolError`.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Shutdown,
            1 => Self::Blocked,
            2 => Self::Duplicate,
            3 => Self::TooManyConnections,
            4 => Self::EncryptionMismatch,
            5 => Self::TransportMismatch,
            6 => Self::UnknownTorrent,
            7 => Self::Paused,
            8 => Self::Timeout,
            _ => Self::ProtocolError,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Shutdown => "session shutting down",
            Self::Blocked => "blocked by ip filter",
            Self::Duplicate => "duplicate connection",
            Self::TooManyConnections => "too many connections",
            Self::EncryptionMismatch => "encryption policy mismatch",
            Self::TransportMismatch => "no common transport",
            Self::UnknownTorrent => "invalid info-hash",
            Self::Paused => "torrent paused",
            Self::Timeout => "timed out",
            Self::ProtocolError => "protocol error",
        };
        f.write_str(text)
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq)]
pub enum AlertKind {
    /// Session bound its listen endpoint
    ListenSucceeded {
        /// Bound endpoint
        endpoint: SocketAddr,
    },
    /// Session could not bind its listen endpoint
    ListenFailed {
        /// Requested endpoint
        endpoint: SocketAddr,
        /// Underlying error
        error: String,
    },
    /// An asynchronous torrent add completed, successfully or not
    AddTorrent {
        /// Torrent added, if the parameters carried one
        info_hash: Option<InfoHash>,
        /// Torrent name
        name: String,
        /// Why the add failed
        error: Option<String>,
    },
    /// Files were checked against the piece hashes
    TorrentChecked {
        /// Torrent checked
        info_hash: InfoHash,
        /// Pieces found complete on disk
        num_have: u32,
    },
    /// Torrent moved to another state
    StateChanged {
        /// Torrent concerned
        info_hash: InfoHash,
        /// Previous state
        prev_state: TorrentState,
        /// New state
        state: TorrentState,
    },
    /// Peer connection established
    PeerConnect {
        /// Torrent the connection belongs to
        info_hash: InfoHash,
        /// Remote endpoint
        endpoint: SocketAddr,
        /// Negotiated transport
        transport: Transport,
        /// Whether the stream is RC4 encrypted
        encrypted: bool,
    },
    /// A peer opened a connection to us
    IncomingConnection {
        /// Remote endpoint
        endpoint: SocketAddr,
        /// Transport the peer offered first
        transport: Transport,
    },
    /// A connection was refused by the IP filter
    PeerBlocked {
        /// Remote endpoint
        endpoint: SocketAddr,
    },
    /// Peer connection closed
    PeerDisconnected {
        /// Torrent the connection belonged to
        info_hash: Option<InfoHash>,
        /// Remote endpoint
        endpoint: SocketAddr,
        /// Why it closed
        reason: CloseReason,
    },
    /// Peer connection failed before or during the handshake
    PeerError {
        /// Remote endpoint
        endpoint: SocketAddr,
        /// Error description
        error: String,
    },
    /// Piece passed its hash check and was written
    PieceFinished {
        /// Torrent concerned
        info_hash: InfoHash,
        /// Completed piece
        piece: PieceIndex,
    },
    /// Piece failed its hash check and was discarded
    HashFailed {
        /// Torrent concerned
        info_hash: InfoHash,
        /// Failed piece
        piece: PieceIndex,
    },
    /// Every piece is present
    TorrentFinished {
        /// Torrent concerned
        info_hash: InfoHash,
    },
    /// Reading or writing torrent content failed
    FileError {
        /// Torrent concerned
        info_hash: InfoHash,
        /// File involved
        path: PathBuf,
        /// Underlying error
        error: String,
    },
}

/// Timestamped session event.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    timestamp: SimTime,
    kind: AlertKind,
}

impl Alert {
    /// Creates an alert raised at `timestamp`.
    pub fn new(timestamp: SimTime, kind: AlertKind) -> Self {
        Self { timestamp, kind }
    }

    /// Virtual time the alert was raised.
    pub fn timestamp(&self) -> SimTime {
        self.timestamp
    }

    /// What happened.
    pub fn kind(&self) -> &AlertKind {
        &self.kind
    }

    /// Short machine-readable alert name.
    pub fn what(&self) -> &'static str {
        match self.kind {
            AlertKind::ListenSucceeded { .. } => "listen_succeeded",
            AlertKind::ListenFailed { .. } => "listen_failed",
            AlertKind::AddTorrent { .. } => "add_torrent",
            AlertKind::TorrentChecked { .. } => "torrent_checked",
            AlertKind::StateChanged { .. } => "state_changed",
            AlertKind::PeerConnect { .. } => "peer_connect",
            AlertKind::IncomingConnection { .. } => "incoming_connection",
            AlertKind::PeerBlocked { .. } => "peer_blocked",
            AlertKind::PeerDisconnected { .. } => "peer_disconnected",
            AlertKind::PeerError { .. } => "peer_error",
            AlertKind::PieceFinished { .. } => "piece_finished",
            AlertKind::HashFailed { .. } => "hash_failed",
            AlertKind::TorrentFinished { .. } => "torrent_finished",
            AlertKind::FileError { .. } => "file_error",
        }
    }

    /// Human-readable description.
    pub fn message(&self) -> String {
        match &self.kind {
            AlertKind::ListenSucceeded { endpoint } => {
                format!("successfully listening on {endpoint}")
            }
            AlertKind::ListenFailed { endpoint, error } => {
                format!("listening on {endpoint} failed: {error}")
            }
            AlertKind::AddTorrent {
                name, error: None, ..
            } => format!("{name} added"),
            AlertKind::AddTorrent {
                name,
                error: Some(error),
                ..
            } => format!("failed to add torrent \"{name}\": {error}"),
            AlertKind::TorrentChecked {
                info_hash,
                num_have,
            } => format!("{info_hash} checked, {num_have} pieces on disk"),
            AlertKind::StateChanged {
                info_hash,
                prev_state,
                state,
            } => format!("{info_hash}: state changed to: {state} (from {prev_state})"),
            AlertKind::PeerConnect {
                endpoint,
                transport,
                encrypted,
                ..
            } => format!(
                "{endpoint} connected over {transport}{}",
                if *encrypted { " (rc4)" } else { "" }
            ),
            AlertKind::IncomingConnection {
                endpoint,
                transport,
            } => format!("incoming {transport} connection from {endpoint}"),
            AlertKind::PeerBlocked { endpoint } => {
                format!("{endpoint}: blocked peer")
            }
            AlertKind::PeerDisconnected {
                endpoint, reason, ..
            } => format!("{endpoint} disconnecting: {reason}"),
            AlertKind::PeerError { endpoint, error } => {
                format!("{endpoint} peer error: {error}")
            }
            AlertKind::PieceFinished { info_hash, piece } => {
                format!("{info_hash}: piece: {piece} finished downloading")
            }
            AlertKind::HashFailed { info_hash, piece } => {
                format!("{info_hash}: hash for piece {piece} failed")
            }
            AlertKind::TorrentFinished { info_hash } => {
                format!("{info_hash} torrent finished downloading")
            }
            AlertKind::FileError {
                info_hash,
                path,
                error,
            } => format!("{info_hash}: file ({}) error: {error}", path.display()),
        }
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.what(), self.message())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    #[test]
    fn test_close_reason_codes_round_trip() {
        for reason in [
            CloseReason::Shutdown,
            CloseReason::Blocked,
            CloseReason::EncryptionMismatch,
            CloseReason::Timeout,
        ] {
            assert_eq!(CloseReason::from_code(reason.code()), reason);
        }
        assert_eq!(CloseReason::from_code(200), CloseReason::ProtocolError);
    }

    #[test]
    fn test_alert_names_and_messages() {
        let endpoint = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(50, 0, 0, 2)), 6881);
        let alert = Alert::new(
            SimTime::ZERO,
            AlertKind::PeerDisconnected {
                info_hash: None,
                endpoint,
                reason: CloseReason::Blocked,
            },
        );
        assert_eq!(alert.what(), "peer_disconnected");
        assert_eq!(
            alert.message(),
            "50.0.0.2:6881 disconnecting: blocked by ip filter"
        );

        let added = Alert::new(
            SimTime::ZERO,
            AlertKind::AddTorrent {
                info_hash: None,
                name: "temporary".to_string(),
                error: None,
            },
        );
        assert_eq!(added.to_string(), "add_torrent: temporary added");
    }
}
