//! Surge Core - Simulated BitTorrent session engine
//!
//! This crate provides the protocol engine the swarm harness drives: a
//! session that adds torrents, speaks a BitTorrent-style peer wire protocol
//! over the simulated network, reports progress through alerts and tears
//! itself down asynchronously when aborted.
//!
//! Every session is bound to a [`surge_sim::IoContext`]; all of its work runs
//! on the simulation's event loop.

pub mod alert;
pub mod ip_filter;
pub mod params;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod torrent;

pub use alert::{Alert, AlertKind, CloseReason};
pub use ip_filter::IpFilter;
pub use params::AddTorrentParams;
pub use protocol::{PeerId, Transport};
pub use session::{PeerInfo, Session, SessionProxy, TorrentHandle, TorrentState, TorrentStatus};
pub use settings::{EncLevel, EncPolicy, SettingsPack};
pub use torrent::{InfoHash, PieceIndex, TorrentError, TorrentInfo, create_torrent};

/// Well-known BitTorrent listen port.
pub const DEFAULT_LISTEN_PORT: u16 = 6881;
