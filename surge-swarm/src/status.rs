//! Status helpers for single-torrent sessions.
//!
//! Every node in a swarm holds exactly one torrent. These helpers read that
//! torrent's status and treat a second torrent as harness misuse.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use surge_core::{Session, TorrentHandle, TorrentStatus};

/// Number of addresses [`add_extra_peers`] connects to
pub const EXTRA_PEERS: u8 = 30;

/// The session's only torrent, if it has been added yet.
///
/// # Panics
/// Panics if the session holds more than one torrent.
pub fn torrent(session: &Session) -> Option<TorrentHandle> {
    let mut handles = session.get_torrents();
    assert!(
        handles.len() <= 1,
        "swarm node holds {} torrents, expected one",
        handles.len()
    );
    handles.pop()
}

/// Status of the session's torrent; the invalid default before it is added.
///
/// # Panics
/// Panics if the session holds more than one torrent.
pub fn get_status(session: &Session) -> TorrentStatus {
    torrent(session)
        .map(|handle| handle.status())
        .unwrap_or_default()
}

/// # Panics
/// Panics if the session holds more than one torrent.
pub fn has_metadata(session: &Session) -> bool {
    get_status(session).has_metadata
}

/// # Panics
/// Panics if the session holds more than one torrent.
pub fn is_seed(session: &Session) -> bool {
    get_status(session).is_seeding
}

/// # Panics
/// Panics if the session holds more than one torrent.
pub fn completed_pieces(session: &Session) -> u32 {
    get_status(session).num_pieces
}

/// Connects the torrent to `60.0.0.1` through `60.0.0.30`.
///
/// None of these hosts exist; the connections exercise the session's
/// handling of unreachable peers.
///
/// # Panics
/// Panics if the session holds more than one torrent.
pub fn add_extra_peers(session: &Session) {
    let Some(handle) = torrent(session) else {
        tracing::warn!("No torrent to add extra peers to");
        return;
    };
    for last in 1..=EXTRA_PEERS {
        let address = IpAddr::V4(Ipv4Addr::new(60, 0, 0, last));
        handle.connect_peer(SocketAddr::new(address, surge_core::DEFAULT_LISTEN_PORT));
    }
}
