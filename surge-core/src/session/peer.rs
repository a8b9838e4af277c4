//! Per-connection peer state.

use std::net::SocketAddr;

use surge_sim::SimTime;

use crate::protocol::{Negotiated, PeerId, Transport};
use crate::torrent::{BlockRequest, InfoHash};

/// Snapshot of one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Remote endpoint
    pub endpoint: SocketAddr,
    /// Remote identity, once the handshake completed
    pub peer_id: Option<PeerId>,
    /// Negotiated transport, once the handshake completed
    pub transport: Option<Transport>,
    /// Whether the stream is RC4 encrypted
    pub encrypted: bool,
    /// Whether we opened the connection
    pub outgoing: bool,
    /// Whether the handshake completed
    pub connected: bool,
    /// Whether the peer is choking us
    pub choked: bool,
    /// Whether we are interested in the peer
    pub interesting: bool,
    /// Pieces the peer announced
    pub num_pieces: u32,
    /// Payload bytes received from the peer
    pub downloaded: u64,
    /// Payload bytes sent to the peer
    pub uploaded: u64,
}

#[derive(Debug)]
pub(crate) struct PeerConnection {
    pub(crate) endpoint: SocketAddr,
    pub(crate) torrent: usize,
    pub(crate) info_hash: InfoHash,
    pub(crate) peer_id: Option<PeerId>,
    pub(crate) outgoing: bool,
    pub(crate) negotiated: Option<Negotiated>,
    /// Time the connection was opened; handshake timeouts count from here
    pub(crate) since: SimTime,
    pub(crate) am_choking: bool,
    pub(crate) am_interested: bool,
    pub(crate) peer_choking: bool,
    pub(crate) peer_interested: bool,
    pub(crate) peer_has: Vec<bool>,
    pub(crate) requests: Vec<(BlockRequest, SimTime)>,
    pub(crate) downloaded: u64,
    pub(crate) uploaded: u64,
}

impl PeerConnection {
    pub(crate) fn new(
        endpoint: SocketAddr,
        torrent: usize,
        info_hash: InfoHash,
        num_pieces: u32,
        outgoing: bool,
        since: SimTime,
    ) -> Self {
        Self {
            endpoint,
            torrent,
            info_hash,
            peer_id: None,
            outgoing,
            negotiated: None,
            since,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_has: vec![false; num_pieces as usize],
            requests: Vec::new(),
            downloaded: 0,
            uploaded: 0,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.negotiated.is_some()
    }

    /// Cipher key for message frames, if the stream is encrypted.
    pub(crate) fn key(&self) -> Option<&InfoHash> {
        match self.negotiated {
            Some(Negotiated {
                encrypted: true, ..
            }) => Some(&self.info_hash),
            _ => None,
        }
    }

    pub(crate) fn info(&self) -> PeerInfo {
        PeerInfo {
            endpoint: self.endpoint,
            peer_id: self.peer_id,
            transport: self.negotiated.map(|n| n.transport),
            encrypted: self.negotiated.is_some_and(|n| n.encrypted),
            outgoing: self.outgoing,
            connected: self.is_connected(),
            choked: self.peer_choking,
            interesting: self.am_interested,
            num_pieces: self.peer_has.iter().filter(|&&h| h).count() as u32,
            downloaded: self.downloaded,
            uploaded: self.uploaded,
        }
    }
}
