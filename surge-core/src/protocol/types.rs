//! Core types for the simulated peer wire protocol

use std::fmt;

use bytes::Bytes;
use rand::Rng;

use crate::torrent::{InfoHash, PieceIndex};

/// Client identifier prefix carried by every generated peer id
pub const CLIENT_PREFIX: &[u8; 8] = b"-SG0001-";

/// BitTorrent peer identifier.
///
/// 20-byte identifier exchanged in handshakes. Two sessions in one swarm
/// must never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID for this client.
    pub fn generate() -> Self {
        Self::from_rng(&mut rand::rng())
    }

    /// Generate a peer ID from `rng`, for reproducible swarms.
    pub fn from_rng<R: Rng>(rng: &mut R) -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        rng.fill(&mut id[8..]);
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Transport a peer connection runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Stream transport
    Tcp,
    /// Micro transport protocol, preferred when both sides allow it
    Utp,
}

impl Transport {
    fn flag(self) -> u8 {
        match self {
            Self::Tcp => 0x01,
            Self::Utp => 0x02,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Utp => f.write_str("utp"),
        }
    }
}

const TRANSPORT_BYTE: usize = 7;
const ENCRYPTION_BYTE: usize = 6;
const ENC_PLAINTEXT: u8 = 0x01;
const ENC_RC4: u8 = 0x02;
const ENC_PREFER_RC4: u8 = 0x04;

/// Peer handshake information.
///
/// Sent by the initiator to offer a connection and echoed back by the
/// responder to accept it. The reserved bytes carry the transports and
/// encryption levels on offer; in an accept they carry the single choice.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: "BitTorrent protocol".to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Marks the transports this side can use.
    pub fn with_transports(mut self, tcp: bool, utp: bool) -> Self {
        let mut flags = 0;
        if tcp {
            flags |= Transport::Tcp.flag();
        }
        if utp {
            flags |= Transport::Utp.flag();
        }
        self.reserved[TRANSPORT_BYTE] = flags;
        self
    }

    /// Marks the encryption levels this side accepts.
    pub fn with_encryption(mut self, plaintext: bool, rc4: bool, prefer_rc4: bool) -> Self {
        let mut flags = 0;
        if plaintext {
            flags |= ENC_PLAINTEXT;
        }
        if rc4 {
            flags |= ENC_RC4;
        }
        if prefer_rc4 {
            flags |= ENC_PREFER_RC4;
        }
        self.reserved[ENCRYPTION_BYTE] = flags;
        self
    }

    /// Whether `transport` is on offer.
    pub fn supports_transport(&self, transport: Transport) -> bool {
        self.reserved[TRANSPORT_BYTE] & transport.flag() != 0
    }

    /// Whether an unencrypted stream is acceptable.
    pub fn allows_plaintext(&self) -> bool {
        self.reserved[ENCRYPTION_BYTE] & ENC_PLAINTEXT != 0
    }

    /// Whether an RC4 stream is acceptable.
    pub fn allows_rc4(&self) -> bool {
        self.reserved[ENCRYPTION_BYTE] & ENC_RC4 != 0
    }

    /// Whether this side asks for RC4 when plaintext is also possible.
    pub fn prefers_rc4(&self) -> bool {
        self.reserved[ENCRYPTION_BYTE] & ENC_PREFER_RC4 != 0
    }
}

/// Peer wire protocol messages.
///
/// The BEP 3 message set used after the handshake, plus an explicit close
/// since the simulated transport carries no connection teardown of its own.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Inform peer that we are choking them
    Choke,
    /// Inform peer that we are no longer choking them
    Unchoke,
    /// Inform peer that we are interested in their pieces
    Interested,
    /// Inform peer that we are not interested in their pieces
    NotInterested,
    /// Inform peer that we have acquired a specific piece
    Have {
        /// Index of the piece we now have
        piece_index: PieceIndex,
    },
    /// Send our complete piece availability bitmap
    Bitfield {
        /// Bitmap indicating which pieces we have
        bitfield: Bytes,
    },
    /// Request a block of data from a piece
    Request {
        /// Index of the piece to request from
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes to request
        length: u32,
    },
    /// Send a block of piece data
    Piece {
        /// Index of the piece this data belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// The actual piece data
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        /// Index of the piece to cancel
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
    /// Connection is being closed by the sender
    Close {
        /// Reason code, see [`crate::CloseReason`]
        reason: u8,
    },
}
