//! Peer wire protocol over simulated datagrams.
//!
//! Every datagram carries one frame: a handshake offering a connection, the
//! accept answering it, or a BEP 3 style message on an established
//! connection. Message frames on encrypted connections are run through the
//! simulated stream cipher.

pub mod handshake;
pub mod messages;
pub mod types;

use bytes::Bytes;

pub use handshake::{HandshakeCodec, Negotiated};
pub use messages::MessageCodec;
pub use types::{PeerHandshake, PeerId, PeerMessage, Transport};

use crate::torrent::{InfoHash, TorrentError};

const TAG_HANDSHAKE: u8 = 0;
const TAG_ACCEPT: u8 = 1;
const TAG_MESSAGE: u8 = 2;

/// One datagram's worth of protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Connection offer from the initiator
    Handshake(PeerHandshake),
    /// Responder's acceptance with the negotiated parameters
    Accept(PeerHandshake),
    /// Message on an established connection
    Message(PeerMessage),
}

impl Frame {
    /// Serializes the frame, encrypting message frames when `key` is given.
    pub fn encode(&self, key: Option<&InfoHash>) -> Bytes {
        let mut buf = Vec::new();
        match self {
            Self::Handshake(handshake) => {
                buf.push(TAG_HANDSHAKE);
                buf.extend_from_slice(&HandshakeCodec::serialize_handshake(handshake));
            }
            Self::Accept(handshake) => {
                buf.push(TAG_ACCEPT);
                buf.extend_from_slice(&HandshakeCodec::serialize_handshake(handshake));
            }
            Self::Message(message) => {
                buf.push(TAG_MESSAGE);
                let mut body = MessageCodec::serialize_message(message);
                if let Some(key) = key {
                    messages::apply_keystream(key, &mut body);
                }
                buf.extend_from_slice(&body);
            }
        }
        Bytes::from(buf)
    }

    /// Parses a frame, decrypting message frames when `key` is given.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Empty datagram, unknown tag or a
    ///   malformed body
    pub fn decode(data: &[u8], key: Option<&InfoHash>) -> Result<Self, TorrentError> {
        let Some((&tag, body)) = data.split_first() else {
            return Err(TorrentError::ProtocolError {
                message: "Empty frame".to_string(),
            });
        };

        match tag {
            TAG_HANDSHAKE => Ok(Self::Handshake(HandshakeCodec::deserialize_handshake(
                body,
            )?)),
            TAG_ACCEPT => Ok(Self::Accept(HandshakeCodec::deserialize_handshake(body)?)),
            TAG_MESSAGE => match key {
                Some(key) => {
                    let mut body = body.to_vec();
                    messages::apply_keystream(key, &mut body);
                    Ok(Self::Message(MessageCodec::deserialize_message(&body)?))
                }
                None => Ok(Self::Message(MessageCodec::deserialize_message(body)?)),
            },
            _ => Err(TorrentError::ProtocolError {
                message: format!("Unknown frame tag: {tag}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::PieceIndex;

    #[test]
    fn test_peer_id_generation() {
        let peer_id = PeerId::generate();
        let bytes = peer_id.as_bytes();

        assert_eq!(&bytes[..8], b"-SG0001-");

        let peer_id2 = PeerId::generate();
        assert_ne!(peer_id.as_bytes(), peer_id2.as_bytes());
    }

    #[test]
    fn test_seeded_peer_ids_repeat() {
        use rand::SeedableRng;

        let mut a = rand::rngs::StdRng::seed_from_u64(42);
        let mut b = rand::rngs::StdRng::seed_from_u64(42);
        assert_eq!(PeerId::from_rng(&mut a), PeerId::from_rng(&mut b));
        assert_ne!(PeerId::from_rng(&mut a), PeerId::from_rng(&mut a));
    }

    #[test]
    fn test_frames_parse_back() {
        let handshake = PeerHandshake::new(InfoHash::new([3u8; 20]), PeerId::new([4u8; 20]))
            .with_transports(true, false);
        let frame = Frame::Accept(handshake);
        assert_eq!(Frame::decode(&frame.encode(None), None).unwrap(), frame);

        let message = Frame::Message(PeerMessage::Have {
            piece_index: PieceIndex::new(8),
        });
        assert_eq!(Frame::decode(&message.encode(None), None).unwrap(), message);
    }

    #[test]
    fn test_encrypted_frame_needs_key() {
        let key = InfoHash::new([9u8; 20]);
        let frame = Frame::Message(PeerMessage::Interested);
        let bytes = frame.encode(Some(&key));

        assert_eq!(Frame::decode(&bytes, Some(&key)).unwrap(), frame);
        assert_ne!(Frame::decode(&bytes, None).ok(), Some(frame));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(Frame::decode(&[], None).is_err());
        assert!(Frame::decode(&[7, 1, 2, 3], None).is_err());
    }
}
