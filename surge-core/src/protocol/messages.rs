//! Peer wire message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::types::PeerMessage;
use crate::torrent::{InfoHash, PieceIndex, TorrentError};

/// Message serialization utilities for the peer wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::Choke => {
                buf.put_u32(1); // Length = 1
                buf.put_u8(0); // Message ID
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // Length = 1 + 4
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13); // Length = 1 + 4 + 4 + 4
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Close { reason } => {
                buf.put_u32(2);
                buf.put_u8(20);
                buf.put_u8(*reason);
            }
        }

        buf
    }

    /// Deserializes peer message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Truncated message, bad length or
    ///   unknown message id
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 5 {
            return Err(TorrentError::ProtocolError {
                message: "Message too short".to_string(),
            });
        }

        let mut buf = data;
        let length = buf.get_u32();

        if length == 0 || data.len() < 4 + length as usize {
            return Err(TorrentError::ProtocolError {
                message: "Incomplete message".to_string(),
            });
        }

        let message_id = buf.get_u8();
        let expect = |expected: u32, name: &str| {
            if length == expected {
                Ok(())
            } else {
                Err(TorrentError::ProtocolError {
                    message: format!("Invalid {name} message length"),
                })
            }
        };

        match message_id {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                expect(5, "Have")?;
                let piece_index = PieceIndex::new(buf.get_u32());
                Ok(PeerMessage::Have { piece_index })
            }
            5 => {
                let bitfield_len = length - 1;
                let bitfield = Bytes::copy_from_slice(&buf[..bitfield_len as usize]);
                Ok(PeerMessage::Bitfield { bitfield })
            }
            6 => {
                expect(13, "Request")?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Request {
                    piece_index,
                    offset,
                    length,
                })
            }
            7 => {
                if length < 9 {
                    return Err(TorrentError::ProtocolError {
                        message: "Invalid Piece message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let data_len = length - 9;
                let data = Bytes::copy_from_slice(&buf[..data_len as usize]);
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data,
                })
            }
            8 => {
                expect(13, "Cancel")?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Cancel {
                    piece_index,
                    offset,
                    length,
                })
            }
            20 => {
                expect(2, "Close")?;
                Ok(PeerMessage::Close {
                    reason: buf.get_u8(),
                })
            }
            _ => Err(TorrentError::ProtocolError {
                message: format!("Unknown message ID: {message_id}"),
            }),
        }
    }
}

/// Packs piece availability into a BEP 3 bitfield, high bit first.
pub fn pack_bitfield(have: &[bool]) -> Bytes {
    let mut bytes = vec![0u8; have.len().div_ceil(8)];
    for (index, _) in have.iter().enumerate().filter(|(_, h)| **h) {
        bytes[index / 8] |= 0x80 >> (index % 8);
    }
    Bytes::from(bytes)
}

/// Unpacks a bitfield into `num_pieces` flags; missing bytes read as zero.
pub fn unpack_bitfield(bitfield: &[u8], num_pieces: u32) -> Vec<bool> {
    (0..num_pieces as usize)
        .map(|index| {
            bitfield
                .get(index / 8)
                .is_some_and(|byte| byte & (0x80 >> (index % 8)) != 0)
        })
        .collect()
}

/// Applies the simulated RC4 keystream for `key` in place.
///
/// The keystream is an XOR pad, so applying it twice restores the input.
pub fn apply_keystream(key: &InfoHash, buf: &mut [u8]) {
    let key = key.as_bytes();
    for (position, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[position % key.len()] ^ (position as u8).wrapping_mul(31);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let bytes = MessageCodec::serialize_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(3),
            offset: 0x4000,
            length: 0x4000,
        });
        assert_eq!(
            bytes,
            vec![0, 0, 0, 13, 6, 0, 0, 0, 3, 0, 0, 0x40, 0, 0, 0, 0x40, 0]
        );
    }

    #[test]
    fn test_piece_and_close_parse() {
        let piece = PeerMessage::Piece {
            piece_index: PieceIndex::new(1),
            offset: 0,
            data: Bytes::from_static(b"abc"),
        };
        let bytes = MessageCodec::serialize_message(&piece);
        assert_eq!(MessageCodec::deserialize_message(&bytes).unwrap(), piece);

        let close = MessageCodec::serialize_message(&PeerMessage::Close { reason: 4 });
        assert_eq!(
            MessageCodec::deserialize_message(&close).unwrap(),
            PeerMessage::Close { reason: 4 }
        );
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 0]).is_err());
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 9, 4, 0]).is_err());
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 3, 4, 0, 0]).is_err());
        assert!(MessageCodec::deserialize_message(&[0, 0, 0, 1, 99]).is_err());
    }

    #[test]
    fn test_bitfield_packing() {
        let have = [true, false, false, false, false, false, false, true, true];
        let packed = pack_bitfield(&have);
        assert_eq!(&packed[..], &[0x81, 0x80]);
        assert_eq!(unpack_bitfield(&packed, 9), have);
        assert_eq!(unpack_bitfield(&[0xff], 10)[8..], [false, false]);
    }

    #[test]
    fn test_keystream_is_symmetric() {
        let key = InfoHash::new([0x5a; 20]);
        let mut buf = b"interested".to_vec();
        apply_keystream(&key, &mut buf);
        assert_ne!(&buf[..], b"interested");
        apply_keystream(&key, &mut buf);
        assert_eq!(&buf[..], b"interested");
    }
}
