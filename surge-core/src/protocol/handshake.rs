//! Handshake serialization and connection negotiation

use super::types::{PeerHandshake, PeerId, Transport};
use crate::alert::CloseReason;
use crate::settings::SettingsPack;
use crate::torrent::{InfoHash, TorrentError};

/// Serialized handshake length with the standard protocol string
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake serialization utilities for the peer wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake message following BEP 3
    pub fn serialize_handshake(handshake: &PeerHandshake) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HANDSHAKE_LEN);

        buf.push(handshake.protocol.len() as u8);
        buf.extend_from_slice(handshake.protocol.as_bytes());
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());

        buf
    }

    /// Deserializes handshake message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Invalid handshake format or length
    pub fn deserialize_handshake(data: &[u8]) -> Result<PeerHandshake, TorrentError> {
        if data.len() < 49 {
            return Err(TorrentError::ProtocolError {
                message: "Handshake too short".to_string(),
            });
        }

        let protocol_len = data[0] as usize;
        if data.len() < 1 + protocol_len + 8 + 20 + 20 {
            return Err(TorrentError::ProtocolError {
                message: "Invalid handshake length".to_string(),
            });
        }

        let protocol = String::from_utf8_lossy(&data[1..1 + protocol_len]).to_string();
        let mut offset = 1 + protocol_len;

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[offset..offset + 8]);
        offset += 8;

        let mut info_hash_bytes = [0u8; 20];
        info_hash_bytes.copy_from_slice(&data[offset..offset + 20]);
        offset += 20;

        let mut peer_id_bytes = [0u8; 20];
        peer_id_bytes.copy_from_slice(&data[offset..offset + 20]);

        Ok(PeerHandshake {
            protocol,
            reserved,
            info_hash: InfoHash::new(info_hash_bytes),
            peer_id: PeerId::new(peer_id_bytes),
        })
    }
}

/// Outcome of a successful negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Transport the connection runs over
    pub transport: Transport,
    /// Whether the stream is RC4 encrypted
    pub encrypted: bool,
}

/// Builds the handshake an initiator sends for `info_hash`.
pub fn offer(info_hash: InfoHash, settings: &SettingsPack) -> PeerHandshake {
    let transports = settings.outgoing_transports();
    let encryption = settings.encryption_offer(settings.out_enc_policy);

    PeerHandshake::new(info_hash, settings.peer_id)
        .with_transports(
            transports.contains(&Transport::Tcp),
            transports.contains(&Transport::Utp),
        )
        .with_encryption(encryption.plaintext, encryption.rc4, settings.prefer_rc4)
}

/// Picks transport and encryption for an incoming `offer`.
///
/// uTP wins when both sides allow it. RC4 is chosen when both sides accept
/// it and either plaintext is not mutually acceptable or one side prefers
/// RC4.
///
/// # Errors
/// - `CloseReason::TransportMismatch` - No transport in common
/// - `CloseReason::EncryptionMismatch` - No encryption level in common
pub fn negotiate(offer: &PeerHandshake, settings: &SettingsPack) -> Result<Negotiated, CloseReason> {
    let transport = [Transport::Utp, Transport::Tcp]
        .into_iter()
        .find(|&t| offer.supports_transport(t) && settings.accepts_transport(t))
        .ok_or(CloseReason::TransportMismatch)?;

    let ours = settings.encryption_offer(settings.in_enc_policy);
    let plaintext = ours.plaintext && offer.allows_plaintext();
    let rc4 = ours.rc4 && offer.allows_rc4();

    let encrypted = match (plaintext, rc4) {
        (false, false) => return Err(CloseReason::EncryptionMismatch),
        (false, true) => true,
        (true, false) => false,
        (true, true) => offer.prefers_rc4() || settings.prefer_rc4,
    };

    Ok(Negotiated {
        transport,
        encrypted,
    })
}

/// Builds the accept a responder sends back.
pub fn accept(info_hash: InfoHash, settings: &SettingsPack, negotiated: Negotiated) -> PeerHandshake {
    PeerHandshake::new(info_hash, settings.peer_id)
        .with_transports(
            negotiated.transport == Transport::Tcp,
            negotiated.transport == Transport::Utp,
        )
        .with_encryption(!negotiated.encrypted, negotiated.encrypted, false)
}

/// Reads the responder's choice out of an accept.
pub fn accepted(accept: &PeerHandshake) -> Negotiated {
    let transport = if accept.supports_transport(Transport::Utp) {
        Transport::Utp
    } else {
        Transport::Tcp
    };
    Negotiated {
        transport,
        encrypted: accept.allows_rc4(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{EncLevel, EncPolicy};

    fn settings() -> SettingsPack {
        SettingsPack {
            peer_id: PeerId::new([7u8; 20]),
            ..SettingsPack::default()
        }
    }

    #[test]
    fn test_handshake_layout() {
        let handshake = offer(InfoHash::new([1u8; 20]), &settings());
        let bytes = HandshakeCodec::serialize_handshake(&handshake);

        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[7u8; 20]);

        let parsed = HandshakeCodec::deserialize_handshake(&bytes).unwrap();
        assert_eq!(parsed, handshake);
    }

    #[test]
    fn test_short_handshake_rejected() {
        assert!(HandshakeCodec::deserialize_handshake(&[19u8; 40]).is_err());
    }

    #[test]
    fn test_utp_preferred() {
        let handshake = offer(InfoHash::new([0u8; 20]), &settings());
        let chosen = negotiate(&handshake, &settings()).unwrap();
        assert_eq!(chosen.transport, Transport::Utp);
        assert!(!chosen.encrypted);
    }

    #[test]
    fn test_tcp_only_initiator_against_utp_only_responder() {
        let mut initiator = settings();
        initiator.enable_outgoing_utp = false;
        let mut responder = settings();
        responder.enable_incoming_tcp = false;

        let handshake = offer(InfoHash::new([0u8; 20]), &initiator);
        assert_eq!(
            negotiate(&handshake, &responder),
            Err(CloseReason::TransportMismatch)
        );
    }

    #[test]
    fn test_forced_encryption() {
        let mut forced = settings();
        forced.prefer_rc4 = true;
        forced.in_enc_policy = EncPolicy::Forced;
        forced.out_enc_policy = EncPolicy::Forced;
        forced.allowed_enc_level = EncLevel::Both;

        // Forced initiator against a default responder picks rc4
        let handshake = offer(InfoHash::new([0u8; 20]), &forced);
        let chosen = negotiate(&handshake, &settings()).unwrap();
        assert!(chosen.encrypted);

        let reply = accept(InfoHash::new([0u8; 20]), &settings(), chosen);
        assert_eq!(accepted(&reply), chosen);

        // Forced initiator against a responder with encryption disabled
        let mut plain = settings();
        plain.in_enc_policy = EncPolicy::Disabled;
        assert_eq!(
            negotiate(&handshake, &plain),
            Err(CloseReason::EncryptionMismatch)
        );
    }
}
