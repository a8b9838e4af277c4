//! Session settings.
//!
//! A plain settings pack applied when a session is constructed. Every field
//! has a working default; tests clone a default pack and adjust what they
//! exercise.

use std::time::Duration;

use crate::protocol::{PeerId, Transport};

/// How a session treats encryption for one connection direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncPolicy {
    /// Only encrypted connections are accepted
    Forced,
    /// Encrypted and plaintext connections are both accepted
    #[default]
    Enabled,
    /// Only plaintext connections are accepted
    Disabled,
}

/// Which encryption levels an encrypted connection may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncLevel {
    /// Obfuscated handshake only
    Plaintext,
    /// Full stream encryption
    Rc4,
    /// Either level
    #[default]
    Both,
}

/// Encryption levels acceptable on one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptionOffer {
    /// Unencrypted stream acceptable
    pub plaintext: bool,
    /// RC4 stream acceptable
    pub rc4: bool,
}

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SettingsPack {
    /// Identity announced in handshakes
    pub peer_id: PeerId,
    /// Port the session listens on
    pub listen_port: u16,
    /// Initiate connections over TCP
    pub enable_outgoing_tcp: bool,
    /// Accept connections over TCP
    pub enable_incoming_tcp: bool,
    /// Initiate connections over uTP
    pub enable_outgoing_utp: bool,
    /// Accept connections over uTP
    pub enable_incoming_utp: bool,
    /// Ask for RC4 when plaintext would also be accepted
    pub prefer_rc4: bool,
    /// Policy for connections peers open to us
    pub in_enc_policy: EncPolicy,
    /// Policy for connections we open
    pub out_enc_policy: EncPolicy,
    /// Levels allowed on encrypted connections
    pub allowed_enc_level: EncLevel,
    /// Peers unchoked at the same time per torrent
    pub unchoke_slots_limit: usize,
    /// Block requests kept in flight per peer
    pub max_out_request_queue: usize,
    /// Time before an unanswered block request is re-issued
    pub request_timeout: Duration,
    /// Time before an unanswered handshake is abandoned
    pub handshake_timeout: Duration,
    /// Connections allowed across all torrents
    pub connections_limit: usize,
    /// Alerts kept before new ones are dropped
    pub alert_queue_size: usize,
}

impl Default for SettingsPack {
    fn default() -> Self {
        Self {
            peer_id: PeerId::generate(),
            listen_port: crate::DEFAULT_LISTEN_PORT,
            enable_outgoing_tcp: true,
            enable_incoming_tcp: true,
            enable_outgoing_utp: true,
            enable_incoming_utp: true,
            prefer_rc4: false,
            in_enc_policy: EncPolicy::Enabled,
            out_enc_policy: EncPolicy::Enabled,
            allowed_enc_level: EncLevel::Both,
            unchoke_slots_limit: 8,
            max_out_request_queue: 4,
            request_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            connections_limit: 200,
            alert_queue_size: 1000,
        }
    }
}

impl SettingsPack {
    /// Transports this session may initiate connections over.
    pub fn outgoing_transports(&self) -> Vec<Transport> {
        let mut transports = Vec::new();
        if self.enable_outgoing_tcp {
            transports.push(Transport::Tcp);
        }
        if self.enable_outgoing_utp {
            transports.push(Transport::Utp);
        }
        transports
    }

    /// Whether this session accepts connections over `transport`.
    pub fn accepts_transport(&self, transport: Transport) -> bool {
        match transport {
            Transport::Tcp => self.enable_incoming_tcp,
            Transport::Utp => self.enable_incoming_utp,
        }
    }

    /// Encryption levels acceptable under `policy`.
    pub fn encryption_offer(&self, policy: EncPolicy) -> EncryptionOffer {
        match policy {
            EncPolicy::Disabled => EncryptionOffer {
                plaintext: true,
                rc4: false,
            },
            EncPolicy::Enabled => EncryptionOffer {
                plaintext: true,
                rc4: self.allowed_enc_level != EncLevel::Plaintext,
            },
            EncPolicy::Forced => EncryptionOffer {
                plaintext: false,
                rc4: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let pack = SettingsPack::default();
        assert_eq!(pack.listen_port, 6881);
        assert_eq!(
            pack.outgoing_transports(),
            vec![Transport::Tcp, Transport::Utp]
        );
        assert!(pack.accepts_transport(Transport::Tcp));
        assert_eq!(&pack.peer_id.as_bytes()[..8], b"-SG0001-");
    }

    #[test]
    fn test_encryption_offers() {
        let mut pack = SettingsPack::default();
        assert_eq!(
            pack.encryption_offer(EncPolicy::Enabled),
            EncryptionOffer {
                plaintext: true,
                rc4: true
            }
        );
        assert_eq!(
            pack.encryption_offer(EncPolicy::Forced),
            EncryptionOffer {
                plaintext: false,
                rc4: true
            }
        );

        pack.allowed_enc_level = EncLevel::Plaintext;
        assert!(!pack.encryption_offer(EncPolicy::Enabled).rc4);
        assert!(!pack.encryption_offer(EncPolicy::Disabled).rc4);
    }
}
