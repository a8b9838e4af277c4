//! Settings presets for swarm nodes.

use std::time::Duration;

use surge_core::{EncLevel, EncPolicy, SettingsPack};

/// Baseline settings every swarm node starts from.
///
/// Request timeouts are long enough for a full pipeline to drain through the
/// slowest modem without being re-requested.
pub fn default_settings() -> SettingsPack {
    SettingsPack {
        request_timeout: Duration::from_secs(20),
        handshake_timeout: Duration::from_secs(20),
        alert_queue_size: 10_000,
        ..SettingsPack::default()
    }
}

/// Restricts a session to uTP in both directions.
pub fn utp_only(pack: &mut SettingsPack) {
    pack.enable_outgoing_tcp = false;
    pack.enable_incoming_tcp = false;
    pack.enable_outgoing_utp = true;
    pack.enable_incoming_utp = true;
}

/// Forces RC4 encryption in both directions.
pub fn enable_enc(pack: &mut SettingsPack) {
    pack.prefer_rc4 = true;
    pack.in_enc_policy = EncPolicy::Forced;
    pack.out_enc_policy = EncPolicy::Forced;
    pack.allowed_enc_level = EncLevel::Both;
}

#[cfg(test)]
mod tests {
    use surge_core::Transport;

    use super::*;

    #[test]
    fn test_utp_only() {
        let mut pack = default_settings();
        utp_only(&mut pack);
        assert_eq!(pack.outgoing_transports(), vec![Transport::Utp]);
        assert!(!pack.accepts_transport(Transport::Tcp));
    }

    #[test]
    fn test_enable_enc() {
        let mut pack = default_settings();
        enable_enc(&mut pack);
        let offer = pack.encryption_offer(pack.out_enc_policy);
        assert!(offer.rc4);
        assert!(!offer.plaintext);
    }
}
