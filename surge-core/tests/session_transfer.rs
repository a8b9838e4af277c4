//! Two sessions exchanging a torrent over the simulated network.

use std::fs::{self, File};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use surge_core::{
    AddTorrentParams, Alert, AlertKind, CloseReason, EncPolicy, IpFilter, Session, SettingsPack,
    TorrentInfo, TorrentState, Transport, create_torrent,
};
use surge_sim::{IoContext, Simulation};
use tempfile::TempDir;

const NUM_PIECES: u32 = 9;

fn host(last: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(50, 0, 0, last))
}

fn endpoint(last: u8) -> SocketAddr {
    SocketAddr::new(host(last), surge_core::DEFAULT_LISTEN_PORT)
}

/// Writes the torrent's content into `dir` and returns its metadata.
fn seed_content(dir: &Path) -> Rc<TorrentInfo> {
    let mut file = File::create(dir.join("temporary")).unwrap();
    Rc::new(create_torrent(Some(&mut file), "temporary", 0x4000, NUM_PIECES, false).unwrap())
}

struct Pair {
    sim: Simulation,
    seed: Session,
    downloader: Session,
    info: Rc<TorrentInfo>,
    seed_dir: TempDir,
    download_dir: TempDir,
}

fn pair(seed_settings: SettingsPack, download_settings: SettingsPack) -> Pair {
    let sim = Simulation::default();
    let seed_dir = TempDir::new().unwrap();
    let download_dir = TempDir::new().unwrap();
    let info = seed_content(seed_dir.path());

    let seed = Session::new(seed_settings, &IoContext::new(&sim, host(1)));
    let downloader = Session::new(download_settings, &IoContext::new(&sim, host(2)));
    seed.async_add_torrent(AddTorrentParams::new(Rc::clone(&info), seed_dir.path()));
    downloader.async_add_torrent(AddTorrentParams::new(Rc::clone(&info), download_dir.path()));
    sim.run().unwrap();

    Pair {
        sim,
        seed,
        downloader,
        info,
        seed_dir,
        download_dir,
    }
}

fn kinds(alerts: &[Alert]) -> Vec<&AlertKind> {
    alerts.iter().map(Alert::kind).collect()
}

#[test]
fn test_downloader_fetches_every_piece() {
    let p = pair(SettingsPack::default(), SettingsPack::default());
    assert!(p.seed.get_torrents()[0].status().is_seeding);

    let handle = p.downloader.get_torrents().remove(0);
    handle.connect_peer(endpoint(1));
    p.sim.run().unwrap();

    let status = handle.status();
    assert!(status.is_seeding);
    assert!(status.is_finished);
    assert_eq!(status.num_pieces, NUM_PIECES);
    assert_eq!(status.total_download, p.info.total_length());
    assert_eq!(
        p.seed.get_torrents()[0].status().total_upload,
        p.info.total_length()
    );

    let original = fs::read(p.seed_dir.path().join("temporary")).unwrap();
    let copy = fs::read(p.download_dir.path().join("temporary")).unwrap();
    assert_eq!(original, copy);

    let alerts = p.downloader.pop_alerts();
    let finished = alerts
        .iter()
        .filter(|a| a.what() == "piece_finished")
        .count();
    assert_eq!(finished, NUM_PIECES as usize);
    assert!(kinds(&alerts).iter().any(|k| matches!(
        k,
        AlertKind::StateChanged {
            prev_state: TorrentState::Downloading,
            state: TorrentState::Seeding,
            ..
        }
    )));

    let peers = handle.peer_info();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].transport, Some(Transport::Utp));
    assert!(!peers[0].encrypted);
}

#[test]
fn test_rc4_connection_when_preferred() {
    let mut seed = SettingsPack::default();
    seed.in_enc_policy = EncPolicy::Forced;
    let mut downloader = SettingsPack::default();
    downloader.prefer_rc4 = true;
    let p = pair(seed, downloader);

    let handle = p.downloader.get_torrents().remove(0);
    handle.connect_peer(endpoint(1));
    p.sim.run().unwrap();

    assert!(handle.status().is_seeding);
    let alerts = p.downloader.pop_alerts();
    assert!(kinds(&alerts).iter().any(|k| matches!(
        k,
        AlertKind::PeerConnect {
            encrypted: true,
            ..
        }
    )));
}

#[test]
fn test_encryption_mismatch_refused() {
    let mut seed = SettingsPack::default();
    seed.in_enc_policy = EncPolicy::Forced;
    let mut downloader = SettingsPack::default();
    downloader.out_enc_policy = EncPolicy::Disabled;
    let p = pair(seed, downloader);

    let handle = p.downloader.get_torrents().remove(0);
    handle.connect_peer(endpoint(1));
    p.sim.run().unwrap();

    assert_eq!(handle.status().num_pieces, 0);
    assert!(handle.peer_info().is_empty());

    let alerts = p.downloader.pop_alerts();
    assert!(kinds(&alerts).iter().any(|k| matches!(
        k,
        AlertKind::PeerDisconnected {
            reason: CloseReason::EncryptionMismatch,
            ..
        }
    )));
    let seed_alerts = p.seed.pop_alerts();
    assert!(seed_alerts.iter().any(|a| a.what() == "peer_error"));
}

#[test]
fn test_ip_filter_blocks_both_directions() {
    let p = pair(SettingsPack::default(), SettingsPack::default());
    let mut filter = IpFilter::new();
    filter.add_rule(host(2), host(2), IpFilter::BLOCKED);
    p.seed.set_ip_filter(filter);

    // incoming: the seed refuses the downloader
    let handle = p.downloader.get_torrents().remove(0);
    handle.connect_peer(endpoint(1));
    p.sim.run().unwrap();

    assert!(p.seed.pop_alerts().iter().any(|a| a.what() == "peer_blocked"));
    assert!(kinds(&p.downloader.pop_alerts()).iter().any(|k| matches!(
        k,
        AlertKind::PeerDisconnected {
            reason: CloseReason::Blocked,
            ..
        }
    )));

    // outgoing: the seed never sends a handshake
    p.seed.get_torrents()[0].connect_peer(endpoint(2));
    assert!(p.seed.get_torrents()[0].peer_info().is_empty());
    assert_eq!(
        kinds(&p.seed.pop_alerts()),
        [&AlertKind::PeerBlocked {
            endpoint: endpoint(2)
        }]
    );
}

#[test]
fn test_unanswered_handshake_times_out() {
    let p = pair(SettingsPack::default(), SettingsPack::default());
    p.downloader.pop_alerts();

    let handle = p.downloader.get_torrents().remove(0);
    handle.connect_peer(endpoint(9));
    assert_eq!(handle.peer_info().len(), 1);
    assert!(!handle.peer_info()[0].connected);
    p.sim.run().unwrap();

    assert!(p.sim.elapsed() >= Duration::from_secs(10));
    assert!(handle.peer_info().is_empty());
    assert_eq!(
        kinds(&p.downloader.pop_alerts()),
        [&AlertKind::PeerDisconnected {
            info_hash: Some(p.info.info_hash()),
            endpoint: endpoint(9),
            reason: CloseReason::Timeout,
        }]
    );
}

#[test]
fn test_abort_closes_connections() {
    let p = pair(SettingsPack::default(), SettingsPack::default());
    let handle = p.downloader.get_torrents().remove(0);
    handle.connect_peer(endpoint(1));
    p.sim.run().unwrap();
    p.downloader.pop_alerts();

    let proxy = p.seed.abort();
    p.sim.run().unwrap();

    assert!(proxy.is_shut_down());
    assert!(handle.peer_info().is_empty());
    assert!(kinds(&p.downloader.pop_alerts()).iter().any(|k| matches!(
        k,
        AlertKind::PeerDisconnected {
            reason: CloseReason::Shutdown,
            ..
        }
    )));
}

#[test]
fn test_paused_torrents_neither_dial_nor_accept() {
    let p = pair(SettingsPack::default(), SettingsPack::default());
    let handle = p.downloader.get_torrents().remove(0);
    let seed = p.seed.get_torrents().remove(0);

    handle.pause();
    assert!(handle.status().paused);
    handle.connect_peer(endpoint(1));
    assert!(handle.peer_info().is_empty());

    handle.resume();
    seed.pause();
    p.downloader.pop_alerts();
    handle.connect_peer(endpoint(1));
    p.sim.run().unwrap();

    assert_eq!(handle.status().num_pieces, 0);
    assert!(kinds(&p.downloader.pop_alerts()).iter().any(|k| matches!(
        k,
        AlertKind::PeerDisconnected {
            reason: CloseReason::Paused,
            ..
        }
    )));

    seed.resume();
    handle.connect_peer(endpoint(1));
    p.sim.run().unwrap();
    assert!(handle.status().is_seeding);
}

#[test]
fn test_pause_closes_open_connections() {
    let p = pair(SettingsPack::default(), SettingsPack::default());
    let handle = p.downloader.get_torrents().remove(0);
    handle.connect_peer(endpoint(1));
    p.sim.run().unwrap();
    p.seed.pop_alerts();

    let seed = p.seed.get_torrents().remove(0);
    assert_eq!(seed.peer_info().len(), 1);
    seed.pause();
    p.sim.run().unwrap();

    assert!(seed.peer_info().is_empty());
    assert!(handle.peer_info().is_empty());
    assert!(kinds(&p.seed.pop_alerts()).iter().any(|k| matches!(
        k,
        AlertKind::PeerDisconnected {
            reason: CloseReason::Paused,
            ..
        }
    )));
}
