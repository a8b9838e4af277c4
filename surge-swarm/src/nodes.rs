//! Node set builder.
//!
//! Materializes the participants of a swarm: node 0 is the node under test,
//! every other node is scaffolding that only talks to node 0.

use std::fs::{self, File};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use surge_core::{
    AddTorrentParams, IpFilter, PeerId, Session, SettingsPack, TorrentInfo, create_torrent,
};
use surge_sim::{IoContext, Simulation};

use crate::config::SwarmRole;
use crate::error::{Result, SwarmError};
use crate::relay;
use crate::swarm::SwarmContext;

/// Address scaffold nodes accept connections from
pub const PRIMARY_ADDRESS: Ipv4Addr = Ipv4Addr::new(50, 0, 0, 1);

/// Name of the torrent and its content file
pub const TORRENT_NAME: &str = "temporary";

/// Largest swarm the `50.0.x.y` address plan can number
pub const MAX_NODES: usize = 0xffff;

/// One participant of a swarm.
pub(crate) struct Node {
    pub(crate) index: usize,
    pub(crate) io: IoContext,
    pub(crate) session: Session,
}

impl Node {
    pub(crate) fn is_primary(&self) -> bool {
        self.index == 0
    }
}

/// Address of node `index`: `50.0.<(index+1) >> 8>.<(index+1) & 0xff>`.
pub fn node_address(index: usize) -> IpAddr {
    let n = index + 1;
    IpAddr::V4(Ipv4Addr::new(50, 0, ((n >> 8) & 0xff) as u8, (n & 0xff) as u8))
}

/// Directory of node `idx` in swarm `swarm_id`: `swarm-%04d-peer-%02d`.
pub fn save_path(base_dir: &Path, swarm_id: u32, idx: usize) -> PathBuf {
    base_dir.join(format!("swarm-{swarm_id:04}-peer-{idx:02}"))
}

/// Filter installed on scaffold nodes: everything blocked but node 0.
pub fn scaffold_filter() -> IpFilter {
    let mut filter = IpFilter::new();
    filter.add_rule(
        IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V4(Ipv4Addr::BROADCAST),
        IpFilter::BLOCKED,
    );
    filter.add_rule(
        IpAddr::V4(PRIMARY_ADDRESS),
        IpAddr::V4(PRIMARY_ADDRESS),
        0,
    );
    filter
}

/// Save path of node `index` for `role`.
///
/// Seeds read from `peer-00`, where the content is synthesized. In download
/// runs node 0 writes to `peer-01`; in upload runs node `i` uses `peer-0i`.
pub fn role_save_path(base_dir: &Path, swarm_id: u32, role: SwarmRole, index: usize) -> PathBuf {
    let idx = match role {
        SwarmRole::Download if index > 0 => 0,
        SwarmRole::Download => 1,
        SwarmRole::Upload => index,
    };
    save_path(base_dir, swarm_id, idx)
}

/// Reserves an id whose `peer-00` directory does not exist yet under
/// `base_dir`, drawing candidates from `next_id`.
///
/// Creating `peer-00` is the reservation, so runs sharing a directory never
/// pick up each other's finished content. Failures other than an existing
/// directory are left to the content writer to report.
pub(crate) fn claim_swarm_id(base_dir: &Path, mut next_id: impl FnMut() -> u32) -> u32 {
    if let Err(e) = fs::create_dir_all(base_dir) {
        tracing::warn!("Cannot create {}: {}", base_dir.display(), e);
    }
    loop {
        let id = next_id();
        match fs::create_dir(save_path(base_dir, id, 0)) {
            Ok(()) => return id,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                tracing::debug!("Swarm {} already has a directory, skipping", id);
            }
            Err(e) => {
                tracing::warn!("Cannot reserve swarm {}: {}", id, e);
                return id;
            }
        }
    }
}

/// Writes the swarm's content under `peer-00` and returns its metadata.
///
/// A directory that cannot be created is reported and the run goes on; the
/// seeds then fail to find their content and say so through alerts.
fn synthesize_torrent(ctx: &SwarmContext) -> Result<TorrentInfo> {
    let config = &ctx.config;
    let dir = save_path(&config.base_dir, ctx.swarm_id, 0);

    if let Err(e) = fs::create_dir_all(&dir) {
        eprintln!("failed to create directory: \"{}\": {}", dir.display(), e);
        tracing::warn!("Failed to create {}: {}", dir.display(), e);
    }

    let info = match File::create(dir.join(TORRENT_NAME)) {
        Ok(mut file) => create_torrent(
            Some(&mut file),
            TORRENT_NAME,
            config.piece_size,
            config.num_pieces,
            false,
        )?,
        Err(e) => {
            tracing::warn!("Cannot write seed content in {}: {}", dir.display(), e);
            create_torrent(None, TORRENT_NAME, config.piece_size, config.num_pieces, false)?
        }
    };

    tracing::debug!(
        "Synthesized {} ({} pieces of {} bytes) in {}",
        TORRENT_NAME,
        info.num_pieces(),
        info.piece_length(),
        dir.display()
    );
    Ok(info)
}

/// Creates every node of the swarm and submits its torrent.
///
/// Node 0 gets the caller's customizations; the others get the scaffold IP
/// filter. Each node's alert relay is registered as soon as it exists.
///
/// # Errors
/// - `SwarmError::InvalidNodeCount` - Zero nodes requested
/// - `SwarmError::AddressSpaceExhausted` - More nodes than addresses
/// - `SwarmError::Torrent` - The configured torrent layout is invalid
pub(crate) fn build_nodes(
    ctx: &Rc<SwarmContext>,
    sim: &Simulation,
    default_settings: &SettingsPack,
    default_add_torrent: &AddTorrentParams,
) -> Result<()> {
    let num_nodes = ctx.num_nodes;
    if num_nodes == 0 {
        return Err(SwarmError::InvalidNodeCount { num_nodes });
    }
    if num_nodes > MAX_NODES {
        return Err(SwarmError::AddressSpaceExhausted { num_nodes });
    }

    let info = Rc::new(synthesize_torrent(ctx)?);
    let mut rng = ChaCha8Rng::seed_from_u64(ctx.config.seed);

    for index in 0..num_nodes {
        let io = IoContext::new(sim, node_address(index));

        let mut settings = default_settings.clone();
        settings.peer_id = PeerId::from_rng(&mut rng);
        settings.listen_port = ctx.config.listen_port;

        let session = {
            let mut hooks = ctx.hooks.borrow_mut();
            if index == 0 {
                (hooks.session_customize)(&mut settings);
            }
            let session = Session::new(settings, &io);
            (hooks.session_init)(&session);
            session
        };

        if index > 0 {
            session.set_ip_filter(scaffold_filter());
        }

        let mut params = default_add_torrent.clone();
        params.save_path = role_save_path(&ctx.config.base_dir, ctx.swarm_id, ctx.role, index);
        params.ti = Some(Rc::clone(&info));
        if index == 0 {
            (ctx.hooks.borrow_mut().add_torrent_customize)(&mut params);
        }
        tracing::debug!(
            "Node {} at {} saving to {}",
            index,
            io.address(),
            params.save_path.display()
        );
        session.async_add_torrent(params);

        ctx.nodes.borrow_mut().push(Some(Node { index, io, session }));
        relay::install(ctx, index);
    }

    tracing::info!(
        "Built {} nodes for swarm {} ({})",
        num_nodes,
        ctx.swarm_id,
        ctx.role
    );
    Ok(())
}
