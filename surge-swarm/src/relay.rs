//! Alert relay.
//!
//! A session calls its notify hook in the middle of updating itself, so the
//! hook only posts a drain onto the node's own I/O context. The drain runs
//! later, checks the node still exists, pops the alerts and hands node 0's
//! alerts to the caller.

use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use surge_core::{Alert, AlertKind, InfoHash, Session};
use surge_sim::SimTime;

use crate::nodes::node_address;
use crate::swarm::SwarmContext;

/// Registers the notify hook of node `index`.
pub(crate) fn install(ctx: &Rc<SwarmContext>, index: usize) {
    let nodes = ctx.nodes.borrow();
    let Some(node) = nodes.get(index).and_then(Option::as_ref) else {
        return;
    };

    let weak = Rc::downgrade(ctx);
    let io = node.io.clone();
    node.session.set_alert_notify(move || {
        let ctx = Weak::clone(&weak);
        io.post(move || drain(&ctx, index));
    });
}

/// Formats an alert as `seconds.millis: what message`, timed from `start`.
pub fn format_alert(alert: &Alert, start: SimTime) -> String {
    let millis = alert.timestamp().saturating_duration_since(start).as_millis();
    format!(
        "{:4}.{:03}: {:<25} {}",
        millis / 1000,
        millis % 1000,
        alert.what(),
        alert.message()
    )
}

fn drain(ctx: &Weak<SwarmContext>, index: usize) {
    let Some(ctx) = ctx.upgrade() else {
        return;
    };
    let nodes = ctx.nodes.borrow();

    // the node may have been shut down since the drain was posted
    let Some(node) = nodes.get(index).and_then(Option::as_ref) else {
        tracing::trace!("Node {} released, skipping alert drain", index);
        ctx.drains_skipped.set(ctx.drains_skipped.get() + 1);
        return;
    };

    let alerts = node.session.pop_alerts();
    if !node.is_primary() {
        if ctx.config.trace_scaffold_alerts {
            for alert in &alerts {
                tracing::trace!("node {}: {}", index, format_alert(alert, ctx.start));
            }
        }
        return;
    }

    for alert in &alerts {
        let line = format_alert(alert, ctx.start);
        if ctx.config.print_alerts {
            println!("{line}");
        }
        tracing::debug!("{}", line);

        if let Some(info_hash) = added_torrent(alert) {
            form_mesh(&ctx, &node.session, info_hash);
        }

        (ctx.hooks.borrow_mut().on_alert)(alert, &node.session);
        ctx.alerts_forwarded.set(ctx.alerts_forwarded.get() + 1);
    }
}

/// Torrent a successful add alert reports; failed adds yield nothing.
fn added_torrent(alert: &Alert) -> Option<InfoHash> {
    match alert.kind() {
        AlertKind::AddTorrent {
            info_hash: Some(info_hash),
            error: None,
            ..
        } => Some(*info_hash),
        _ => None,
    }
}

/// Connects node 0 to every scaffold node, once per run.
fn form_mesh(ctx: &SwarmContext, session: &Session, info_hash: InfoHash) {
    if ctx.mesh_formed.get() {
        return;
    }
    let Some(handle) = session.find_torrent(info_hash) else {
        return;
    };
    ctx.mesh_formed.set(true);

    // start at 1 to avoid connecting to ourselves
    for k in 1..ctx.num_nodes {
        handle.connect_peer(SocketAddr::new(node_address(k), ctx.config.listen_port));
        ctx.peers_wired.set(ctx.peers_wired.get() + 1);
    }
    tracing::info!("Node 0 dialed {} scaffold peers", ctx.num_nodes - 1);
}
