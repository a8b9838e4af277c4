//! Shutdown sequencer.
//!
//! Aborting a session is asynchronous, so every node is turned into a zombie
//! proxy that keeps the teardown alive while the event loop drains. The node
//! itself is released at once; relayed drains still in flight find nothing
//! and return.

use crate::nodes::Node;
use crate::swarm::SwarmContext;

/// Aborts every live node and parks its teardown proxy.
pub(crate) fn shut_down(ctx: &SwarmContext) {
    if ctx.terminated.replace(true) {
        return;
    }
    if ctx.config.print_alerts {
        println!("TERMINATING");
    }
    tracing::info!(
        "Terminating swarm {} at tick {}",
        ctx.swarm_id,
        ctx.tick.get()
    );

    let released: Vec<Node> = ctx
        .nodes
        .borrow_mut()
        .iter_mut()
        .filter_map(Option::take)
        .collect();

    let mut zombies = ctx.zombies.borrow_mut();
    for node in released {
        tracing::debug!("Aborting node {}", node.index);
        zombies.push(node.session.abort());
    }
}
