//! Tick driver.
//!
//! Once per virtual second the driver asks the caller whether the run is
//! over. Upload runs also end when every scaffold node is seeding, and are
//! flagged as stalled when that takes too long.

use std::rc::Rc;
use std::time::Duration;

use surge_sim::{DeadlineTimer, IoContext};

use crate::config::SwarmRole;
use crate::shutdown;
use crate::status::is_seed;
use crate::swarm::SwarmContext;

/// Virtual time between two ticks
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Arms the tick timer on `io`; the first tick fires one interval from now.
pub(crate) fn start(ctx: &Rc<SwarmContext>, io: &IoContext) {
    *ctx.timer.borrow_mut() = Some(DeadlineTimer::new(io));
    schedule(ctx);
}

fn schedule(ctx: &Rc<SwarmContext>) {
    let timer = ctx.timer.borrow();
    let Some(timer) = timer.as_ref() else {
        return;
    };

    timer.expires_from_now(TICK_INTERVAL);
    let weak = Rc::downgrade(ctx);
    timer.async_wait(move |result| {
        if result.is_err() {
            return;
        }
        if let Some(ctx) = weak.upgrade() {
            on_tick(&ctx);
        }
    });
}

fn on_tick(ctx: &Rc<SwarmContext>) {
    let tick = ctx.tick.get();

    let shut_down = {
        let nodes = ctx.nodes.borrow();
        let Some(primary) = nodes.first().and_then(Option::as_ref) else {
            return;
        };
        let mut shut_down = (ctx.hooks.borrow_mut().terminate)(tick, &primary.session);

        if ctx.role == SwarmRole::Upload {
            shut_down |= nodes
                .iter()
                .skip(1)
                .flatten()
                .all(|node| is_seed(&node.session));

            if tick > ctx.config.stall_tick(ctx.num_nodes)
                && !shut_down
                && !ctx.stall_reported.replace(true)
            {
                tracing::error!(
                    "seeding failed! scaffold nodes still downloading at tick {}",
                    tick
                );
                ctx.record_failure(format!("seeding failed at tick {tick}"));
            }
        }
        shut_down
    };

    if shut_down {
        shutdown::shut_down(ctx);
        return;
    }

    ctx.tick.set(tick + 1);
    tracing::trace!("Swarm {} tick {}", ctx.swarm_id, tick + 1);
    schedule(ctx);
}
