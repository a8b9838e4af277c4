//! Deadline timers bound to an I/O context.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::{IoContext, SimTime, SimulationError};

type WaitHandler = Box<dyn FnOnce(Result<(), SimulationError>)>;

struct TimerState {
    expiry: SimTime,
    /// Bumped on every arm and cancel; stale wakeups compare against it
    generation: u64,
    handler: Option<WaitHandler>,
}

/// One-shot timer firing in virtual time.
///
/// Arm with [`expires_from_now`](Self::expires_from_now), then register a
/// handler with [`async_wait`](Self::async_wait). The handler receives
/// `Ok(())` when the deadline passes, or `Err(OperationAborted)` if the
/// wait is cancelled, re-armed or the timer is dropped first.
pub struct DeadlineTimer {
    io: IoContext,
    state: Rc<RefCell<TimerState>>,
}

impl DeadlineTimer {
    /// Creates an unarmed timer on `io`.
    pub fn new(io: &IoContext) -> Self {
        Self {
            io: io.clone(),
            state: Rc::new(RefCell::new(TimerState {
                expiry: io.now(),
                generation: 0,
                handler: None,
            })),
        }
    }

    /// Sets the deadline `duration` from now.
    ///
    /// Cancels any pending wait. Returns the number of waits cancelled.
    pub fn expires_from_now(&self, duration: Duration) -> usize {
        let cancelled = self.cancel();
        self.state.borrow_mut().expiry = self.io.now() + duration;
        cancelled
    }

    /// Current deadline.
    pub fn expiry(&self) -> SimTime {
        self.state.borrow().expiry
    }

    /// Registers `handler` to run when the deadline passes.
    ///
    /// A wait registered while another is pending replaces it; the old
    /// handler is completed with `OperationAborted`.
    pub fn async_wait(&self, handler: impl FnOnce(Result<(), SimulationError>) + 'static) {
        self.cancel();

        let (expiry, generation) = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            state.handler = Some(Box::new(handler));
            (state.expiry, state.generation)
        };

        let weak: Weak<RefCell<TimerState>> = Rc::downgrade(&self.state);
        self.io.simulation().schedule_at(
            expiry,
            Box::new(move || {
                let Some(state) = weak.upgrade() else {
                    return;
                };
                let handler = {
                    let mut state = state.borrow_mut();
                    if state.generation != generation {
                        return;
                    }
                    state.handler.take()
                };
                if let Some(handler) = handler {
                    handler(Ok(()));
                }
            }),
        );
    }

    /// Cancels a pending wait.
    ///
    /// The handler is posted with `Err(OperationAborted)`, never run inline.
    /// Returns the number of waits cancelled.
    pub fn cancel(&self) -> usize {
        let handler = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            state.handler.take()
        };

        match handler {
            Some(handler) => {
                self.io
                    .post(move || handler(Err(SimulationError::OperationAborted)));
                1
            }
            None => 0,
        }
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::Simulation;

    fn context(sim: &Simulation) -> IoContext {
        IoContext::new(sim, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    #[test]
    fn test_timer_fires_at_deadline() {
        let sim = Simulation::default();
        let io = context(&sim);
        let timer = DeadlineTimer::new(&io);
        let fired_at = Rc::new(Cell::new(None));

        timer.expires_from_now(Duration::from_secs(3));
        let sink = Rc::clone(&fired_at);
        let clock = sim.clone();
        timer.async_wait(move |result| {
            assert!(result.is_ok());
            sink.set(Some(clock.now()));
        });

        sim.run().unwrap();
        assert_eq!(
            fired_at.get(),
            Some(SimTime::from_duration(Duration::from_secs(3)))
        );
    }

    #[test]
    fn test_cancel_delivers_aborted() {
        let sim = Simulation::default();
        let io = context(&sim);
        let timer = DeadlineTimer::new(&io);
        let outcome = Rc::new(RefCell::new(None));

        timer.expires_from_now(Duration::from_secs(10));
        let sink = Rc::clone(&outcome);
        timer.async_wait(move |result| *sink.borrow_mut() = Some(result));
        assert_eq!(timer.cancel(), 1);
        assert_eq!(timer.cancel(), 0);

        sim.run().unwrap();
        assert_eq!(
            *outcome.borrow(),
            Some(Err(SimulationError::OperationAborted))
        );
        // The stale wakeup stays queued until its deadline and then does nothing
        assert_eq!(sim.elapsed(), Duration::from_secs(10));
    }

    #[test]
    fn test_rearm_from_handler() {
        let sim = Simulation::default();
        let io = context(&sim);
        let timer = Rc::new(DeadlineTimer::new(&io));
        let ticks = Rc::new(Cell::new(0u32));

        fn on_tick(
            timer: Rc<DeadlineTimer>,
            ticks: Rc<Cell<u32>>,
            result: Result<(), SimulationError>,
        ) {
            if result.is_err() {
                return;
            }
            ticks.set(ticks.get() + 1);
            if ticks.get() < 3 {
                timer.expires_from_now(Duration::from_secs(1));
                let next = Rc::clone(&timer);
                timer.async_wait(move |r| on_tick(next, ticks, r));
            }
        }

        timer.expires_from_now(Duration::from_secs(1));
        let next = Rc::clone(&timer);
        let count = Rc::clone(&ticks);
        timer.async_wait(move |r| on_tick(next, count, r));

        sim.run().unwrap();
        assert_eq!(ticks.get(), 3);
        assert_eq!(sim.elapsed(), Duration::from_secs(3));
    }
}
