//! Rate-limiting link queues and the routes built from them.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use crate::SimTime;

/// Traffic counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Packets that made it through
    pub forwarded_packets: u64,
    /// Bytes that made it through
    pub forwarded_bytes: u64,
    /// Packets dropped because the buffer was full
    pub dropped_packets: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Time the link finishes serializing everything admitted so far
    busy_until: SimTime,
    stats: QueueStats,
}

/// Rate-limited FIFO link with fixed latency and a bounded buffer.
///
/// Packets are serialized one after another at `rate` bytes per second,
/// then delayed by `latency`. A packet that would push the queued backlog
/// past `capacity` bytes is dropped (drop-tail). A rate of zero means the
/// link never limits throughput.
pub struct Queue {
    rate: u64,
    latency: Duration,
    capacity: u64,
    label: String,
    state: RefCell<QueueState>,
}

impl Queue {
    /// Creates a queue with the given throughput, latency and buffer size.
    pub fn new(
        rate_bytes_per_sec: u64,
        latency: Duration,
        capacity_bytes: u64,
        label: impl Into<String>,
    ) -> Self {
        Self {
            rate: rate_bytes_per_sec,
            latency,
            capacity: capacity_bytes,
            label: label.into(),
            state: RefCell::new(QueueState::default()),
        }
    }

    /// Throughput limit in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Latency added to every packet.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Human-readable label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Traffic counters so far.
    pub fn stats(&self) -> QueueStats {
        self.state.borrow().stats
    }

    /// Admits a packet of `size` bytes arriving at `arrival`.
    ///
    /// Returns the time the packet leaves the far end of the link, or `None`
    /// if the buffer had no room for it.
    pub fn admit(&self, arrival: SimTime, size: u64) -> Option<SimTime> {
        let mut state = self.state.borrow_mut();

        if self.rate > 0 && self.backlog_at(&state, arrival) + size > self.capacity {
            state.stats.dropped_packets += 1;
            return None;
        }

        let start = state.busy_until.max(arrival);
        state.busy_until = start + self.transmission_time(size);
        state.stats.forwarded_packets += 1;
        state.stats.forwarded_bytes += size;

        Some(state.busy_until + self.latency)
    }

    /// Bytes still waiting to be serialized at `at`.
    fn backlog_at(&self, state: &QueueState, at: SimTime) -> u64 {
        if self.rate == 0 {
            return 0;
        }
        let waiting = state.busy_until.saturating_duration_since(at);
        (waiting.as_nanos() * u128::from(self.rate) / 1_000_000_000) as u64
    }

    fn transmission_time(&self, size: u64) -> Duration {
        if self.rate == 0 {
            Duration::ZERO
        } else {
            let nanos = u128::from(size) * 1_000_000_000 / u128::from(self.rate);
            Duration::from_nanos(nanos as u64)
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("label", &self.label)
            .field("rate", &self.rate)
            .field("latency", &self.latency)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Ordered sequence of queues a packet traverses.
///
/// Routes are cheap to build and share their queues with every other route
/// through the same link.
#[derive(Debug, Clone, Default)]
pub struct Route {
    hops: Vec<Rc<Queue>>,
}

impl Route {
    /// Creates an empty route (no shaping).
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a hop to the end of the route.
    pub fn append(mut self, queue: Rc<Queue>) -> Self {
        self.hops.push(queue);
        self
    }

    /// Appends every hop of `other` after this route's hops.
    pub fn concat(mut self, other: Route) -> Self {
        self.hops.extend(other.hops);
        self
    }

    /// Hops in traversal order.
    pub fn hops(&self) -> &[Rc<Queue>] {
        &self.hops
    }

    /// Number of hops.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Whether the route has no hops.
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_millis(millis: u64) -> SimTime {
        SimTime::from_duration(Duration::from_millis(millis))
    }

    #[test]
    fn test_single_packet_delay() {
        // 1000 bytes at 100 KB/s takes 10ms, plus 5ms latency
        let queue = Queue::new(100_000, Duration::from_millis(5), 200_000, "link");
        let departure = queue.admit(SimTime::ZERO, 1000).unwrap();
        assert_eq!(departure, at_millis(15));
    }

    #[test]
    fn test_back_to_back_packets_serialize() {
        let queue = Queue::new(100_000, Duration::ZERO, 200_000, "link");
        let first = queue.admit(SimTime::ZERO, 1000).unwrap();
        let second = queue.admit(SimTime::ZERO, 1000).unwrap();
        assert_eq!(first, at_millis(10));
        assert_eq!(second, at_millis(20));
    }

    #[test]
    fn test_idle_link_starts_at_arrival() {
        let queue = Queue::new(100_000, Duration::ZERO, 200_000, "link");
        queue.admit(SimTime::ZERO, 1000).unwrap();
        let later = queue.admit(at_millis(100), 1000).unwrap();
        assert_eq!(later, at_millis(110));
    }

    #[test]
    fn test_full_buffer_drops() {
        let queue = Queue::new(1_000, Duration::ZERO, 2_500, "tiny");
        assert!(queue.admit(SimTime::ZERO, 1000).is_some());
        assert!(queue.admit(SimTime::ZERO, 1000).is_some());
        assert!(queue.admit(SimTime::ZERO, 1000).is_none());

        let stats = queue.stats();
        assert_eq!(stats.forwarded_packets, 2);
        assert_eq!(stats.forwarded_bytes, 2000);
        assert_eq!(stats.dropped_packets, 1);
    }

    #[test]
    fn test_unlimited_rate_only_adds_latency() {
        let queue = Queue::new(0, Duration::from_millis(7), 0, "wire");
        assert_eq!(queue.admit(SimTime::ZERO, 1 << 20), Some(at_millis(7)));
    }

    #[test]
    fn test_route_shares_queues() {
        let queue = Rc::new(Queue::new(1_000, Duration::ZERO, 10_000, "shared"));
        let a = Route::new().append(Rc::clone(&queue));
        let b = Route::new().append(Rc::clone(&queue));
        let joined = a.concat(b);

        assert_eq!(joined.len(), 2);
        assert!(Rc::ptr_eq(&joined.hops()[0], &joined.hops()[1]));
        assert!(Route::new().is_empty());
    }
}
