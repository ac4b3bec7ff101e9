use std::collections::HashMap;
use std::net::SocketAddrV4;

use parking_lot::Mutex;
use tokio::time::Instant;

/// [`DeadlineSet`] maps member endpoints to the instant at which something has
/// to happen to them. The membership table keeps three of these: members we
/// await an ACK from, dead members cooling off, and members scheduled for pruning.
///
/// Deadlines are polled by the sweeper, one pass per protocol period.
#[derive(Debug, Default)]
pub(crate) struct DeadlineSet {
    deadlines: Mutex<HashMap<SocketAddrV4, Instant>>,
}

impl DeadlineSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Schedules `endpoint` unless it already has a deadline. Returns whether it
    /// was inserted; an existing deadline is never pushed back.
    pub(crate) fn insert_if_absent(&self, endpoint: SocketAddrV4, deadline: Instant) -> bool {
        let mut deadlines = self.deadlines.lock();
        if deadlines.contains_key(&endpoint) {
            return false;
        }
        deadlines.insert(endpoint, deadline);
        true
    }

    pub(crate) fn remove(&self, endpoint: &SocketAddrV4) -> bool {
        self.deadlines.lock().remove(endpoint).is_some()
    }

    pub(crate) fn contains(&self, endpoint: &SocketAddrV4) -> bool {
        self.deadlines.lock().contains_key(endpoint)
    }

    pub(crate) fn endpoints(&self) -> Vec<SocketAddrV4> {
        self.deadlines.lock().keys().copied().collect()
    }

    /// Removes and returns every endpoint whose deadline is at or before `now`.
    pub(crate) fn drain_expired(&self, now: Instant) -> Vec<SocketAddrV4> {
        let mut expired = Vec::new();
        self.deadlines.lock().retain(|endpoint, deadline| {
            if *deadline <= now {
                expired.push(*endpoint);
                false
            } else {
                true
            }
        });
        expired
    }

    /// Like [`DeadlineSet::drain_expired`], but calls `on_expired` for each
    /// expired endpoint while the set is still locked.
    pub(crate) fn drain_expired_with<F>(&self, now: Instant, mut on_expired: F)
    where
        F: FnMut(SocketAddrV4),
    {
        self.deadlines.lock().retain(|endpoint, deadline| {
            if *deadline <= now {
                on_expired(*endpoint);
                false
            } else {
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn endpoint(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    #[test]
    fn test_insert_if_absent_keeps_first_deadline() {
        let set = DeadlineSet::new();
        let now = Instant::now();

        assert!(set.insert_if_absent(endpoint(1), now + Duration::from_secs(1)));
        assert!(!set.insert_if_absent(endpoint(1), now + Duration::from_secs(60)));
        assert_eq!(set.endpoints(), vec![endpoint(1)]);

        // The first deadline still applies.
        assert_eq!(set.drain_expired(now + Duration::from_secs(2)), vec![endpoint(1)]);
        assert!(!set.contains(&endpoint(1)));
    }

    #[test]
    fn test_drain_expired_leaves_pending_deadlines() {
        let set = DeadlineSet::new();
        let now = Instant::now();
        set.insert_if_absent(endpoint(1), now);
        set.insert_if_absent(endpoint(2), now + Duration::from_secs(10));

        let expired = set.drain_expired(now);
        assert_eq!(expired, vec![endpoint(1)]);
        assert!(set.contains(&endpoint(2)));
        assert!(set.drain_expired(now).is_empty());

        assert!(set.remove(&endpoint(2)));
        assert!(!set.remove(&endpoint(2)));
        assert!(set.endpoints().is_empty());
    }

    #[test]
    fn test_drain_expired_with_visits_each_expired_endpoint() {
        let set = DeadlineSet::new();
        let now = Instant::now();
        for port in 1..=3 {
            set.insert_if_absent(endpoint(port), now);
        }

        let mut visited = Vec::new();
        set.drain_expired_with(now, |endpoint| visited.push(endpoint.port()));
        visited.sort();
        assert_eq!(visited, vec![1, 2, 3]);
        assert!(set.endpoints().is_empty());
    }
}
