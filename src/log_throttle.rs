use std::net::IpAddr;
use std::time::{Duration, Instant};
use rustc_hash::FxHashMap;

/// Limits how often a warning is logged per peer, so that a misbehaving (or merely misconfigured)
///  peer that reconnects in a tight loop does not flood the log.
pub struct LogThrottle {
    interval: Duration,
    last_logged: FxHashMap<IpAddr, Instant>,
}

impl LogThrottle {
    /// entries beyond this number trigger cleanup of expired entries
    const CLEANUP_THRESHOLD: usize = 1024;

    pub fn new(interval: Duration) -> LogThrottle {
        LogThrottle {
            interval,
            last_logged: FxHashMap::default(),
        }
    }

    /// Returns `true` if a message for `peer` should be logged now, recording the time if so
    pub fn should_log(&mut self, peer: IpAddr, now: Instant) -> bool {
        if let Some(prev) = self.last_logged.get(&peer) {
            if now.saturating_duration_since(*prev) < self.interval {
                return false;
            }
        }

        if self.last_logged.len() >= Self::CLEANUP_THRESHOLD {
            let interval = self.interval;
            self.last_logged.retain(|_, t| now.saturating_duration_since(*t) < interval);
        }

        self.last_logged.insert(peer, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_once_per_interval() {
        let mut throttle = LogThrottle::new(Duration::from_secs(10));
        let peer = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let start = Instant::now();

        assert!(throttle.should_log(peer, start));
        assert!(!throttle.should_log(peer, start + Duration::from_secs(1)));
        assert!(!throttle.should_log(peer, start + Duration::from_millis(9_999)));
        assert!(throttle.should_log(peer, start + Duration::from_secs(10)));
        assert!(!throttle.should_log(peer, start + Duration::from_secs(11)));
    }

    #[test]
    fn test_per_peer() {
        let mut throttle = LogThrottle::new(Duration::from_secs(10));
        let start = Instant::now();

        assert!(throttle.should_log(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), start));
        assert!(throttle.should_log(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), start));
        assert!(!throttle.should_log(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), start));
    }

    #[test]
    fn test_cleanup() {
        let mut throttle = LogThrottle::new(Duration::from_secs(1));
        let start = Instant::now();

        for i in 0..LogThrottle::CLEANUP_THRESHOLD as u32 {
            assert!(throttle.should_log(IpAddr::V4(Ipv4Addr::from(i)), start));
        }
        assert_eq!(throttle.last_logged.len(), LogThrottle::CLEANUP_THRESHOLD);

        assert!(throttle.should_log(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)), start + Duration::from_secs(2)));
        assert_eq!(throttle.last_logged.len(), 1);
    }
}
