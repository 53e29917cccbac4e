//! Firewall: per-IP connection and request limits.
//!
//! Two independent limiters over sharded concurrent maps:
//! - [`ConnectionLimiter`] bounds concurrent sockets per IP and tracks a
//!   daily total that resets when the UTC date advances.
//! - [`RequestLimiter`] admits at most `max_requests` packets per sliding
//!   window; an overflow locks the IP out for the lockout duration, during
//!   which rejected requests do not count toward the next window.
//!
//! Both expose `sweep()` to drop idle entries; the server drives sweeps on
//! a one-minute interval.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use tracing::debug;

use nalix_shared::config::ServerConfig;

struct ConnectionInfo {
    current: u32,
    last_connect_at: Instant,
    total_today: u32,
    day: NaiveDate,
}

/// Bounds concurrent connections per client IP.
pub struct ConnectionLimiter {
    max_per_ip: u32,
    inactivity: Duration,
    entries: DashMap<IpAddr, ConnectionInfo>,
}

impl ConnectionLimiter {
    pub fn new(max_per_ip: u32, inactivity: Duration) -> Self {
        ConnectionLimiter {
            max_per_ip,
            inactivity,
            entries: DashMap::new(),
        }
    }

    /// Atomically admits the connection if the IP is below its limit,
    /// stamping the connect time and advancing the daily total.
    pub fn is_connection_allowed(&self, ip: IpAddr) -> bool {
        let today = Utc::now().date_naive();
        let mut entry = self.entries.entry(ip).or_insert_with(|| ConnectionInfo {
            current: 0,
            last_connect_at: Instant::now(),
            total_today: 0,
            day: today,
        });
        if entry.day != today {
            entry.day = today;
            entry.total_today = 0;
        }
        if entry.current >= self.max_per_ip {
            return false;
        }
        entry.current += 1;
        entry.total_today += 1;
        entry.last_connect_at = Instant::now();
        true
    }

    /// Releases one slot; counts never go below zero.
    pub fn connection_closed(&self, ip: IpAddr) {
        if let Some(mut entry) = self.entries.get_mut(&ip) {
            entry.current = entry.current.saturating_sub(1);
        }
    }

    pub fn current(&self, ip: IpAddr) -> u32 {
        self.entries.get(&ip).map(|e| e.current).unwrap_or(0)
    }

    pub fn total_today(&self, ip: IpAddr) -> u32 {
        self.entries.get(&ip).map(|e| e.total_today).unwrap_or(0)
    }

    /// Drops entries with no live connections that have been idle past the
    /// inactivity threshold. Returns how many entries survived.
    pub fn sweep(&self) -> usize {
        self.entries
            .retain(|_, e| e.current > 0 || e.last_connect_at.elapsed() < self.inactivity);
        self.entries.len()
    }
}

struct RequestInfo {
    timestamps: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Sliding-window request limiter with lockout.
pub struct RequestLimiter {
    max_requests: usize,
    window: Duration,
    lockout: Duration,
    inactivity: Duration,
    entries: DashMap<IpAddr, RequestInfo>,
}

impl RequestLimiter {
    pub fn new(max_requests: usize, window: Duration, lockout: Duration, inactivity: Duration) -> Self {
        RequestLimiter {
            max_requests,
            window,
            lockout,
            inactivity,
            entries: DashMap::new(),
        }
    }

    /// Admits or rejects one request from `ip`.
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut entry = self.entries.entry(ip).or_insert_with(|| RequestInfo {
            timestamps: VecDeque::new(),
            blocked_until: None,
        });

        if let Some(until) = entry.blocked_until {
            if now < until {
                return false;
            }
            entry.blocked_until = None;
        }

        while entry
            .timestamps
            .front()
            .is_some_and(|&t| now.duration_since(t) >= self.window)
        {
            entry.timestamps.pop_front();
        }

        if entry.timestamps.len() >= self.max_requests {
            entry.blocked_until = Some(now + self.lockout);
            return false;
        }

        entry.timestamps.push_back(now);
        true
    }

    /// Drops entries that are neither locked out nor recently active.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        self.entries.retain(|_, e| {
            e.blocked_until.is_some_and(|until| now < until)
                || e.timestamps
                    .back()
                    .is_some_and(|&t| now.duration_since(t) < self.inactivity)
        });
        self.entries.len()
    }
}

/// Both limiters, built from the server configuration. The request
/// limiter is independently shared with the rate-limit middleware.
pub struct Firewall {
    pub connections: Arc<ConnectionLimiter>,
    pub requests: Arc<RequestLimiter>,
}

impl Firewall {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        let inactivity = Duration::from_secs(cfg.inactivity_threshold_secs);
        Firewall {
            connections: Arc::new(ConnectionLimiter::new(cfg.max_connections_per_ip, inactivity)),
            requests: Arc::new(RequestLimiter::new(
                cfg.max_allowed_requests,
                Duration::from_millis(cfg.time_window_ms),
                Duration::from_secs(cfg.lockout_seconds),
                inactivity,
            )),
        }
    }

    pub fn sweep(&self) {
        let connections = self.connections.sweep();
        let requests = self.requests.sweep();
        debug!(connections, requests, "firewall sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn connection_limiter_caps_per_ip() {
        let limiter = ConnectionLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.is_connection_allowed(ip(1)));
        assert!(limiter.is_connection_allowed(ip(1)));
        assert!(limiter.is_connection_allowed(ip(1)));
        assert!(!limiter.is_connection_allowed(ip(1)));
        // Other IPs are unaffected.
        assert!(limiter.is_connection_allowed(ip(2)));
        assert_eq!(limiter.current(ip(1)), 3);
        assert_eq!(limiter.total_today(ip(1)), 3);
    }

    #[test]
    fn closing_releases_slots_and_never_goes_negative() {
        let limiter = ConnectionLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.is_connection_allowed(ip(1)));
        limiter.connection_closed(ip(1));
        limiter.connection_closed(ip(1));
        limiter.connection_closed(ip(1));
        assert_eq!(limiter.current(ip(1)), 0);
        // Slots freed by closing are admissible again.
        assert!(limiter.is_connection_allowed(ip(1)));
        assert!(limiter.is_connection_allowed(ip(1)));
        assert!(!limiter.is_connection_allowed(ip(1)));
    }

    #[test]
    fn daily_total_accumulates_across_closes() {
        let limiter = ConnectionLimiter::new(10, Duration::from_secs(60));
        for _ in 0..4 {
            assert!(limiter.is_connection_allowed(ip(1)));
            limiter.connection_closed(ip(1));
        }
        assert_eq!(limiter.current(ip(1)), 0);
        assert_eq!(limiter.total_today(ip(1)), 4);
    }

    #[test]
    fn connection_sweep_keeps_live_entries() {
        let limiter = ConnectionLimiter::new(2, Duration::from_millis(0));
        assert!(limiter.is_connection_allowed(ip(1)));
        assert!(limiter.is_connection_allowed(ip(2)));
        limiter.connection_closed(ip(2));
        std::thread::sleep(Duration::from_millis(2));
        // ip(1) still has a live connection; idle ip(2) is dropped.
        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.current(ip(1)), 1);
    }

    #[test]
    fn request_limiter_enforces_window_capacity() {
        let limiter = RequestLimiter::new(
            5,
            Duration::from_secs(60),
            Duration::from_secs(60),
            Duration::from_secs(60),
        );
        let admitted = (0..10).filter(|_| limiter.is_allowed(ip(1))).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn lockout_rejects_without_counting() {
        let limiter = RequestLimiter::new(
            2,
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_secs(60),
        );
        assert!(limiter.is_allowed(ip(1)));
        assert!(limiter.is_allowed(ip(1)));
        // Overflow: trips the lockout.
        assert!(!limiter.is_allowed(ip(1)));
        // Rejected during lockout even after the window has rolled over.
        std::thread::sleep(Duration::from_millis(15));
        assert!(!limiter.is_allowed(ip(1)));
        // After the lockout expires the window restarts cleanly.
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.is_allowed(ip(1)));
        assert!(limiter.is_allowed(ip(1)));
    }

    #[test]
    fn window_rollover_admits_again_without_lockout() {
        let limiter = RequestLimiter::new(
            2,
            Duration::from_millis(20),
            Duration::from_millis(100),
            Duration::from_secs(60),
        );
        assert!(limiter.is_allowed(ip(1)));
        assert!(limiter.is_allowed(ip(1)));
        // Stay below the trip point and let the window slide.
        std::thread::sleep(Duration::from_millis(25));
        assert!(limiter.is_allowed(ip(1)));
    }

    #[test]
    fn request_sweep_drops_idle_keeps_locked() {
        let limiter = RequestLimiter::new(
            1,
            Duration::from_millis(5),
            Duration::from_secs(60),
            Duration::from_millis(0),
        );
        assert!(limiter.is_allowed(ip(1)));
        assert!(limiter.is_allowed(ip(2)));
        assert!(!limiter.is_allowed(ip(2))); // trips lockout for ip(2)
        std::thread::sleep(Duration::from_millis(2));
        // ip(1) is idle (zero inactivity threshold); ip(2) is locked out.
        assert_eq!(limiter.sweep(), 1);
    }

    #[test]
    fn firewall_from_config_uses_limits() {
        let cfg = ServerConfig {
            max_connections_per_ip: 1,
            ..ServerConfig::default()
        };
        let firewall = Firewall::from_config(&cfg);
        assert!(firewall.connections.is_connection_allowed(ip(9)));
        assert!(!firewall.connections.is_connection_allowed(ip(9)));
        firewall.sweep();
    }
}
