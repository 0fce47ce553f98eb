//! Synchronization primitives.
//!
//! The only cross-session synchronization point is
//! [`SessionHandle::join`](super::session::SessionHandle::join). Everything
//! here blocks the calling thread alone.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use crate::errors::{HarnessError, HarnessResult};

/// Suspend the calling thread for `duration`.
pub fn sleep(duration: Duration) {
    std::thread::sleep(duration);
}

/// Exponential backoff: 10ms, doubling, capped at 500ms.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
        }
    }

    /// Next delay, never sleeping past `deadline`.
    pub fn next_delay(&mut self, deadline: Instant) -> Duration {
        let delay = self
            .delay
            .min(deadline.saturating_duration_since(Instant::now()));
        self.delay = (self.delay * 2).min(self.max_delay);
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `condition` every `interval` until it holds or `timeout` passes.
pub fn wait_for<F>(timeout: Duration, interval: Duration, mut condition: F) -> HarnessResult<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(HarnessError::Timeout(timeout));
        }
        std::thread::sleep(interval);
    }
}

/// True when something accepts TCP connections on `host:port`.
pub fn port_accepts(host: &str, port: u16) -> bool {
    resolve(host, port)
        .map(|addr| TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok())
        .unwrap_or(false)
}

fn resolve(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port).to_socket_addrs().ok()?.next()
}

/// Wait with backoff until `host:port` accepts a connection.
///
/// `check` runs before every poll; an error from it aborts the wait, which
/// is how callers notice a process that exited during startup. Returns the
/// time it took, or `None` on timeout.
pub fn wait_for_port<F>(
    host: &str,
    port: u16,
    max_wait: Duration,
    mut check: F,
) -> HarnessResult<Option<Duration>>
where
    F: FnMut() -> HarnessResult<()>,
{
    let start = Instant::now();
    let deadline = start + max_wait;
    let mut backoff = Backoff::new();

    loop {
        check()?;
        if port_accepts(host, port) {
            return Ok(Some(start.elapsed()));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(backoff.next_delay(deadline));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let deadline = Instant::now() + Duration::from_secs(60);
        let mut backoff = Backoff::new();
        let delays: Vec<_> = (0..8).map(|_| backoff.next_delay(deadline)).collect();
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[1], Duration::from_millis(20));
        assert_eq!(delays[5], Duration::from_millis(320));
        assert_eq!(delays[6], Duration::from_millis(500));
        assert_eq!(delays[7], Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_respects_deadline() {
        let deadline = Instant::now() + Duration::from_millis(5);
        let mut backoff = Backoff::new();
        assert!(backoff.next_delay(deadline) <= Duration::from_millis(5));
    }

    #[test]
    fn test_sleep_blocks_for_duration() {
        let start = Instant::now();
        sleep(Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_for_condition_and_timeout() {
        let mut calls = 0;
        wait_for(Duration::from_secs(1), Duration::from_millis(1), || {
            calls += 1;
            calls >= 3
        })
        .unwrap();
        assert_eq!(calls, 3);

        let timeout = Duration::from_millis(20);
        let err = wait_for(timeout, Duration::from_millis(5), || false).unwrap_err();
        assert!(matches!(err, HarnessError::Timeout(_)));
    }

    #[test]
    fn test_wait_for_port_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let waited = wait_for_port("127.0.0.1", port, Duration::from_secs(2), || Ok(())).unwrap();
        assert!(waited.is_some());
    }

    #[test]
    fn test_wait_for_port_times_out() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let waited =
            wait_for_port("127.0.0.1", port, Duration::from_millis(100), || Ok(())).unwrap();
        assert!(waited.is_none());
    }

    #[test]
    fn test_wait_for_port_check_aborts() {
        let err = wait_for_port("127.0.0.1", 1, Duration::from_secs(5), || {
            Err(HarnessError::ProcessStartFailed("exited".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, HarnessError::ProcessStartFailed(_)));
    }
}
