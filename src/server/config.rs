//! Server configuration surface.

use std::time::Duration;

use crate::frame::DEFAULT_RPC_PATH;

/// Retry timing for the accept loop after transient `accept()` failures.
///
/// The delay starts at `initial_delay`, doubles per consecutive failure,
/// and is capped at `max_delay`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Delay used for the first retry after an `accept()` failure.
    pub initial_delay: Duration,
    /// Maximum back-off delay once retries have increased exponentially.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp delays to sane bounds and ensure `initial_delay <= max_delay`.
    #[must_use]
    pub fn normalised(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }
}

/// Options recognised by [`RpcServer`](crate::server::RpcServer).
///
/// A zero duration disables the corresponding timeout. `timeout` is the
/// fallback for whichever of `read_timeout` / `write_timeout` is zero.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Fallback bound applied to both reads and writes.
    pub timeout: Duration,
    /// Bound on each header read; zero disables.
    pub read_timeout: Duration,
    /// Bound on each response write; zero disables.
    pub write_timeout: Duration,
    /// Maximum concurrently executing calls per connection; `None` leaves
    /// the spawn rate unbounded.
    pub max_inflight_calls: Option<usize>,
    /// URL path answering the HTTP CONNECT handshake.
    pub rpc_path: String,
    /// Accept-loop retry timing.
    pub backoff: BackoffConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            max_inflight_calls: None,
            rpc_path: DEFAULT_RPC_PATH.to_owned(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ServerConfig {
    pub(crate) fn effective_read_timeout(&self) -> Duration {
        if self.read_timeout.is_zero() {
            self.timeout
        } else {
            self.read_timeout
        }
    }

    pub(crate) fn effective_write_timeout(&self) -> Duration {
        if self.write_timeout.is_zero() {
            self.timeout
        } else {
            self.write_timeout
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_normalisation_orders_and_floors_delays() {
        let cfg = BackoffConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::ZERO,
        }
        .normalised();
        assert_eq!(cfg.initial_delay, Duration::from_millis(1));
        assert_eq!(cfg.max_delay, Duration::from_millis(5));
    }

    #[test]
    fn specific_timeouts_override_the_fallback() {
        let cfg = ServerConfig {
            timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(2),
            ..ServerConfig::default()
        };
        assert_eq!(cfg.effective_read_timeout(), Duration::from_secs(2));
        assert_eq!(cfg.effective_write_timeout(), Duration::from_secs(10));
    }
}
