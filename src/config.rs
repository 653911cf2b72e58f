//! Client configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default command port of the server.
pub const DEFAULT_PORT: u16 = 60031;

/// Default telemetry multicast group.
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 2, 100);

/// Default telemetry multicast port.
pub const DEFAULT_TELEMETRY_PORT: u16 = 60031;

/// Default receive buffer size for both sockets.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 212_992;

/// Default time to wait for the first response to a command.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default heartbeat/watchdog period.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_millis(100);

/// Default number of silent watchdog ticks before the link is declared dead.
pub const DEFAULT_WATCHDOG_THRESHOLD: u32 = 10;

/// Default maximum heartbeat age for ownership-gated commands.
pub const DEFAULT_HEARTBEAT_FRESHNESS: Duration = Duration::from_millis(500);

/// Default capacity of the telemetry queue between receive loop and unpacker.
pub const DEFAULT_TELEMETRY_QUEUE: usize = 256;

/// Hand telemetry components to extract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct HandComponents {
    /// Positions, speeds, currents and task info.
    pub ego: bool,
    /// Finger forces and stiffness.
    pub force: bool,
    /// IMU acceleration and angular rate.
    pub imu: bool,
    /// Finger contact flags.
    pub contact: bool,
}

impl HandComponents {
    /// All components.
    pub const ALL: Self = Self {
        ego: true,
        force: true,
        imu: true,
        contact: true,
    };
}

impl Default for HandComponents {
    fn default() -> Self {
        Self::ALL
    }
}

/// Which telemetry categories are enabled and how they are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Hand telemetry, with its component set.
    pub hand: Option<HandComponents>,
    /// Tactile sensor telemetry.
    pub tactile: bool,
    /// Decode payloads into typed fields; when false the raw JSON is kept.
    pub auto_extract: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            hand: Some(HandComponents::ALL),
            tactile: false,
            auto_extract: true,
        }
    }
}

/// Configuration for a DexHand session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server command port.
    pub port: u16,
    /// Telemetry multicast group.
    pub multicast_group: Ipv4Addr,
    /// Telemetry multicast port.
    pub telemetry_port: u16,
    /// Socket receive buffer size in bytes.
    pub recv_buffer_size: usize,
    /// Ack-phase timeout for every command.
    pub ack_timeout: Duration,
    /// Heartbeat/watchdog period.
    pub heartbeat_period: Duration,
    /// Silent ticks before a liveness failure.
    pub watchdog_threshold: u32,
    /// Maximum heartbeat age for ownership-gated commands.
    pub heartbeat_freshness: Duration,
    /// Telemetry queue capacity (oldest frames are dropped when full).
    pub telemetry_queue: usize,
    /// Exit the process once an emergency abort finishes.
    pub exit_process_on_abort: bool,
    /// Demote client-originated info lines to debug.
    pub ignore_own_info: bool,
    /// Telemetry categories.
    pub telemetry: TelemetryConfig,
}

impl ClientConfig {
    /// Creates a configuration with default settings for the given host.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            multicast_group: DEFAULT_MULTICAST_GROUP,
            telemetry_port: DEFAULT_TELEMETRY_PORT,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            watchdog_threshold: DEFAULT_WATCHDOG_THRESHOLD,
            heartbeat_freshness: DEFAULT_HEARTBEAT_FRESHNESS,
            telemetry_queue: DEFAULT_TELEMETRY_QUEUE,
            exit_process_on_abort: false,
            ignore_own_info: false,
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Sets the server command port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the telemetry multicast group and port.
    #[must_use]
    pub const fn multicast(mut self, group: Ipv4Addr, port: u16) -> Self {
        self.multicast_group = group;
        self.telemetry_port = port;
        self
    }

    /// Sets the socket receive buffer size.
    #[must_use]
    pub const fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Sets the ack timeout.
    #[must_use]
    pub const fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the heartbeat period and watchdog threshold.
    #[must_use]
    pub const fn heartbeat(mut self, period: Duration, watchdog_threshold: u32) -> Self {
        self.heartbeat_period = period;
        self.watchdog_threshold = watchdog_threshold;
        self
    }

    /// Sets the maximum heartbeat age for ownership-gated commands.
    #[must_use]
    pub const fn heartbeat_freshness(mut self, freshness: Duration) -> Self {
        self.heartbeat_freshness = freshness;
        self
    }

    /// Sets the telemetry queue capacity.
    #[must_use]
    pub const fn telemetry_queue(mut self, capacity: usize) -> Self {
        self.telemetry_queue = capacity;
        self
    }

    /// Exits the process after an emergency abort.
    #[must_use]
    pub const fn exit_process_on_abort(mut self, exit: bool) -> Self {
        self.exit_process_on_abort = exit;
        self
    }

    /// Demotes client-originated info lines to debug.
    #[must_use]
    pub const fn ignore_own_info(mut self, ignore: bool) -> Self {
        self.ignore_own_info = ignore;
        self
    }

    /// Sets the telemetry categories.
    #[must_use]
    pub const fn telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Checks the configuration for values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidConfig {
                reason: reason.to_owned(),
            })
        };

        if self.host.is_empty() {
            return invalid("host is empty");
        }
        if !self.multicast_group.is_multicast() {
            return Err(Error::InvalidConfig {
                reason: format!("{} is not in 224.0.0.0/4", self.multicast_group),
            });
        }
        if self.heartbeat_period.is_zero() {
            return invalid("heartbeat period is zero");
        }
        if self.watchdog_threshold == 0 {
            return invalid("watchdog threshold is zero");
        }
        if self.ack_timeout.is_zero() {
            return invalid("ack timeout is zero");
        }
        if self.telemetry_queue == 0 {
            return invalid("telemetry queue capacity is zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::new("192.168.2.100");
        assert_eq!(config.host, "192.168.2.100");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.multicast_group, DEFAULT_MULTICAST_GROUP);
        assert_eq!(config.ack_timeout, Duration::from_secs(1));
        assert_eq!(config.watchdog_threshold, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_client_config_builder() {
        let config = ClientConfig::new("localhost")
            .port(7000)
            .ack_timeout(Duration::from_millis(250))
            .heartbeat(Duration::from_millis(50), 4)
            .telemetry_queue(8);
        assert_eq!(config.port, 7000);
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.heartbeat_period, Duration::from_millis(50));
        assert_eq!(config.watchdog_threshold, 4);
        assert_eq!(config.telemetry_queue, 8);
    }

    #[test]
    fn test_validate_rejects_unicast_group() {
        let config =
            ClientConfig::new("localhost").multicast(Ipv4Addr::new(192, 168, 1, 1), 60031);
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = ClientConfig::new("localhost").heartbeat(Duration::from_millis(100), 0);
        assert!(config.validate().is_err());
    }
}
