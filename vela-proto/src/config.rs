use std::time::Duration;

use thiserror::Error;

/// Parameters governing device liveness, command retries, and connection upkeep
///
/// Default values are tuned for the announcement and heartbeat cadence of shipping
/// sensor firmware on a local network segment. Deployments with lossier links can
/// raise the retry budget or switch `backoff_factor` to exponential spacing without
/// affecting wire compatibility.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) announce_interval: Duration,
    pub(crate) lost_after_intervals: u32,

    pub(crate) default_command_timeout: Duration,
    pub(crate) command_retries: u32,
    pub(crate) backoff_factor: u32,

    pub(crate) handshake_attempts: u32,
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_miss_limit: u32,

    pub(crate) data_liveness_window: Duration,
    pub(crate) prune_grace: Duration,
    pub(crate) auto_connect: bool,
}

impl Config {
    /// Period at which devices are expected to broadcast announcements
    ///
    /// Also the cadence of the discovery sweep that ages out silent devices. The
    /// device firmware fixes the true broadcast period; this value only has to be
    /// roughly right for loss detection to behave.
    pub fn announce_interval(&mut self, value: Duration) -> &mut Self {
        self.announce_interval = value;
        self
    }

    /// Number of missed announcement intervals after which a device is declared lost
    pub fn lost_after_intervals(&mut self, value: u32) -> &mut Self {
        self.lost_after_intervals = value;
        self
    }

    /// Time to wait for a command acknowledgement before retransmitting
    ///
    /// Used when the caller does not supply a per-command timeout.
    pub fn default_command_timeout(&mut self, value: Duration) -> &mut Self {
        self.default_command_timeout = value;
        self
    }

    /// Number of retransmissions after the initial send before a command fails
    ///
    /// A command makes `command_retries + 1` attempts in total, then completes with
    /// a timeout error once the final attempt's deadline passes.
    pub fn command_retries(&mut self, value: u32) -> &mut Self {
        self.command_retries = value;
        self
    }

    /// Multiplier applied to the retransmission interval on each successive attempt
    ///
    /// `1` retransmits at a constant interval, matching device firmware
    /// expectations. `2` doubles the wait per attempt; the exponent is capped so
    /// large retry budgets cannot overflow the deadline arithmetic. Must be nonzero.
    ///
    /// ```
    /// let mut config = vela_proto::Config::default();
    /// config.command_retries(5).backoff_factor(2);
    /// ```
    pub fn backoff_factor(&mut self, value: u32) -> &mut Self {
        self.backoff_factor = value;
        self
    }

    /// Number of complete handshake command cycles to run before giving up on a device
    ///
    /// Each cycle is a full command attempt sequence (initial send plus retries).
    /// Must be nonzero.
    pub fn handshake_attempts(&mut self, value: u32) -> &mut Self {
        self.handshake_attempts = value;
        self
    }

    /// Period at which keepalive commands probe a connected device's command lane
    ///
    /// `None` disables keepalive probing entirely, leaving discovery broadcasts and
    /// the point stream as the only liveness signals.
    pub fn keepalive_interval(&mut self, value: Option<Duration>) -> &mut Self {
        self.keepalive_interval = value;
        self
    }

    /// Consecutive unacknowledged keepalives after which the device is declared lost
    ///
    /// Must be nonzero.
    pub fn keepalive_miss_limit(&mut self, value: u32) -> &mut Self {
        self.keepalive_miss_limit = value;
        self
    }

    /// Longest gap in valid point stream frames tolerated while sampling
    ///
    /// A sampling device that stays silent for this long is disconnected, even if it
    /// keeps announcing itself; a stalled stream and a vanished device are distinct
    /// failures.
    pub fn data_liveness_window(&mut self, value: Duration) -> &mut Self {
        self.data_liveness_window = value;
        self
    }

    /// How long a disconnected device's registry entry lingers before removal
    ///
    /// Re-discovery within the grace period reuses the existing handle.
    pub fn prune_grace(&mut self, value: Duration) -> &mut Self {
        self.prune_grace = value;
        self
    }

    /// Whether newly discovered devices are handshaken automatically
    ///
    /// When disabled, devices stay in the `Discovered` state until the application
    /// connects them explicitly.
    pub fn auto_connect(&mut self, value: bool) -> &mut Self {
        self.auto_connect = value;
        self
    }

    /// Whether newly discovered devices are handshaken automatically
    pub fn get_auto_connect(&self) -> bool {
        self.auto_connect
    }

    /// Announcement age beyond which a device counts as lost
    pub(crate) fn lost_after(&self) -> Duration {
        self.announce_interval * self.lost_after_intervals
    }

    /// Check that all parameters are within supported bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.announce_interval.is_zero()
            || self.default_command_timeout.is_zero()
            || self.data_liveness_window.is_zero()
            || self.keepalive_interval.is_some_and(|x| x.is_zero())
        {
            return Err(ConfigError::OutOfBounds);
        }
        if self.lost_after_intervals == 0
            || self.backoff_factor == 0
            || self.handshake_attempts == 0
            || self.keepalive_miss_limit == 0
        {
            return Err(ConfigError::OutOfBounds);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(1),
            lost_after_intervals: 3,

            default_command_timeout: Duration::from_millis(500),
            command_retries: 2,
            backoff_factor: 1,

            handshake_attempts: 3,
            keepalive_interval: Some(Duration::from_secs(1)),
            keepalive_miss_limit: 3,

            data_liveness_window: Duration::from_secs(2),
            prune_grace: Duration::from_secs(5),
            auto_connect: true,
        }
    }
}

/// Errors in configuration parameters
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}
