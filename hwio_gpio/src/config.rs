use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::warn;

pub const DEFAULT_CONSUMER: &str = "hwio";
pub const DEFAULT_EDGE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PULL_DEVICE: &str = "/dev/gpiomem";

const ENV_CONSUMER: &str = "HWIO_GPIO_CONSUMER";
const ENV_EDGE_TIMEOUT_MS: &str = "HWIO_GPIO_EDGE_TIMEOUT_MS";
const ENV_PULL_DEVICE: &str = "HWIO_GPIO_PULL_DEVICE";

/// Settings of one [`GpioPinManager`](crate::GpioPinManager).
///
/// # Examples
/// ```rust
/// # use hwio_gpio::ManagerConfig;
/// # use std::time::Duration;
/// let config = ManagerConfig::default()
///     .with_consumer("relay-board")
///     .with_edge_timeout(Duration::from_millis(500));
/// assert_eq!(config.consumer(), "relay-board");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    consumer: String,
    edge_timeout: Duration,
    pull_device: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            consumer: DEFAULT_CONSUMER.to_owned(),
            edge_timeout: DEFAULT_EDGE_TIMEOUT,
            pull_device: PathBuf::from(DEFAULT_PULL_DEVICE),
        }
    }
}

impl ManagerConfig {
    /// Defaults overridden by `HWIO_GPIO_CONSUMER`, `HWIO_GPIO_EDGE_TIMEOUT_MS`
    /// and `HWIO_GPIO_PULL_DEVICE`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(consumer) = lookup(ENV_CONSUMER) {
            if consumer.is_empty() {
                warn!("{ENV_CONSUMER} is empty, keeping {:?}", config.consumer);
            } else {
                config.consumer = consumer;
            }
        }

        if let Some(raw) = lookup(ENV_EDGE_TIMEOUT_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => config.edge_timeout = Duration::from_millis(ms),
                _ => warn!(value = %raw, "Ignoring invalid {ENV_EDGE_TIMEOUT_MS}"),
            }
        }

        if let Some(path) = lookup(ENV_PULL_DEVICE) {
            if path.is_empty() {
                warn!("{ENV_PULL_DEVICE} is empty, keeping the default");
            } else {
                config.pull_device = PathBuf::from(path);
            }
        }

        config
    }

    /// Consumer label reported to the kernel for every requested line.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Upper bound of one edge-monitor wait. Zero is raised to one millisecond.
    pub fn with_edge_timeout(mut self, timeout: Duration) -> Self {
        self.edge_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn with_pull_device(mut self, path: impl Into<PathBuf>) -> Self {
        self.pull_device = path.into();
        self
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn edge_timeout(&self) -> Duration {
        self.edge_timeout
    }

    pub fn pull_device(&self) -> &Path {
        &self.pull_device
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.consumer(), "hwio");
        assert_eq!(config.edge_timeout(), Duration::from_secs(5));
        assert_eq!(config.pull_device(), Path::new("/dev/gpiomem"));
    }

    #[test]
    fn environment_overrides() {
        let config = ManagerConfig::from_lookup(lookup(&[
            ("HWIO_GPIO_CONSUMER", "keypad"),
            ("HWIO_GPIO_EDGE_TIMEOUT_MS", "250"),
            ("HWIO_GPIO_PULL_DEVICE", "/tmp/regs"),
        ]));
        assert_eq!(config.consumer(), "keypad");
        assert_eq!(config.edge_timeout(), Duration::from_millis(250));
        assert_eq!(config.pull_device(), Path::new("/tmp/regs"));
    }

    #[test]
    fn invalid_values_are_ignored() {
        let config = ManagerConfig::from_lookup(lookup(&[
            ("HWIO_GPIO_CONSUMER", ""),
            ("HWIO_GPIO_EDGE_TIMEOUT_MS", "soon"),
        ]));
        assert_eq!(config, ManagerConfig::default());

        let config = ManagerConfig::from_lookup(lookup(&[("HWIO_GPIO_EDGE_TIMEOUT_MS", "0")]));
        assert_eq!(config.edge_timeout(), DEFAULT_EDGE_TIMEOUT);
    }

    #[test]
    fn zero_timeout_is_clamped() {
        let config = ManagerConfig::default().with_edge_timeout(Duration::ZERO);
        assert_eq!(config.edge_timeout(), Duration::from_millis(1));
    }
}
