use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Recipient that always receives relayed messages, outside the whitelist.
pub const DEFAULT_OPERATOR_ID: i64 = 7678650605;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub delivery: DeliveryConfig,
    #[serde(default = "default_poller_config")]
    pub poller: PollerConfig,
    #[serde(default = "default_relay_config")]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Opaque credentials handed to the source client (a bot token for Telegram).
    pub credentials: String,
    pub channel_id: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    pub token: String,
    #[serde(default)]
    pub whitelist_ids: Vec<i64>,
    #[serde(default = "default_operator_id")]
    pub operator_id: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_limit")]
    pub poll_limit: usize,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_operator_id() -> i64 {
    DEFAULT_OPERATOR_ID
}

fn default_poll_interval_ms() -> u64 {
    1500
}

fn default_poll_limit() -> usize {
    10
}

fn default_monitor_interval_secs() -> u64 {
    10
}

fn default_max_concurrent() -> usize {
    10
}

fn default_poller_config() -> PollerConfig {
    PollerConfig {
        poll_interval_ms: default_poll_interval_ms(),
        poll_limit: default_poll_limit(),
        monitor_interval_secs: default_monitor_interval_secs(),
    }
}

fn default_relay_config() -> RelayConfig {
    RelayConfig {
        max_concurrent: default_max_concurrent(),
    }
}

/// Parse a comma-separated list of integer ids. Blank segments are skipped,
/// so an empty string yields an empty list.
pub fn parse_id_list(raw: &str) -> Result<Vec<i64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>()
                .with_context(|| format!("Invalid recipient id '{}'", s))
        })
        .collect()
}

/// Drop repeated ids, keeping the first occurrence so load order survives.
fn dedup_preserving_order(ids: &mut Vec<i64>) {
    let mut seen = std::collections::HashSet::new();
    ids.retain(|id| seen.insert(*id));
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.finish()?;
        Ok(config)
    }

    /// Build the config from `SOURCE_CREDENTIALS`, `CHANNEL_ID`, `DELIVERY_TOKEN`,
    /// `WHITELIST_IDS` and the optional `OPERATOR_ID`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| lookup(key).with_context(|| format!("{} is not set", key));

        let channel_id = require("CHANNEL_ID")?;
        let channel_id = channel_id
            .trim()
            .parse::<i64>()
            .with_context(|| format!("CHANNEL_ID is not an integer: {}", channel_id))?;

        let whitelist_ids = parse_id_list(&lookup("WHITELIST_IDS").unwrap_or_default())
            .context("Failed to parse WHITELIST_IDS")?;

        let operator_id = match lookup("OPERATOR_ID") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .with_context(|| format!("OPERATOR_ID is not an integer: {}", raw))?,
            None => DEFAULT_OPERATOR_ID,
        };

        let mut config = Config {
            source: SourceConfig {
                credentials: require("SOURCE_CREDENTIALS")?,
                channel_id,
            },
            delivery: DeliveryConfig {
                token: require("DELIVERY_TOKEN")?,
                whitelist_ids,
                operator_id,
            },
            poller: default_poller_config(),
            relay: default_relay_config(),
        };
        config.finish()?;
        Ok(config)
    }

    fn finish(&mut self) -> Result<()> {
        dedup_preserving_order(&mut self.delivery.whitelist_ids);

        if self.source.credentials.trim().is_empty() {
            anyhow::bail!("source credentials must not be empty");
        }
        if self.delivery.token.trim().is_empty() {
            anyhow::bail!("delivery token must not be empty");
        }
        if self.poller.poll_limit == 0 {
            anyhow::bail!("poller.poll_limit must be at least 1");
        }
        if self.poller.poll_interval_ms == 0 {
            anyhow::bail!("poller.poll_interval_ms must be at least 1");
        }
        if self.poller.monitor_interval_secs == 0 {
            anyhow::bail!("poller.monitor_interval_secs must be at least 1");
        }
        if self.relay.max_concurrent == 0 {
            anyhow::bail!("relay.max_concurrent must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
        [source]
        credentials = "111:source"
        channel_id = -1001234567890

        [delivery]
        token = "222:delivery"
        whitelist_ids = [3, 1, 2, 1]
    "#;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_toml_defaults_and_dedup() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.source.channel_id, -1001234567890);
        assert_eq!(config.delivery.whitelist_ids, vec![3, 1, 2]);
        assert_eq!(config.delivery.operator_id, DEFAULT_OPERATOR_ID);
        assert_eq!(config.poller.poll_interval_ms, 1500);
        assert_eq!(config.poller.poll_limit, 10);
        assert_eq!(config.poller.monitor_interval_secs, 10);
        assert_eq!(config.relay.max_concurrent, 10);
    }

    #[test]
    fn test_toml_rejects_zero_limit() {
        let content = format!("{}\n[poller]\npoll_limit = 0\n", MINIMAL);
        let err = Config::from_toml_str(&content).unwrap_err();
        assert!(err.to_string().contains("poll_limit"));
    }

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list("").unwrap(), Vec::<i64>::new());
        assert_eq!(parse_id_list(" 1, 2 ,,3 ").unwrap(), vec![1, 2, 3]);
        assert!(parse_id_list("1,abc").is_err());
    }

    #[test]
    fn test_from_env() {
        let vars = env(&[
            ("SOURCE_CREDENTIALS", "111:source"),
            ("CHANNEL_ID", "-100500"),
            ("DELIVERY_TOKEN", "222:delivery"),
            ("WHITELIST_IDS", "10,20,10"),
            ("OPERATOR_ID", "42"),
        ]);
        let config = Config::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.source.channel_id, -100500);
        assert_eq!(config.delivery.whitelist_ids, vec![10, 20]);
        assert_eq!(config.delivery.operator_id, 42);
    }

    #[test]
    fn test_from_env_missing_whitelist_is_empty() {
        let vars = env(&[
            ("SOURCE_CREDENTIALS", "111:source"),
            ("CHANNEL_ID", "7"),
            ("DELIVERY_TOKEN", "222:delivery"),
        ]);
        let config = Config::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert!(config.delivery.whitelist_ids.is_empty());
        assert_eq!(config.delivery.operator_id, DEFAULT_OPERATOR_ID);
    }

    #[test]
    fn test_from_env_requires_channel_id() {
        let vars = env(&[
            ("SOURCE_CREDENTIALS", "111:source"),
            ("DELIVERY_TOKEN", "222:delivery"),
        ]);
        let err = Config::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains("CHANNEL_ID"));
    }
}
