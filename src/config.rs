use std::time::Duration;

use envconfig::Envconfig;

use crate::consumer_loop::LoopSettings;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "127.0.0.1:9092")]
    pub kafka_hosts: String,

    /// Comma-separated list of topics to subscribe to.
    #[envconfig(default = "test-topic")]
    pub kafka_topics: String,

    #[envconfig(default = "batch-consumer-group")]
    pub kafka_consumer_group: String,

    /// Per-instance client ids are `{prefix}-{index}`.
    #[envconfig(default = "worker")]
    pub client_id_prefix: String,

    /// Consumer instances spawned by the binary, each with its own client,
    /// tracker and coordinator.
    #[envconfig(default = "3")]
    pub consumer_count: usize,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    /// Where to start on a partition the group has never committed:
    /// "earliest" or "latest".
    #[envconfig(default = "earliest")]
    pub auto_offset_reset: String,

    #[envconfig(default = "1048576")]
    pub max_partition_fetch_bytes: u32,

    /// Upper bound on records returned by one fetch.
    #[envconfig(default = "500")]
    pub fetch_max_records: usize,

    // Loop timing
    #[envconfig(default = "1000")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "500")]
    pub idle_backoff_ms: u64,

    /// How long to wait on an in-flight batch between liveness probes.
    /// Must stay well under MAX_POLL_INTERVAL_MS.
    #[envconfig(default = "3000")]
    pub completion_wait_ms: u64,

    #[envconfig(default = "5000")]
    pub shutdown_timeout_ms: u64,

    /// Simulated per-record downstream latency in the demo handler.
    #[envconfig(default = "100")]
    pub process_delay_ms: u64,

    // Group liveness tuning
    #[envconfig(default = "60000")]
    pub session_timeout_ms: u32,

    #[envconfig(default = "5000")]
    pub heartbeat_interval_ms: u32,

    #[envconfig(default = "300000")]
    pub max_poll_interval_ms: u32,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Subscribed topics, split from the comma-separated env value.
    pub fn topics(&self) -> Vec<String> {
        self.kafka_topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect()
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn completion_wait(&self) -> Duration {
        Duration::from_millis(self.completion_wait_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn process_delay(&self) -> Duration {
        Duration::from_millis(self.process_delay_ms)
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            poll_timeout: self.poll_timeout(),
            idle_backoff: self.idle_backoff(),
            completion_wait: self.completion_wait(),
            shutdown_timeout: self.shutdown_timeout(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.kafka_hosts.trim().is_empty() {
            anyhow::bail!("KAFKA_HOSTS must not be empty");
        }
        if self.kafka_consumer_group.trim().is_empty() {
            anyhow::bail!("KAFKA_CONSUMER_GROUP must not be empty");
        }
        if self.client_id_prefix.trim().is_empty() {
            anyhow::bail!("CLIENT_ID_PREFIX must not be empty");
        }
        if self.topics().is_empty() {
            anyhow::bail!("KAFKA_TOPICS must name at least one topic");
        }
        if self.consumer_count == 0 {
            anyhow::bail!("CONSUMER_COUNT must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&map).expect("config should initialize")
    }

    #[test]
    fn defaults_are_sane() {
        let config = config_from(&[]);
        assert_eq!(config.kafka_hosts, "127.0.0.1:9092");
        assert_eq!(config.topics(), vec!["test-topic".to_string()]);
        assert_eq!(config.consumer_count, 3);
        assert_eq!(config.poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.completion_wait(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn topics_split_on_commas_and_trim() {
        let config = config_from(&[("KAFKA_TOPICS", "events, clicks ,,metrics")]);
        assert_eq!(
            config.topics(),
            vec![
                "events".to_string(),
                "clicks".to_string(),
                "metrics".to_string()
            ]
        );
    }

    #[test]
    fn loop_settings_come_from_the_ms_knobs() {
        let config = config_from(&[
            ("POLL_TIMEOUT_MS", "250"),
            ("COMPLETION_WAIT_MS", "1500"),
            ("SHUTDOWN_TIMEOUT_MS", "2000"),
        ]);
        let settings = config.loop_settings();
        assert_eq!(settings.poll_timeout, Duration::from_millis(250));
        assert_eq!(settings.completion_wait, Duration::from_millis(1500));
        assert_eq!(settings.shutdown_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn validation_rejects_empty_identity() {
        let config = config_from(&[("KAFKA_CONSUMER_GROUP", " ")]);
        assert!(config.validate().is_err());

        let config = config_from(&[("KAFKA_TOPICS", " , ")]);
        assert!(config.validate().is_err());

        let config = config_from(&[("CONSUMER_COUNT", "0")]);
        assert!(config.validate().is_err());
    }
}
