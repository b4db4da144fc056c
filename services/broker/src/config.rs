use anyhow::{Context, Result};
use ferry_common::BrokerSettings;
use ferry_common::ids::SessionId;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";

// Broker service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Session whose request queue this process serves. A fresh id when unset.
    pub session_id: SessionId,
    pub settings: BrokerSettings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceConfigOverride {
    metrics_bind: Option<String>,
    session_id: Option<String>,
    decode_workers: Option<usize>,
    request_queue_capacity: Option<usize>,
    retrieval_concurrency: Option<usize>,
    retrieval_batch_size: Option<usize>,
    retrieval_idle_poll_ms: Option<u64>,
    visibility_timeout_ms: Option<u64>,
    request_wait_ms: Option<u64>,
    credential_expiry_ms: Option<u64>,
    provision_race_wait_ms: Option<u64>,
    inline_payload_limit: Option<usize>,
    sender_workers: Option<usize>,
    min_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    check_interval_ms: Option<u64>,
    send_timeout_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    round_robin: Option<bool>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = std::env::var("FERRY_BROKER_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse FERRY_BROKER_METRICS_BIND")?;
        let session_id = match std::env::var("FERRY_SESSION_ID") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("parse FERRY_SESSION_ID: {value}"))?,
            Err(_) => SessionId::new(),
        };

        let mut settings = BrokerSettings::default();
        let relay = &mut settings.relay;
        set_positive(&mut relay.decode_workers, "FERRY_DECODE_WORKERS");
        set_positive(
            &mut relay.request_queue_capacity,
            "FERRY_REQUEST_QUEUE_CAPACITY",
        );
        set_positive(
            &mut relay.retrieval_concurrency,
            "FERRY_RETRIEVAL_CONCURRENCY",
        );
        set_positive(&mut relay.retrieval_batch_size, "FERRY_RETRIEVAL_BATCH_SIZE");
        set_millis(&mut relay.retrieval_idle_poll, "FERRY_RETRIEVAL_IDLE_POLL_MS");
        set_millis(&mut relay.visibility_timeout, "FERRY_VISIBILITY_TIMEOUT_MS");
        set_millis(&mut relay.request_wait, "FERRY_REQUEST_WAIT_MS");
        set_millis(&mut relay.credential_expiry, "FERRY_CREDENTIAL_EXPIRY_MS");
        set_millis(
            &mut relay.provision_race_wait,
            "FERRY_PROVISION_RACE_WAIT_MS",
        );
        set_positive(&mut relay.inline_payload_limit, "FERRY_INLINE_PAYLOAD_LIMIT");

        let sender = &mut settings.sender;
        set_positive(&mut sender.workers, "FERRY_SENDER_WORKERS");
        set_millis(&mut sender.min_backoff, "FERRY_SENDER_MIN_BACKOFF_MS");
        set_millis(&mut sender.max_backoff, "FERRY_SENDER_MAX_BACKOFF_MS");
        set_millis(&mut sender.check_interval, "FERRY_SENDER_CHECK_INTERVAL_MS");
        set_millis(&mut sender.send_timeout, "FERRY_SEND_TIMEOUT_MS");
        set_millis(&mut sender.drain_timeout, "FERRY_DRAIN_TIMEOUT_MS");
        sender.round_robin = std::env::var("FERRY_SENDER_ROUND_ROBIN")
            .ok()
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(sender.round_robin);

        Ok(Self {
            metrics_bind,
            session_id,
            settings,
        })
    }

    /// Env values first, then the YAML file named by `FERRY_BROKER_CONFIG`.
    ///
    /// The merged settings are validated before they are returned.
    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("FERRY_BROKER_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read FERRY_BROKER_CONFIG: {path}"))?;
            let override_cfg: ServiceConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse broker config yaml")?;
            config.apply(override_cfg)?;
        }
        config
            .settings
            .validate()
            .with_context(|| "validate broker settings")?;
        Ok(config)
    }

    fn apply(&mut self, override_cfg: ServiceConfigOverride) -> Result<()> {
        if let Some(value) = override_cfg.metrics_bind {
            self.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = override_cfg.session_id {
            self.session_id = value.parse().with_context(|| "parse session_id")?;
        }

        let relay = &mut self.settings.relay;
        keep_positive(&mut relay.decode_workers, override_cfg.decode_workers);
        keep_positive(
            &mut relay.request_queue_capacity,
            override_cfg.request_queue_capacity,
        );
        keep_positive(
            &mut relay.retrieval_concurrency,
            override_cfg.retrieval_concurrency,
        );
        keep_positive(
            &mut relay.retrieval_batch_size,
            override_cfg.retrieval_batch_size,
        );
        keep_millis(
            &mut relay.retrieval_idle_poll,
            override_cfg.retrieval_idle_poll_ms,
        );
        keep_millis(
            &mut relay.visibility_timeout,
            override_cfg.visibility_timeout_ms,
        );
        keep_millis(&mut relay.request_wait, override_cfg.request_wait_ms);
        keep_millis(
            &mut relay.credential_expiry,
            override_cfg.credential_expiry_ms,
        );
        keep_millis(
            &mut relay.provision_race_wait,
            override_cfg.provision_race_wait_ms,
        );
        keep_positive(
            &mut relay.inline_payload_limit,
            override_cfg.inline_payload_limit,
        );

        let sender = &mut self.settings.sender;
        keep_positive(&mut sender.workers, override_cfg.sender_workers);
        keep_millis(&mut sender.min_backoff, override_cfg.min_backoff_ms);
        keep_millis(&mut sender.max_backoff, override_cfg.max_backoff_ms);
        keep_millis(&mut sender.check_interval, override_cfg.check_interval_ms);
        keep_millis(&mut sender.send_timeout, override_cfg.send_timeout_ms);
        keep_millis(&mut sender.drain_timeout, override_cfg.drain_timeout_ms);
        if let Some(value) = override_cfg.round_robin {
            sender.round_robin = value;
        }
        Ok(())
    }
}

// Zero and unparsable values fall back to whatever the field already holds.
fn env_positive<T>(key: &str) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .filter(|value| *value > T::default())
}

fn set_positive<T>(field: &mut T, key: &str)
where
    T: FromStr + PartialOrd + Default,
{
    if let Some(value) = env_positive(key) {
        *field = value;
    }
}

fn set_millis(field: &mut Duration, key: &str) {
    if let Some(value) = env_positive::<u64>(key) {
        *field = Duration::from_millis(value);
    }
}

fn keep_positive<T>(field: &mut T, value: Option<T>)
where
    T: PartialOrd + Default,
{
    if let Some(value) = value
        && value > T::default()
    {
        *field = value;
    }
}

fn keep_millis(field: &mut Duration, value: Option<u64>) {
    if let Some(value) = value
        && value > 0
    {
        *field = Duration::from_millis(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::path::PathBuf;

    const KEYS: &[&str] = &[
        "FERRY_BROKER_METRICS_BIND",
        "FERRY_SESSION_ID",
        "FERRY_BROKER_CONFIG",
        "FERRY_DECODE_WORKERS",
        "FERRY_REQUEST_QUEUE_CAPACITY",
        "FERRY_SENDER_WORKERS",
        "FERRY_SENDER_MIN_BACKOFF_MS",
        "FERRY_SENDER_MAX_BACKOFF_MS",
        "FERRY_SENDER_ROUND_ROBIN",
        "FERRY_REQUEST_WAIT_MS",
    ];

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    fn clean_env() -> Vec<EnvGuard> {
        KEYS.iter().map(|key| EnvGuard::unset(*key)).collect()
    }

    fn write_yaml(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "ferry-broker-{}-{name}.yaml",
            std::process::id()
        ));
        fs::write(&path, contents).expect("write yaml");
        path
    }

    #[test]
    #[serial]
    fn defaults_without_env() -> Result<()> {
        let _env = clean_env();
        let config = ServiceConfig::from_env_or_yaml()?;
        assert_eq!(config.metrics_bind, DEFAULT_METRICS_BIND.parse::<SocketAddr>()?);
        assert_eq!(config.settings.relay.decode_workers, 64);
        assert_eq!(config.settings.sender.workers, 1000);
        assert!(!config.settings.sender.round_robin);
        Ok(())
    }

    #[test]
    #[serial]
    fn env_values_override_defaults() -> Result<()> {
        let _env = clean_env();
        let session_id = SessionId::new();
        let _g1 = EnvGuard::set("FERRY_DECODE_WORKERS", "8");
        let _g2 = EnvGuard::set("FERRY_SENDER_WORKERS", "12");
        let _g3 = EnvGuard::set("FERRY_REQUEST_WAIT_MS", "250");
        let _g4 = EnvGuard::set("FERRY_SENDER_ROUND_ROBIN", "true");
        let _g5 = EnvGuard::set("FERRY_SESSION_ID", &session_id.to_string());
        let config = ServiceConfig::from_env_or_yaml()?;
        assert_eq!(config.session_id, session_id);
        assert_eq!(config.settings.relay.decode_workers, 8);
        assert_eq!(config.settings.sender.workers, 12);
        assert_eq!(
            config.settings.relay.request_wait,
            Duration::from_millis(250)
        );
        assert!(config.settings.sender.round_robin);
        Ok(())
    }

    #[test]
    #[serial]
    fn zero_or_garbage_env_values_are_ignored() -> Result<()> {
        let _env = clean_env();
        let _g1 = EnvGuard::set("FERRY_DECODE_WORKERS", "0");
        let _g2 = EnvGuard::set("FERRY_REQUEST_QUEUE_CAPACITY", "lots");
        let config = ServiceConfig::from_env_or_yaml()?;
        assert_eq!(config.settings.relay.decode_workers, 64);
        assert_eq!(config.settings.relay.request_queue_capacity, 1024);
        Ok(())
    }

    #[test]
    #[serial]
    fn bad_metrics_bind_is_an_error() {
        let _env = clean_env();
        let _g = EnvGuard::set("FERRY_BROKER_METRICS_BIND", "not-an-addr");
        assert!(ServiceConfig::from_env().is_err());
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() -> Result<()> {
        let _env = clean_env();
        let path = write_yaml(
            "override",
            "metrics_bind: 127.0.0.1:9100\n\
             decode_workers: 4\n\
             request_queue_capacity: 0\n\
             min_backoff_ms: 10\n\
             max_backoff_ms: 40\n\
             round_robin: true\n",
        );
        let _g1 = EnvGuard::set("FERRY_DECODE_WORKERS", "8");
        let _g2 = EnvGuard::set("FERRY_BROKER_CONFIG", &path.to_string_lossy());
        let config = ServiceConfig::from_env_or_yaml()?;
        fs::remove_file(&path)?;

        assert_eq!(config.metrics_bind, "127.0.0.1:9100".parse::<SocketAddr>()?);
        assert_eq!(config.settings.relay.decode_workers, 4);
        assert_eq!(config.settings.relay.request_queue_capacity, 1024);
        assert_eq!(
            config.settings.sender.min_backoff,
            Duration::from_millis(10)
        );
        assert_eq!(
            config.settings.sender.max_backoff,
            Duration::from_millis(40)
        );
        assert!(config.settings.sender.round_robin);
        Ok(())
    }

    #[test]
    #[serial]
    fn inverted_backoff_fails_validation() -> Result<()> {
        let _env = clean_env();
        let path = write_yaml("inverted", "min_backoff_ms: 9000\nmax_backoff_ms: 10\n");
        let _g = EnvGuard::set("FERRY_BROKER_CONFIG", &path.to_string_lossy());
        let result = ServiceConfig::from_env_or_yaml();
        fs::remove_file(&path)?;
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    #[serial]
    fn unknown_yaml_keys_are_rejected() -> Result<()> {
        let _env = clean_env();
        let path = write_yaml("unknown", "decode_worker: 4\n");
        let _g = EnvGuard::set("FERRY_BROKER_CONFIG", &path.to_string_lossy());
        let result = ServiceConfig::from_env_or_yaml();
        fs::remove_file(&path)?;
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    #[serial]
    fn missing_yaml_file_is_an_error() {
        let _env = clean_env();
        let _g = EnvGuard::set("FERRY_BROKER_CONFIG", "/nonexistent/ferry-broker.yaml");
        assert!(ServiceConfig::from_env_or_yaml().is_err());
    }
}
