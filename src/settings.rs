//! Application config
use std::{collections::HashMap, time::Duration};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::merge::{HistoryMode, LateArrivalPolicy, LoadMode, MergeOptions};

/// How the CRUD API deletes a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// close the current version, keeping history
    Soft,
    /// remove every row of the key
    Hard,
}

/// configuration of single entity pipeline
#[derive(Debug, Clone, Deserialize)]
pub struct Entity {
    /// name of decoder to use
    pub decoder: String,
    /// address of bootstrap kafka broker
    pub kafka_broker: Option<String>,
    /// topic to consume
    pub topic: Option<String>,
    /// read newline-delimited messages from this file instead of kafka
    pub source_file: Option<String>,
    /// consumer group to use (default: use entity's name)
    pub consumer_group: Option<String>,
    /// max records per merge batch (default: 1000)
    pub batch_size: Option<usize>,
    /// batching timeout (default: 10s)
    pub batch_timeout_seconds: Option<u64>,
    /// URL of ClickHouse
    pub clickhouse_url: String,
    /// ClickHouse table to merge into
    pub clickhouse_table: String,
    /// natural key column, used by the API to pick the key out of request bodies
    pub key_field: String,
    #[serde(default)]
    pub load_mode: LoadMode,
    #[serde(default)]
    pub history: HistoryMode,
    #[serde(default)]
    pub late_arrival: LateArrivalPolicy,
    /// API delete behaviour (default: soft for scd2 tables, hard otherwise)
    pub delete_policy: Option<DeletePolicy>,
    /// retries of a failed key write (default: 3)
    pub write_retries: Option<u32>,
    /// retries of a failed source read (default: 3)
    pub source_retries: Option<u32>,
    /// Decoder-specific configuration
    pub custom: Option<toml::Value>,
}

impl Entity {
    pub fn merge_options(&self) -> MergeOptions {
        MergeOptions {
            load_mode: self.load_mode,
            history: self.history,
            late_arrival: self.late_arrival,
            write_retries: self.write_retries.unwrap_or(3),
            ..Default::default()
        }
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        match (self.delete_policy, self.history) {
            (Some(p), _) => p,
            (None, HistoryMode::Scd2) => DeletePolicy::Soft,
            (None, HistoryMode::Overwrite) => DeletePolicy::Hard,
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout_seconds.unwrap_or(10))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Api {
    /// listen address (default: 0.0.0.0:8000)
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// directory holding per-entity watermark files (default: ./watermarks)
    pub watermark_dir: Option<String>,
    /// pause between merge runs in `run` mode (default: 60s)
    pub interval_seconds: Option<u64>,
    pub api: Option<Api>,
    /// Map of entity names and settings
    pub entities: HashMap<String, Entity>,
}

impl Settings {
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .add_source(Environment::with_prefix("BANKMERGE").separator("__"))
            .build()?;
        let settings: Settings = cfg.try_deserialize()?;
        settings.validate()
    }

    /// Fills defaults and rejects contradictory entity settings
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.watermark_dir.is_none() {
            self.watermark_dir = Some(String::from("./watermarks"));
        }
        if self.interval_seconds.is_none() {
            self.interval_seconds = Some(60);
        }
        for (name, cfg) in &mut self.entities {
            cfg.batch_size = match cfg.batch_size {
                None => Some(1000),
                Some(x) => Some(x),
            };
            cfg.batch_timeout_seconds = match cfg.batch_timeout_seconds {
                None => Some(10),
                Some(x) => Some(x),
            };
            cfg.consumer_group = match &cfg.consumer_group {
                None => Some(name.to_owned()),
                Some(x) => Some(x.to_owned()),
            };
            let kafka = cfg.kafka_broker.is_some() && cfg.topic.is_some();
            if kafka == cfg.source_file.is_some() {
                return Err(ConfigError::Message(format!(
                    "entity {name}: set either kafka_broker and topic, or source_file"
                )));
            }
            if cfg.delete_policy() == DeletePolicy::Soft && cfg.history != HistoryMode::Scd2 {
                return Err(ConfigError::Message(format!(
                    "entity {name}: soft delete needs history = \"scd2\""
                )));
            }
        }
        Ok(self)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.unwrap_or(60))
    }

    pub fn listen_addr(&self) -> String {
        self.api
            .as_ref()
            .and_then(|a| a.listen.clone())
            .unwrap_or_else(|| String::from("0.0.0.0:8000"))
    }
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    fn parse(toml: &str) -> Result<Settings, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize::<Settings>()?
            .validate()
    }

    #[test]
    fn fills_defaults() {
        let settings = parse(
            r#"
            [entities.accounts]
            decoder = "debezium"
            kafka_broker = "localhost:9092"
            topic = "banking.public.accounts"
            clickhouse_url = "tcp://localhost:9000"
            clickhouse_table = "dim_accounts"
            key_field = "account_id"
            history = "scd2"
            late_arrival = "backfill"
            custom.key_field = "account_id"
            "#,
        )
        .unwrap();
        let accounts = &settings.entities["accounts"];
        assert_eq!(accounts.batch_size, Some(1000));
        assert_eq!(accounts.consumer_group.as_deref(), Some("accounts"));
        assert_eq!(accounts.load_mode, LoadMode::Incremental);
        assert_eq!(accounts.late_arrival, LateArrivalPolicy::Backfill);
        assert_eq!(accounts.delete_policy(), DeletePolicy::Soft);
        assert_eq!(settings.interval(), Duration::from_secs(60));
        assert_eq!(settings.listen_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn overwrite_tables_default_to_hard_delete() {
        let settings = parse(
            r#"
            [entities.transactions]
            decoder = "json"
            source_file = "transactions.ndjson"
            clickhouse_url = "tcp://localhost:9000"
            clickhouse_table = "fact_transactions"
            key_field = "transaction_id"
            "#,
        )
        .unwrap();
        assert_eq!(settings.entities["transactions"].delete_policy(), DeletePolicy::Hard);
    }

    #[test]
    fn rejects_soft_delete_without_history() {
        let err = parse(
            r#"
            [entities.transactions]
            decoder = "json"
            source_file = "transactions.ndjson"
            clickhouse_url = "tcp://localhost:9000"
            clickhouse_table = "fact_transactions"
            key_field = "transaction_id"
            delete_policy = "soft"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("soft delete"));
    }

    #[test]
    fn requires_exactly_one_source() {
        let err = parse(
            r#"
            [entities.customers]
            decoder = "json"
            clickhouse_url = "tcp://localhost:9000"
            clickhouse_table = "dim_customers"
            key_field = "customer_id"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("source_file"));
    }
}
