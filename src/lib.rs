//! ## bankmerge
//! Incremental upsert-merge of change streams into warehouse tables.
//!
//! Every entity (accounts, customers, transactions, ...) gets a pipeline that
//! reads changes since its last watermark, keeps the latest state of each
//! natural key, merges it into a ClickHouse table and only then commits the
//! new watermark. Tables either overwrite rows in place or keep SCD Type-2
//! history, with configurable handling of late arrivals.
//!
//! ## Configuration
//! Example config:
//! ```toml
//! watermark_dir = "./watermarks"
//! interval_seconds = 60
//!
//! [api]
//! listen = "0.0.0.0:8000"
//!
//! [entities.accounts]
//! decoder = "debezium"
//! kafka_broker = "localhost:9092"
//! topic = "banking.public.accounts"
//! clickhouse_url = "tcp://localhost:9000"
//! clickhouse_table = "dim_accounts"
//! key_field = "account_id"
//! history = "scd2"                        # keep closed versions
//! late_arrival = "backfill"               # ignore | reject | backfill
//! custom.key_field = "account_id"
//!
//! [entities.transactions]
//! decoder = "json"
//! source_file = "./data/transactions.ndjson"
//! clickhouse_url = "tcp://localhost:9000"
//! clickhouse_table = "fact_transactions"
//! key_field = "transaction_id"
//! custom = { key_field = "transaction_id", time_field = "updated_at" }
//! ```
//!
//! Settings can be overridden with `BANKMERGE__`-prefixed environment
//! variables, `__` separating nested keys.
//!
//! ## Delivery
//! Sources are read at-least-once. A run that fails part way leaves the
//! watermark (and Kafka offsets) where they were and keeps its batch, and
//! merging the same records again converges to the same table state, so the
//! next run just repeats it.
//!
//! ## Extending
//! New wire formats plug in through the [Decoder] trait, new change feeds
//! through [ChangeSource] and new warehouses through [TargetStore].
//!
//! [Decoder]: decoder::Decoder
//! [ChangeSource]: source::ChangeSource
//! [TargetStore]: store::TargetStore

pub mod api;
pub mod decoder;
pub mod dedup;
pub mod error;
pub mod merge;
pub mod record;
pub mod runner;
pub mod settings;
pub mod source;
pub mod startup;
pub mod store;
pub mod watermark;
