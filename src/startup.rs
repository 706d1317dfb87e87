//! Builds runners and API state out of [`Settings`]
use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use tracing::info;

use crate::{
    api::{AppState, EntityApi},
    decoder::get_decoder,
    merge::MergeEngine,
    runner::Runner,
    settings::{Entity, Settings},
    source::{file::FileSource, kafka::KafkaSource, ChangeSource},
    store::{clickhouse::ClickHouseStore, TargetStore},
    watermark::{FileWatermarkStore, WatermarkStore},
};

const SOURCE_BACKOFF: Duration = Duration::from_secs(1);

/// Opens the entity's target table, creating it when missing
pub async fn target_store(name: &str, cfg: &Entity) -> Result<Arc<dyn TargetStore>> {
    let store = ClickHouseStore::new(&cfg.clickhouse_url, &cfg.clickhouse_table);
    store
        .ensure_table()
        .await
        .with_context(|| format!("entity {name}: cannot prepare {}", cfg.clickhouse_table))?;
    Ok(Arc::new(store))
}

fn change_source(name: &str, cfg: &Entity) -> Result<Box<dyn ChangeSource>> {
    let decoder = get_decoder(&cfg.decoder, cfg.custom.clone())
        .with_context(|| format!("entity {name}: cannot create decoder"))?;
    match (&cfg.kafka_broker, &cfg.topic, &cfg.source_file) {
        (Some(broker), Some(topic), None) => {
            let group = cfg.consumer_group.as_deref().unwrap_or(name);
            let source = KafkaSource::new(
                broker,
                topic,
                group,
                decoder,
                cfg.batch_size.unwrap_or(1000),
                cfg.batch_timeout(),
            )
            .with_context(|| format!("entity {name}: cannot create kafka consumer"))?;
            Ok(Box::new(source))
        }
        (_, _, Some(path)) => Ok(Box::new(FileSource::new(path, decoder))),
        _ => Err(anyhow!("entity {name}: no change source configured")),
    }
}

pub async fn runner(name: &str, cfg: &Entity, settings: &Settings) -> Result<Runner> {
    let source = change_source(name, cfg)?;
    let store = target_store(name, cfg).await?;
    let watermarks: Arc<dyn WatermarkStore> =
        Arc::new(FileWatermarkStore::new(settings.watermark_dir.as_deref().unwrap_or("./watermarks")));
    info!(
        entity = name,
        source = %source.get_name(),
        table = %cfg.clickhouse_table,
        history = ?cfg.history,
        load_mode = ?cfg.load_mode,
        "created runner"
    );
    Ok(Runner::new(name, source, store, watermarks, MergeEngine::new(cfg.merge_options()))
        .with_source_retries(cfg.source_retries.unwrap_or(3), SOURCE_BACKOFF))
}

pub async fn api_state(settings: &Settings) -> Result<AppState> {
    let mut entities = HashMap::new();
    for (name, cfg) in &settings.entities {
        let api = EntityApi {
            store: target_store(name, cfg).await?,
            engine: Arc::new(MergeEngine::new(cfg.merge_options())),
            key_field: cfg.key_field.clone(),
            delete_policy: cfg.delete_policy(),
        };
        entities.insert(name.clone(), api);
    }
    Ok(AppState::new(entities))
}
