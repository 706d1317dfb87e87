use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::info;

use super::{ApiError, AppState, EntityApi};
use crate::{
    decoder::key_string,
    merge::Applied,
    record::{Payload, RawRecord, TargetRow},
    settings::DeletePolicy,
    store::KeyWrite,
};

/// Columns the service maintains itself; ignored in request bodies
const BOOKKEEPING: [&str; 4] = ["load_timestamp", "effective_from", "effective_to", "is_current"];

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let api = state.entity(&entity)?;
    let rows = api.store.list_current().await?;
    Ok(Json(rows.iter().map(render).collect()))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let api = state.entity(&entity)?;
    match api.store.current(&id).await? {
        Some(row) => Ok(Json(render(&row))),
        None => Err(ApiError::NotFound(format!("{entity} {id}"))),
    }
}

pub async fn create(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let api = state.entity(&entity)?;
    let payload = payload_of(body)?;
    let id = payload
        .get(&api.key_field)
        .and_then(key_string)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {}", api.key_field)))?;
    if api.store.current(&id).await?.is_some() {
        return Err(ApiError::AlreadyExists(format!("{entity} {id}")));
    }
    let row = write(api, RawRecord::upsert(&id, Utc::now(), payload)).await?;
    info!(entity = %entity, id = %id, "created");
    Ok((StatusCode::CREATED, Json(render(&row))))
}

pub async fn update(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let api = state.entity(&entity)?;
    let mut payload = payload_of(body)?;
    match payload.get(&api.key_field).map(key_string) {
        None => {}
        Some(Some(k)) if k == id => {}
        Some(_) => {
            return Err(ApiError::BadRequest(format!(
                "{} does not match the path",
                api.key_field
            )))
        }
    }
    if api.store.current(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("{entity} {id}")));
    }
    payload
        .entry(api.key_field.clone())
        .or_insert_with(|| Value::String(id.clone()));
    let row = write(api, RawRecord::upsert(&id, Utc::now(), payload)).await?;
    info!(entity = %entity, id = %id, "updated");
    Ok(Json(render(&row)))
}

pub async fn delete(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let api = state.entity(&entity)?;
    if api.store.current(&id).await?.is_none() {
        return Err(ApiError::NotFound(format!("{entity} {id}")));
    }
    match api.delete_policy {
        DeletePolicy::Soft => {
            let now = Utc::now();
            match api
                .engine
                .apply_record(api.store.as_ref(), RawRecord::delete(&id, now), now)
                .await?
            {
                Applied::Written(_) => {}
                Applied::Skipped | Applied::Rejected => {
                    return Err(ApiError::Conflict(format!(
                        "{entity} {id} changed at the same instant, retry"
                    )))
                }
            }
        }
        DeletePolicy::Hard => api.store.apply(KeyWrite::purge(&id)).await?,
    }
    info!(entity = %entity, id = %id, policy = ?api.delete_policy, "deleted");
    Ok(Json(json!({ "detail": format!("{entity} {id} deleted") })))
}

/// Merges an API change and returns the key's resulting current row
async fn write(api: &EntityApi, record: RawRecord) -> Result<TargetRow, ApiError> {
    let id = record.natural_key.clone();
    let now = record.event_time;
    if let Applied::Rejected = api.engine.apply_record(api.store.as_ref(), record, now).await? {
        return Err(ApiError::Conflict(format!(
            "{id} has a newer version than this change"
        )));
    }
    api.store
        .current(&id)
        .await?
        .ok_or_else(|| ApiError::Conflict(format!("{id} has a newer deletion than this change")))
}

fn payload_of(body: Result<Json<Value>, JsonRejection>) -> Result<Payload, ApiError> {
    let Json(value) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let Value::Object(mut payload) = value else {
        return Err(ApiError::BadRequest(String::from("body must be a JSON object")));
    };
    for field in BOOKKEEPING {
        payload.remove(field);
    }
    Ok(payload)
}

/// Row as served: payload fields plus load timestamp and, on history tables,
/// the validity interval
fn render(row: &TargetRow) -> Value {
    let mut out = row.payload.clone();
    out.insert(
        "load_timestamp".into(),
        Value::String(row.load_timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    if let Some(v) = row.validity {
        out.insert(
            "effective_from".into(),
            Value::String(v.valid_from.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        out.insert(
            "effective_to".into(),
            v.valid_to
                .map(|t| Value::String(t.to_rfc3339_opts(SecondsFormat::Micros, true)))
                .unwrap_or(Value::Null),
        );
        out.insert("is_current".into(), Value::Bool(v.is_current));
    }
    Value::Object(out)
}
