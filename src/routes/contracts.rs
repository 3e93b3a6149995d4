use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{create_row_tx, get_row, list_rows, update_row, update_row_tx},
    schemas::{
        remove_nulls, serialize_to_map, validate_input, ContractPath, CreateContractInput,
        TerminateContractInput, UpdateContractInput,
    },
    services::audit::write_audit_log,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/contracts",
            axum::routing::get(list_contracts).post(create_contract),
        )
        .route(
            "/contracts/{contract_id}",
            axum::routing::patch(update_contract),
        )
        .route(
            "/contracts/{contract_id}/terminate",
            axum::routing::post(terminate_contract),
        )
}

async fn list_contracts(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let rows = list_rows(pool, "contracts", None, 1000, 0, "is_active", false).await?;
    let enriched = enrich_contract_rows(pool, rows).await?;
    Ok(Json(json!({ "data": enriched })))
}

/// Check-in: the contract insert and the room's flip to occupied commit
/// together or not at all. The store's one-active-contract-per-room index
/// rejects a second check-in against the same room as a conflict.
async fn create_contract(
    State(state): State<AppState>,
    Json(payload): Json<CreateContractInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    get_row(pool, "tenants", &payload.tenant_id).await?;
    get_row(pool, "rooms", &payload.room_id).await?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert("is_active".to_string(), Value::Bool(true));

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| AppError::Dependency(format!("txn begin: {e}")))?;

    let contract = create_row_tx(&mut tx, "contracts", &record).await?;

    let mut room_patch = Map::new();
    room_patch.insert("status".to_string(), Value::String("occupied".to_string()));
    update_row_tx(&mut tx, "rooms", &payload.room_id, &room_patch).await?;

    tx.commit()
        .await
        .map_err(|e| AppError::Dependency(format!("txn commit: {e}")))?;

    let entity_id = value_str(&contract, "id");
    write_audit_log(
        state.db_pool.as_ref(),
        "check_in",
        "contracts",
        Some(&entity_id),
        None,
        Some(contract.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(contract)))
}

/// Plain field amendment: start date, end date and deposit only. The
/// active flag and the tenant/room binding are never editable here.
async fn update_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    Json(payload): Json<UpdateContractInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let existing = get_row(pool, "contracts", &path.contract_id).await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(existing));
    }

    let updated = update_row(pool, "contracts", &path.contract_id, &patch).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "update",
        "contracts",
        Some(&path.contract_id),
        Some(existing),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

/// Check-out: deactivating the contract and vacating the room commit
/// together or not at all. Terminating a contract that has already ended
/// is rejected rather than silently repeated.
async fn terminate_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    Json(payload): Json<TerminateContractInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let contract = get_row(pool, "contracts", &path.contract_id).await?;
    if !value_bool(&contract, "is_active") {
        return Err(AppError::Conflict(
            "Contract is already terminated.".to_string(),
        ));
    }
    if value_str(&contract, "room_id") != payload.room_id.trim() {
        return Err(AppError::BadRequest(
            "room_id does not match the contract's room.".to_string(),
        ));
    }

    let today = Utc::now().date_naive();

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| AppError::Dependency(format!("txn begin: {e}")))?;

    let mut contract_patch = Map::new();
    contract_patch.insert("is_active".to_string(), Value::Bool(false));
    contract_patch.insert("end_date".to_string(), Value::String(today.to_string()));
    let terminated = update_row_tx(&mut tx, "contracts", &path.contract_id, &contract_patch).await?;

    let mut room_patch = Map::new();
    room_patch.insert("status".to_string(), Value::String("vacant".to_string()));
    update_row_tx(&mut tx, "rooms", &payload.room_id, &room_patch).await?;

    tx.commit()
        .await
        .map_err(|e| AppError::Dependency(format!("txn commit: {e}")))?;

    write_audit_log(
        state.db_pool.as_ref(),
        "check_out",
        "contracts",
        Some(&path.contract_id),
        Some(contract),
        Some(terminated.clone()),
    )
    .await;

    Ok(Json(terminated))
}

async fn enrich_contract_rows(pool: &sqlx::PgPool, rows: Vec<Value>) -> AppResult<Vec<Value>> {
    if rows.is_empty() {
        return Ok(rows);
    }

    let tenant_index = index_by_id(pool, "tenants", collect_ids(&rows, "tenant_id")).await?;
    let room_index = index_by_id(pool, "rooms", collect_ids(&rows, "room_id")).await?;
    let branch_ids = room_index
        .values()
        .map(|room| value_str(room, "branch_id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    let branch_index = index_by_id(pool, "branches", branch_ids).await?;

    let mut enriched = Vec::with_capacity(rows.len());
    for mut row in rows {
        let tenant_id = value_str(&row, "tenant_id");
        let room_id = value_str(&row, "room_id");
        if let Some(row_obj) = row.as_object_mut() {
            if let Some(tenant) = tenant_index.get(&tenant_id) {
                let name = format!(
                    "{} {}",
                    value_str(tenant, "first_name"),
                    value_str(tenant, "last_name")
                )
                .trim()
                .to_string();
                row_obj.insert("tenant_name".to_string(), Value::String(name));
            }
            if let Some(room) = room_index.get(&room_id) {
                row_obj.insert(
                    "room_number".to_string(),
                    room.get("number").cloned().unwrap_or(Value::Null),
                );
                let branch_id = value_str(room, "branch_id");
                row_obj.insert(
                    "branch_name".to_string(),
                    branch_index
                        .get(&branch_id)
                        .and_then(|branch| branch.get("name"))
                        .cloned()
                        .unwrap_or(Value::Null),
                );
            }
        }
        enriched.push(row);
    }
    Ok(enriched)
}

fn collect_ids(rows: &[Value], key: &str) -> Vec<String> {
    rows.iter()
        .map(|row| value_str(row, key))
        .filter(|id| !id.is_empty())
        .collect()
}

async fn index_by_id(
    pool: &sqlx::PgPool,
    table: &str,
    ids: Vec<String>,
) -> AppResult<HashMap<String, Value>> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut filters = Map::new();
    filters.insert(
        "id".to_string(),
        Value::Array(ids.into_iter().map(Value::String).collect()),
    );
    let rows = list_rows(pool, table, Some(&filters), 1000, 0, "created_at", true).await?;

    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        let id = value_str(&row, "id");
        if !id.is_empty() {
            index.insert(id, row);
        }
    }
    Ok(index)
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

fn value_bool(row: &Value, key: &str) -> bool {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
