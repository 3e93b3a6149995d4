use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{count_rows, create_row, delete_row, get_row, list_rows, update_row},
    schemas::{remove_nulls, serialize_to_map, validate_input, CreateRoomInput, RoomPath, UpdateRoomInput},
    services::audit::write_audit_log,
    state::AppState,
};

const ROOM_STATUSES: &[&str] = &["vacant", "occupied", "maintenance"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/rooms", axum::routing::get(list_rooms).post(create_room))
        .route(
            "/rooms/{room_id}",
            axum::routing::patch(update_room).delete(delete_room),
        )
}

async fn list_rooms(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let rows = list_rows(pool, "rooms", None, 1000, 0, "number", true).await?;
    let enriched = attach_branch_names(pool, rows).await?;
    Ok(Json(json!({ "data": enriched })))
}

async fn create_room(
    State(state): State<AppState>,
    Json(payload): Json<CreateRoomInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    ensure_known_status(&payload.status)?;
    let pool = db_pool(&state)?;

    // Surfaces a clear 404 instead of a raw FK failure.
    get_row(pool, "branches", &payload.branch_id).await?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "rooms", &record).await?;
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        "create",
        "rooms",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn update_room(
    State(state): State<AppState>,
    Path(path): Path<RoomPath>,
    Json(payload): Json<UpdateRoomInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let existing = get_row(pool, "rooms", &path.room_id).await?;

    if let Some(status) = payload.status.as_deref() {
        ensure_known_status(status)?;
        // Occupancy is owned by the contract lifecycle: while a contract is
        // active against the room, its status cannot be edited directly.
        if status != value_str(&existing, "status") && active_contract_count(pool, &path.room_id).await? > 0
        {
            return Err(AppError::Conflict(
                "Room status is managed by its active contract.".to_string(),
            ));
        }
    }

    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(existing));
    }

    let updated = update_row(pool, "rooms", &path.room_id, &patch).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "update",
        "rooms",
        Some(&path.room_id),
        Some(existing),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn delete_room(
    State(state): State<AppState>,
    Path(path): Path<RoomPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("room_id".to_string(), Value::String(path.room_id.clone()));
    let contracts = count_rows(pool, "contracts", Some(&filters)).await?;
    let readings = count_rows(pool, "meter_readings", Some(&filters)).await?;
    if contracts > 0 || readings > 0 {
        return Err(AppError::Conflict(
            "Cannot delete a room with contract or meter history.".to_string(),
        ));
    }

    let deleted = delete_row(pool, "rooms", &path.room_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "delete",
        "rooms",
        Some(&path.room_id),
        Some(deleted.clone()),
        None,
    )
    .await;

    Ok(Json(deleted))
}

async fn active_contract_count(pool: &sqlx::PgPool, room_id: &str) -> AppResult<i64> {
    let mut filters = Map::new();
    filters.insert("room_id".to_string(), Value::String(room_id.to_string()));
    filters.insert("is_active".to_string(), Value::Bool(true));
    count_rows(pool, "contracts", Some(&filters)).await
}

async fn attach_branch_names(pool: &sqlx::PgPool, rows: Vec<Value>) -> AppResult<Vec<Value>> {
    if rows.is_empty() {
        return Ok(rows);
    }

    let branch_ids = rows
        .iter()
        .map(|row| value_str(row, "branch_id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();

    let mut branch_index: HashMap<String, Value> = HashMap::new();
    if !branch_ids.is_empty() {
        let mut filters = Map::new();
        filters.insert(
            "id".to_string(),
            Value::Array(branch_ids.into_iter().map(Value::String).collect()),
        );
        let branches = list_rows(pool, "branches", Some(&filters), 1000, 0, "name", true).await?;
        for branch in branches {
            let id = value_str(&branch, "id");
            if !id.is_empty() {
                branch_index.insert(id, branch);
            }
        }
    }

    let mut enriched = Vec::with_capacity(rows.len());
    for mut row in rows {
        if let Some(row_obj) = row.as_object_mut() {
            let branch_id = row_obj
                .get("branch_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            row_obj.insert(
                "branch_name".to_string(),
                branch_index
                    .get(&branch_id)
                    .and_then(|branch| branch.get("name"))
                    .cloned()
                    .unwrap_or(Value::Null),
            );
        }
        enriched.push(row);
    }
    Ok(enriched)
}

fn ensure_known_status(status: &str) -> AppResult<()> {
    if ROOM_STATUSES.contains(&status) {
        return Ok(());
    }
    Err(AppError::UnprocessableEntity(format!(
        "Unknown room status '{status}'."
    )))
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

#[cfg(test)]
mod tests {
    use super::ensure_known_status;

    #[test]
    fn accepts_only_known_statuses() {
        assert!(ensure_known_status("vacant").is_ok());
        assert!(ensure_known_status("occupied").is_ok());
        assert!(ensure_known_status("maintenance").is_ok());
        assert!(ensure_known_status("demolished").is_err());
    }
}
