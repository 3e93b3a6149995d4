use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{count_rows, create_row, delete_row, get_row, list_rows, update_row},
    schemas::{remove_nulls, serialize_to_map, validate_input, BranchPath, CreateBranchInput, UpdateBranchInput},
    services::audit::write_audit_log,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/branches",
            axum::routing::get(list_branches).post(create_branch),
        )
        .route(
            "/branches/{branch_id}",
            axum::routing::patch(update_branch).delete(delete_branch),
        )
}

async fn list_branches(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let rows = list_rows(pool, "branches", None, 1000, 0, "name", true).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_branch(
    State(state): State<AppState>,
    Json(payload): Json<CreateBranchInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    let created = create_row(pool, "branches", &record).await?;
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        "create",
        "branches",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn update_branch(
    State(state): State<AppState>,
    Path(path): Path<BranchPath>,
    Json(payload): Json<UpdateBranchInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let existing = get_row(pool, "branches", &path.branch_id).await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(existing));
    }

    // Rate changes apply to future generation runs only; invoices already
    // created keep the amounts computed at their generation time.
    let updated = update_row(pool, "branches", &path.branch_id, &patch).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "update",
        "branches",
        Some(&path.branch_id),
        Some(existing),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn delete_branch(
    State(state): State<AppState>,
    Path(path): Path<BranchPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "branch_id".to_string(),
        Value::String(path.branch_id.clone()),
    );
    let rooms = count_rows(pool, "rooms", Some(&filters)).await?;
    if rooms > 0 {
        return Err(AppError::Conflict(
            "Cannot delete a branch that still has rooms.".to_string(),
        ));
    }

    let deleted = delete_row(pool, "branches", &path.branch_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "delete",
        "branches",
        Some(&path.branch_id),
        Some(deleted.clone()),
        None,
    )
    .await;

    Ok(Json(deleted))
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
