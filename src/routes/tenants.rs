use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{count_rows, create_row, delete_row, get_row, list_rows, update_row},
    schemas::{remove_nulls, serialize_to_map, validate_input, CreateTenantInput, TenantPath, UpdateTenantInput},
    services::audit::write_audit_log,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/tenants",
            axum::routing::get(list_tenants).post(create_tenant),
        )
        .route(
            "/tenants/{tenant_id}",
            axum::routing::patch(update_tenant).delete(delete_tenant),
        )
}

async fn list_tenants(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let rows = list_rows(pool, "tenants", None, 1000, 0, "created_at", false).await?;

    // The listing carries the active-contract count so the UI can tell
    // who is currently renting.
    let mut enriched = Vec::with_capacity(rows.len());
    for mut row in rows {
        let tenant_id = value_str(&row, "id");
        let active_contracts = if tenant_id.is_empty() {
            0
        } else {
            let mut filters = Map::new();
            filters.insert("tenant_id".to_string(), Value::String(tenant_id));
            filters.insert("is_active".to_string(), Value::Bool(true));
            count_rows(pool, "contracts", Some(&filters)).await?
        };
        if let Some(row_obj) = row.as_object_mut() {
            row_obj.insert("active_contracts".to_string(), json!(active_contracts));
        }
        enriched.push(row);
    }

    Ok(Json(json!({ "data": enriched })))
}

async fn create_tenant(
    State(state): State<AppState>,
    Json(payload): Json<CreateTenantInput>,
) -> AppResult<impl IntoResponse> {
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let record = remove_nulls(serialize_to_map(&payload));
    // A duplicate id_card trips the unique constraint and surfaces as 409.
    let created = create_row(pool, "tenants", &record).await?;
    let entity_id = value_str(&created, "id");

    write_audit_log(
        state.db_pool.as_ref(),
        "create",
        "tenants",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;

    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

async fn update_tenant(
    State(state): State<AppState>,
    Path(path): Path<TenantPath>,
    Json(payload): Json<UpdateTenantInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let existing = get_row(pool, "tenants", &path.tenant_id).await?;
    let patch = remove_nulls(serialize_to_map(&payload));
    if patch.is_empty() {
        return Ok(Json(existing));
    }

    let updated = update_row(pool, "tenants", &path.tenant_id, &patch).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "update",
        "tenants",
        Some(&path.tenant_id),
        Some(existing),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

async fn delete_tenant(
    State(state): State<AppState>,
    Path(path): Path<TenantPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "tenant_id".to_string(),
        Value::String(path.tenant_id.clone()),
    );
    let contracts = count_rows(pool, "contracts", Some(&filters)).await?;
    if contracts > 0 {
        return Err(AppError::Conflict(
            "Cannot delete a tenant with contract history.".to_string(),
        ));
    }

    let deleted = delete_row(pool, "tenants", &path.tenant_id).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "delete",
        "tenants",
        Some(&path.tenant_id),
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
