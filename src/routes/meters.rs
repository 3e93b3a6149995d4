use axum::{
    extract::{Query, State},
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::{AppError, AppResult},
    schemas::{validate_input, MeterSheetQuery, SaveMeterReadingsInput},
    services::audit::write_audit_log,
    services::metering::{meter_sheet, upsert_reading_tx},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route(
        "/meters",
        axum::routing::get(get_meter_sheet).put(save_meter_readings),
    )
}

/// Per-room previous/current counters for one period, the projection the
/// meter-entry screen renders.
async fn get_meter_sheet(
    State(state): State<AppState>,
    Query(query): Query<MeterSheetQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let pool = db_pool(&state)?;

    let sheet = meter_sheet(pool, query.branch_id.as_deref(), query.month, query.year).await?;
    Ok(Json(json!({ "data": sheet })))
}

/// Bulk upsert of one period's readings. All rows commit together so a
/// half-saved sheet is never visible; re-submitting a corrected sheet
/// overwrites the previous values.
async fn save_meter_readings(
    State(state): State<AppState>,
    Json(payload): Json<SaveMeterReadingsInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| AppError::Dependency(format!("txn begin: {e}")))?;

    for entry in &payload.readings {
        upsert_reading_tx(
            &mut tx,
            &entry.room_id,
            payload.month,
            payload.year,
            entry.water_reading,
            entry.elec_reading,
        )
        .await?;
    }

    tx.commit()
        .await
        .map_err(|e| AppError::Dependency(format!("txn commit: {e}")))?;

    write_audit_log(
        state.db_pool.as_ref(),
        "save_readings",
        "meter_readings",
        None,
        None,
        Some(json!({
            "month": payload.month,
            "year": payload.year,
            "rooms": payload.readings.len(),
        })),
    )
    .await;

    Ok(Json(json!({ "saved": payload.readings.len() })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}
