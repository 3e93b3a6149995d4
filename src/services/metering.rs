#![allow(dead_code)]

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use sqlx::{PgConnection, PgPool, Row};

use crate::error::AppError;
use crate::repository::table_service::{list_rows, map_db_error};
use crate::services::consumption::MeterValues;
use crate::services::periods::previous_period;

/// Point lookup of the single reading for (room, month, year).
pub async fn reading_for_room(
    pool: &PgPool,
    room_id: &str,
    month: u32,
    year: i32,
) -> Result<Option<Value>, AppError> {
    let row = sqlx::query(
        "SELECT row_to_json(t) AS row
         FROM meter_readings t
         WHERE room_id = $1::uuid AND month = $2 AND year = $3
         LIMIT 1",
    )
    .bind(room_id)
    .bind(month as i32)
    .bind(year)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    Ok(row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten()))
}

/// Batched lookup for a set of rooms in one period, keyed by room id.
/// One query regardless of how many rooms the caller is billing.
pub async fn readings_for_rooms(
    pool: &PgPool,
    room_ids: &[String],
    month: u32,
    year: i32,
) -> Result<HashMap<String, Value>, AppError> {
    if room_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut filters = Map::new();
    filters.insert(
        "room_id".to_string(),
        Value::Array(room_ids.iter().cloned().map(Value::String).collect()),
    );
    filters.insert("month".to_string(), json!(month));
    filters.insert("year".to_string(), json!(year));

    let rows = list_rows(
        pool,
        "meter_readings",
        Some(&filters),
        room_ids.len().max(100) as i64,
        0,
        "created_at",
        true,
    )
    .await?;

    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        let room_id = val_str(&row, "room_id");
        if !room_id.is_empty() {
            index.insert(room_id, row);
        }
    }
    Ok(index)
}

/// Create or overwrite the reading for (room, month, year). Overwrites
/// support meter-entry corrections; counter values are stored as given,
/// with no monotonicity check against earlier periods.
pub async fn upsert_reading_tx(
    conn: &mut PgConnection,
    room_id: &str,
    month: u32,
    year: i32,
    water_reading: i64,
    elec_reading: i64,
) -> Result<Value, AppError> {
    let row = sqlx::query(
        "INSERT INTO meter_readings (room_id, month, year, water_reading, elec_reading)
         VALUES ($1::uuid, $2, $3, $4, $5)
         ON CONFLICT (room_id, month, year)
         DO UPDATE SET water_reading = EXCLUDED.water_reading,
                       elec_reading = EXCLUDED.elec_reading
         RETURNING row_to_json(meter_readings.*) AS row",
    )
    .bind(room_id)
    .bind(month as i32)
    .bind(year)
    .bind(water_reading)
    .bind(elec_reading)
    .fetch_one(&mut *conn)
    .await
    .map_err(map_db_error)?;

    row.try_get::<Option<Value>, _>("row")
        .ok()
        .flatten()
        .ok_or_else(|| AppError::Internal("Could not store meter reading.".to_string()))
}

/// Read-only projection behind the meter-entry screen: every room
/// (optionally one branch) with its previous-period counters (0 when the
/// room was never metered) and current-period counters (absent when the
/// period has not been recorded yet).
pub async fn meter_sheet(
    pool: &PgPool,
    branch_id: Option<&str>,
    month: u32,
    year: i32,
) -> Result<Vec<Value>, AppError> {
    let mut room_filters = Map::new();
    if let Some(branch_id) = branch_id {
        room_filters.insert("branch_id".to_string(), Value::String(branch_id.to_string()));
    }
    let rooms = list_rows(pool, "rooms", Some(&room_filters), 1000, 0, "number", true).await?;

    let room_ids = rooms
        .iter()
        .map(|room| val_str(room, "id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();

    let branch_ids = rooms
        .iter()
        .map(|room| val_str(room, "branch_id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    let branch_names = branch_name_index(pool, &branch_ids).await?;

    let (prev_month, prev_year) = previous_period(month, year);
    let current = readings_for_rooms(pool, &room_ids, month, year).await?;
    let previous = readings_for_rooms(pool, &room_ids, prev_month, prev_year).await?;

    let mut sheet = Vec::with_capacity(rooms.len());
    for room in &rooms {
        let room_id = val_str(room, "id");
        let current_values = current.get(&room_id).and_then(meter_values);
        let previous_values = previous.get(&room_id).and_then(meter_values);

        sheet.push(json!({
            "room_id": room_id,
            "room_number": val_str(room, "number"),
            "branch_name": branch_names
                .get(&val_str(room, "branch_id"))
                .cloned()
                .unwrap_or_default(),
            "prev_water": previous_values.map(|values| values.water).unwrap_or(0),
            "current_water": current_values.map(|values| json!(values.water)).unwrap_or(Value::Null),
            "prev_elec": previous_values.map(|values| values.elec).unwrap_or(0),
            "current_elec": current_values.map(|values| json!(values.elec)).unwrap_or(Value::Null),
        }));
    }
    Ok(sheet)
}

/// Counter pair from a meter reading row, if both columns are present.
pub fn meter_values(row: &Value) -> Option<MeterValues> {
    let object = row.as_object()?;
    Some(MeterValues {
        water: object.get("water_reading").and_then(Value::as_i64)?,
        elec: object.get("elec_reading").and_then(Value::as_i64)?,
    })
}

async fn branch_name_index(
    pool: &PgPool,
    branch_ids: &[String],
) -> Result<HashMap<String, String>, AppError> {
    if branch_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut filters = Map::new();
    filters.insert(
        "id".to_string(),
        Value::Array(branch_ids.iter().cloned().map(Value::String).collect()),
    );
    let branches = list_rows(pool, "branches", Some(&filters), 1000, 0, "name", true).await?;

    let mut index = HashMap::with_capacity(branches.len());
    for branch in branches {
        let id = val_str(&branch, "id");
        if !id.is_empty() {
            index.insert(id, val_str(&branch, "name"));
        }
    }
    Ok(index)
}

fn val_str(row: &Value, key: &str) -> String {
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
    use serde_json::json;

    use super::meter_values;

    #[test]
    fn extracts_counter_pairs() {
        let row = json!({ "water_reading": 105, "elec_reading": 310 });
        let values = meter_values(&row).expect("both counters present");
        assert_eq!(values.water, 105);
        assert_eq!(values.elec, 310);
    }

    #[test]
    fn rejects_rows_missing_a_counter() {
        assert!(meter_values(&json!({ "water_reading": 105 })).is_none());
        assert!(meter_values(&json!("not a row")).is_none());
    }
}
