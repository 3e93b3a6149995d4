use std::collections::{HashMap, HashSet};

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, validate_input, GenerateInvoicesInput, InvoicePath, InvoicesQuery,
        PrintInvoicesQuery, UpdateInvoiceStatusInput,
    },
    services::audit::write_audit_log,
    services::billing::{generate_invoices, InvoiceStatus},
    services::metering::{meter_values, readings_for_rooms},
    services::periods::previous_period,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/invoices", axum::routing::get(list_invoices))
        .route("/invoices/generate", axum::routing::post(generate))
        .route("/invoices/print", axum::routing::get(print_invoices))
        .route(
            "/invoices/{invoice_id}/status",
            axum::routing::post(update_invoice_status),
        )
}

async fn list_invoices(
    State(state): State<AppState>,
    Query(query): Query<InvoicesQuery>,
) -> AppResult<Json<Value>> {
    validate_input(&query)?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert("month".to_string(), json!(query.month));
    filters.insert("year".to_string(), json!(query.year));
    if let Some(status) = query
        .status
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        let status = InvoiceStatus::parse(status).ok_or_else(|| {
            AppError::UnprocessableEntity(format!("Unknown invoice status '{status}'."))
        })?;
        filters.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
    }

    let rows = list_rows(
        pool,
        "invoices",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "created_at",
        true,
    )
    .await?;

    let enriched = enrich_invoice_rows(pool, rows, false).await?;
    Ok(Json(json!({ "data": enriched })))
}

/// Operator-triggered generation for one billing period. Safe to re-run:
/// already-invoiced contracts are skipped and the store's uniqueness
/// constraint backstops concurrent invocations.
async fn generate(
    State(state): State<AppState>,
    Json(payload): Json<GenerateInvoicesInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let outcome = generate_invoices(pool, payload.month, payload.year).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "generate",
        "invoices",
        None,
        None,
        Some(json!({
            "month": payload.month,
            "year": payload.year,
            "outcome": outcome,
        })),
    )
    .await;

    Ok(Json(json!({
        "count": outcome.generated,
        "skipped_existing": outcome.skipped_existing,
        "skipped_unmetered": outcome.skipped_unmetered,
        "errors": outcome.errors,
    })))
}

/// Status is the only mutable field on an invoice, and it only moves
/// along the transition table; anything out of a terminal status is a
/// conflict. Amounts and line items stay as generated.
async fn update_invoice_status(
    State(state): State<AppState>,
    Path(path): Path<InvoicePath>,
    Json(payload): Json<UpdateInvoiceStatusInput>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let invoice = get_row(pool, "invoices", &path.invoice_id).await?;

    let next = InvoiceStatus::parse(&payload.status).ok_or_else(|| {
        AppError::UnprocessableEntity(format!("Unknown invoice status '{}'.", payload.status))
    })?;
    let current = InvoiceStatus::parse(&value_str(&invoice, "status"))
        .ok_or_else(|| AppError::Internal("Invoice has an unknown status.".to_string()))?;

    if !current.can_transition_to(next) {
        return Err(AppError::Conflict(format!(
            "Invoice status cannot change from '{}' to '{}'.",
            current.as_str(),
            next.as_str()
        )));
    }

    let mut patch = Map::new();
    patch.insert(
        "status".to_string(),
        Value::String(next.as_str().to_string()),
    );
    let updated = update_row(pool, "invoices", &path.invoice_id, &patch).await?;

    write_audit_log(
        state.db_pool.as_ref(),
        "status_transition",
        "invoices",
        Some(&path.invoice_id),
        Some(invoice),
        Some(updated.clone()),
    )
    .await;

    Ok(Json(updated))
}

/// Print view: selected invoices (by ids, or a whole period) excluding
/// cancelled ones, each carrying its line items and the meter figures the
/// charges were derived from.
async fn print_invoices(
    State(state): State<AppState>,
    Query(query): Query<PrintInvoicesQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let ids = query
        .ids
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut filters = Map::new();
    if !ids.is_empty() {
        filters.insert(
            "id".to_string(),
            Value::Array(ids.into_iter().map(Value::String).collect()),
        );
    } else if let (Some(month), Some(year)) = (query.month, query.year) {
        filters.insert("month".to_string(), json!(month));
        filters.insert("year".to_string(), json!(year));
    } else {
        return Err(AppError::BadRequest(
            "Provide ids or a month and year to print.".to_string(),
        ));
    }

    let mut rows = list_rows(pool, "invoices", Some(&filters), 1000, 0, "created_at", true).await?;
    rows.retain(|row| value_str(row, "status") != InvoiceStatus::Cancelled.as_str());

    let enriched = enrich_invoice_rows(pool, rows, true).await?;
    Ok(Json(json!({ "data": enriched })))
}

/// Attach line items, tenant/room/branch context and (for print) the
/// backing meter figures, all via batched index lookups, then order by
/// room number the way the paper stack is sorted.
async fn enrich_invoice_rows(
    pool: &sqlx::PgPool,
    rows: Vec<Value>,
    with_meters: bool,
) -> AppResult<Vec<Value>> {
    if rows.is_empty() {
        return Ok(rows);
    }

    let items_index = invoice_items_index(pool, &collect_ids(&rows, "id")).await?;

    let contract_index = index_by_id(pool, "contracts", collect_ids(&rows, "contract_id")).await?;
    let tenant_ids = contract_index
        .values()
        .map(|contract| value_str(contract, "tenant_id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    let room_ids = contract_index
        .values()
        .map(|contract| value_str(contract, "room_id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    let tenant_index = index_by_id(pool, "tenants", tenant_ids).await?;
    let room_index = index_by_id(pool, "rooms", room_ids.clone()).await?;
    let branch_ids = room_index
        .values()
        .map(|room| value_str(room, "branch_id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    let branch_index = index_by_id(pool, "branches", branch_ids).await?;

    let meter_index = if with_meters {
        meter_figures_index(pool, &rows, &contract_index, &room_ids).await?
    } else {
        HashMap::new()
    };

    let mut enriched = Vec::with_capacity(rows.len());
    for mut row in rows {
        let invoice_id = value_str(&row, "id");
        let contract_id = value_str(&row, "contract_id");
        let contract = contract_index.get(&contract_id);
        let room_id = contract
            .map(|contract| value_str(contract, "room_id"))
            .unwrap_or_default();

        if let Some(row_obj) = row.as_object_mut() {
            row_obj.insert(
                "items".to_string(),
                Value::Array(items_index.get(&invoice_id).cloned().unwrap_or_default()),
            );

            if let Some(contract) = contract {
                let tenant_id = value_str(contract, "tenant_id");
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

            if with_meters {
                let month = value_i64(row_obj, "month");
                let year = value_i64(row_obj, "year");
                row_obj.insert(
                    "meter".to_string(),
                    meter_index
                        .get(&(room_id.clone(), month, year))
                        .cloned()
                        .unwrap_or(Value::Null),
                );
            }
        }
        enriched.push(row);
    }

    enriched.sort_by_key(|row| value_str(row, "room_number"));
    Ok(enriched)
}

/// Previous/current/unit water and electricity figures per (room, period),
/// fetched with two batched reading queries per distinct period. Absent
/// readings render as 0, matching the printed layout.
async fn meter_figures_index(
    pool: &sqlx::PgPool,
    rows: &[Value],
    contract_index: &HashMap<String, Value>,
    room_ids: &[String],
) -> AppResult<HashMap<(String, i64, i64), Value>> {
    let periods = rows
        .iter()
        .filter_map(|row| {
            let obj = row.as_object()?;
            Some((value_i64(obj, "month"), value_i64(obj, "year")))
        })
        .collect::<HashSet<_>>();

    let mut index = HashMap::new();
    for (month, year) in periods {
        let (Ok(month_u32), Ok(year_i32)) = (u32::try_from(month), i32::try_from(year)) else {
            continue;
        };
        if !(1..=12).contains(&month_u32) {
            continue;
        }
        let (prev_month, prev_year) = previous_period(month_u32, year_i32);
        let current = readings_for_rooms(pool, room_ids, month_u32, year_i32).await?;
        let previous = readings_for_rooms(pool, room_ids, prev_month, prev_year).await?;

        for row in rows {
            let Some(obj) = row.as_object() else {
                continue;
            };
            if value_i64(obj, "month") != month || value_i64(obj, "year") != year {
                continue;
            }
            let contract_id = value_str(row, "contract_id");
            let Some(contract) = contract_index.get(&contract_id) else {
                continue;
            };
            let room_id = value_str(contract, "room_id");
            let current_values = current.get(&room_id).and_then(meter_values);
            let previous_values = previous.get(&room_id).and_then(meter_values);

            let curr_water = current_values.map(|values| values.water).unwrap_or(0);
            let prev_water = previous_values.map(|values| values.water).unwrap_or(0);
            let curr_elec = current_values.map(|values| values.elec).unwrap_or(0);
            let prev_elec = previous_values.map(|values| values.elec).unwrap_or(0);

            index.insert(
                (room_id, month, year),
                json!({
                    "water": {
                        "prev": prev_water,
                        "curr": curr_water,
                        "unit": curr_water - prev_water,
                    },
                    "elec": {
                        "prev": prev_elec,
                        "curr": curr_elec,
                        "unit": curr_elec - prev_elec,
                    },
                }),
            );
        }
    }
    Ok(index)
}

async fn invoice_items_index(
    pool: &sqlx::PgPool,
    invoice_ids: &[String],
) -> AppResult<HashMap<String, Vec<Value>>> {
    if invoice_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut filters = Map::new();
    filters.insert(
        "invoice_id".to_string(),
        Value::Array(invoice_ids.iter().cloned().map(Value::String).collect()),
    );
    let items = list_rows(
        pool,
        "invoice_items",
        Some(&filters),
        1000,
        0,
        "position",
        true,
    )
    .await?;

    let mut index: HashMap<String, Vec<Value>> = HashMap::new();
    for item in items {
        let invoice_id = value_str(&item, "invoice_id");
        if !invoice_id.is_empty() {
            index.entry(invoice_id).or_default().push(item);
        }
    }
    Ok(index)
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

fn value_i64(row: &Map<String, Value>, key: &str) -> i64 {
    row.get(key).and_then(Value::as_i64).unwrap_or_default()
}
