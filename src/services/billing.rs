use std::collections::{HashMap, HashSet};

use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use sqlx::{PgPool, Row};
use tracing::{info, warn};

use crate::error::AppError;
use crate::repository::table_service::{list_rows, map_db_error};
use crate::services::consumption::{self, Consumption, UtilityRates};
use crate::services::metering::{meter_values, readings_for_rooms};
use crate::services::periods::{period_date, previous_period};

/// Invoices fall due on the 5th of their billing month.
const INVOICE_DUE_DAY: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Overdue,
    Cancelled,
}

impl InvoiceStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "overdue" => Some(Self::Overdue),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
            Self::Overdue => "overdue",
            Self::Cancelled => "cancelled",
        }
    }

    /// Paid and cancelled invoices accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Paid | Self::Overdue | Self::Cancelled),
            Self::Overdue => matches!(next, Self::Paid | Self::Cancelled),
            Self::Paid | Self::Cancelled => false,
        }
    }
}

/// Result of one invoice generation run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GenerationOutcome {
    pub generated: u32,
    pub skipped_existing: u32,
    pub skipped_unmetered: u32,
    pub errors: u32,
}

/// Generate the month's invoices for every active contract.
///
/// Eligibility and charges come from five batched queries (contracts,
/// rooms, branches, existing invoices, current + previous readings); the
/// per-contract loop then runs entirely in memory. Contracts are
/// independent units of work: a skip or failure on one never aborts the
/// rest, and already-invoiced contracts are left untouched, so re-running
/// a period is a no-op for them.
pub async fn generate_invoices(
    pool: &PgPool,
    month: u32,
    year: i32,
) -> Result<GenerationOutcome, AppError> {
    let due_date = period_date(month, year, INVOICE_DUE_DAY)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid billing period {month}/{year}.")))?;

    let mut outcome = GenerationOutcome {
        generated: 0,
        skipped_existing: 0,
        skipped_unmetered: 0,
        errors: 0,
    };

    let mut contract_filters = Map::new();
    contract_filters.insert("is_active".to_string(), Value::Bool(true));
    let contracts = list_rows(
        pool,
        "contracts",
        Some(&contract_filters),
        1000,
        0,
        "created_at",
        true,
    )
    .await?;

    let room_ids = contracts
        .iter()
        .map(|contract| val_str(contract, "room_id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    let rooms = row_index(pool, "rooms", &room_ids).await?;

    let branch_ids = rooms
        .values()
        .map(|room| val_str(room, "branch_id"))
        .filter(|id| !id.is_empty())
        .collect::<Vec<_>>();
    let branches = row_index(pool, "branches", &branch_ids).await?;

    let invoiced = invoiced_contract_ids(pool, month, year).await?;

    let (prev_month, prev_year) = previous_period(month, year);
    let current_readings = readings_for_rooms(pool, &room_ids, month, year).await?;
    let previous_readings = readings_for_rooms(pool, &room_ids, prev_month, prev_year).await?;

    for contract in &contracts {
        let contract_id = val_str(contract, "id");
        let room_id = val_str(contract, "room_id");
        if contract_id.is_empty() || room_id.is_empty() {
            continue;
        }

        if invoiced.contains(&contract_id) {
            outcome.skipped_existing += 1;
            continue;
        }

        // A room not yet metered for the target period cannot be billed.
        let Some(current) = current_readings.get(&room_id).and_then(meter_values) else {
            outcome.skipped_unmetered += 1;
            continue;
        };
        let previous = previous_readings.get(&room_id).and_then(meter_values);

        let Some(room) = rooms.get(&room_id) else {
            warn!("Active contract {contract_id} references a missing room {room_id}");
            outcome.errors += 1;
            continue;
        };
        let Some(branch) = branches.get(&val_str(room, "branch_id")) else {
            warn!("Room {room_id} references a missing branch");
            outcome.errors += 1;
            continue;
        };

        let rates = UtilityRates {
            water: val_f64(branch, "water_rate"),
            elec: val_f64(branch, "elec_rate"),
        };
        let rent = val_f64(room, "price");
        let usage = consumption::derive(current, previous, rates);
        let total_amount = rent + usage.total_cost();
        let items = invoice_line_items(rent, &usage);

        match insert_invoice(pool, &contract_id, month, year, total_amount, due_date, &items).await
        {
            Ok(Some(_invoice_id)) => outcome.generated += 1,
            // Lost the race against a concurrent run for this contract.
            Ok(None) => outcome.skipped_existing += 1,
            Err(e) => {
                warn!("Failed to create invoice for contract {contract_id}: {e}");
                outcome.errors += 1;
            }
        }
    }

    info!(
        month,
        year,
        generated = outcome.generated,
        skipped_existing = outcome.skipped_existing,
        skipped_unmetered = outcome.skipped_unmetered,
        errors = outcome.errors,
        "Invoice generation completed"
    );

    Ok(outcome)
}

/// The three ordered charges on every invoice: rent, then water and
/// electricity with the billed unit counts embedded in the descriptions.
fn invoice_line_items(rent: f64, usage: &Consumption) -> Vec<(String, f64)> {
    vec![
        ("Room rent".to_string(), rent),
        (
            format!("Water ({} units)", usage.water_unit),
            usage.water_cost,
        ),
        (
            format!("Electricity ({} units)", usage.elec_unit),
            usage.elec_cost,
        ),
    ]
}

/// Insert one invoice and its line items atomically. The conditional
/// insert against the (contract, month, year) uniqueness constraint is
/// what closes the check-then-create race between concurrent generation
/// runs: the loser observes no returned row and backs off.
async fn insert_invoice(
    pool: &PgPool,
    contract_id: &str,
    month: u32,
    year: i32,
    total_amount: f64,
    due_date: NaiveDate,
    items: &[(String, f64)],
) -> Result<Option<String>, AppError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| AppError::Dependency(format!("txn begin: {e}")))?;

    let inserted = sqlx::query(
        "INSERT INTO invoices (contract_id, month, year, total_amount, due_date, status)
         VALUES ($1::uuid, $2, $3, $4, $5, 'pending')
         ON CONFLICT (contract_id, month, year) DO NOTHING
         RETURNING id::text AS id",
    )
    .bind(contract_id)
    .bind(month as i32)
    .bind(year)
    .bind(total_amount)
    .bind(due_date)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_db_error)?;

    let Some(row) = inserted else {
        tx.rollback().await.ok();
        return Ok(None);
    };
    let invoice_id = row
        .try_get::<String, _>("id")
        .map_err(|e| AppError::Internal(format!("invoice id missing: {e}")))?;

    for (position, (description, amount)) in items.iter().enumerate() {
        sqlx::query(
            "INSERT INTO invoice_items (invoice_id, position, description, amount)
             VALUES ($1::uuid, $2, $3, $4)",
        )
        .bind(&invoice_id)
        .bind(position as i32)
        .bind(description)
        .bind(amount)
        .execute(&mut *tx)
        .await
        .map_err(map_db_error)?;
    }

    tx.commit()
        .await
        .map_err(|e| AppError::Dependency(format!("txn commit: {e}")))?;
    Ok(Some(invoice_id))
}

/// Contract ids already invoiced for the period.
async fn invoiced_contract_ids(
    pool: &PgPool,
    month: u32,
    year: i32,
) -> Result<HashSet<String>, AppError> {
    let mut filters = Map::new();
    filters.insert("month".to_string(), json!(month));
    filters.insert("year".to_string(), json!(year));
    let invoices = list_rows(pool, "invoices", Some(&filters), 1000, 0, "created_at", true).await?;

    Ok(invoices
        .iter()
        .map(|invoice| val_str(invoice, "contract_id"))
        .filter(|id| !id.is_empty())
        .collect())
}

async fn row_index(
    pool: &PgPool,
    table: &str,
    ids: &[String],
) -> Result<HashMap<String, Value>, AppError> {
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let mut filters = Map::new();
    filters.insert(
        "id".to_string(),
        Value::Array(ids.iter().cloned().map(Value::String).collect()),
    );
    let rows = list_rows(
        pool,
        table,
        Some(&filters),
        ids.len().max(100) as i64,
        0,
        "created_at",
        true,
    )
    .await?;

    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        let id = val_str(&row, "id");
        if !id.is_empty() {
            index.insert(id, row);
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

fn val_f64(row: &Value, key: &str) -> f64 {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use crate::services::consumption::{self, MeterValues, UtilityRates};

    use super::{invoice_line_items, InvoiceStatus};

    #[test]
    fn open_statuses_follow_the_transition_table() {
        let pending = InvoiceStatus::Pending;
        assert!(pending.can_transition_to(InvoiceStatus::Paid));
        assert!(pending.can_transition_to(InvoiceStatus::Overdue));
        assert!(pending.can_transition_to(InvoiceStatus::Cancelled));
        assert!(!pending.can_transition_to(InvoiceStatus::Pending));

        let overdue = InvoiceStatus::Overdue;
        assert!(overdue.can_transition_to(InvoiceStatus::Paid));
        assert!(overdue.can_transition_to(InvoiceStatus::Cancelled));
        assert!(!overdue.can_transition_to(InvoiceStatus::Pending));
    }

    #[test]
    fn terminal_statuses_reject_every_transition() {
        for terminal in [InvoiceStatus::Paid, InvoiceStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                InvoiceStatus::Pending,
                InvoiceStatus::Paid,
                InvoiceStatus::Overdue,
                InvoiceStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn parses_and_prints_status_names() {
        assert_eq!(InvoiceStatus::parse("PAID"), Some(InvoiceStatus::Paid));
        assert_eq!(
            InvoiceStatus::parse(" cancelled "),
            Some(InvoiceStatus::Cancelled)
        );
        assert_eq!(InvoiceStatus::parse("void"), None);
        assert_eq!(InvoiceStatus::Overdue.as_str(), "overdue");
    }

    #[test]
    fn line_items_carry_unit_counts_and_sum_to_the_total() {
        let usage = consumption::derive(
            MeterValues {
                water: 105,
                elec: 310,
            },
            Some(MeterValues {
                water: 100,
                elec: 300,
            }),
            UtilityRates {
                water: 18.0,
                elec: 7.0,
            },
        );
        let rent = 3000.0;
        let items = invoice_line_items(rent, &usage);

        assert_eq!(items.len(), 3);
        assert_eq!(items[0], ("Room rent".to_string(), 3000.0));
        assert_eq!(items[1], ("Water (5 units)".to_string(), 90.0));
        assert_eq!(items[2], ("Electricity (10 units)".to_string(), 70.0));

        let total: f64 = rent + usage.total_cost();
        assert_eq!(total, 3160.0);
        assert_eq!(items.iter().map(|(_, amount)| amount).sum::<f64>(), total);
    }

    #[test]
    fn first_month_of_occupancy_bills_rent_only() {
        let usage = consumption::derive(
            MeterValues {
                water: 105,
                elec: 310,
            },
            None,
            UtilityRates {
                water: 18.0,
                elec: 7.0,
            },
        );
        let items = invoice_line_items(3000.0, &usage);
        assert_eq!(items[1], ("Water (0 units)".to_string(), 0.0));
        assert_eq!(items[2], ("Electricity (0 units)".to_string(), 0.0));
        assert_eq!(3000.0 + usage.total_cost(), 3000.0);
    }
}
