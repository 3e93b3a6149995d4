use chrono::NaiveDate;
use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

fn default_empty_string() -> String {
    String::new()
}
fn default_floor() -> i32 {
    1
}
fn default_room_status_vacant() -> String {
    "vacant".to_string()
}
fn default_deposit_zero() -> f64 {
    0.0
}
fn default_limit_200() -> i64 {
    200
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateBranchInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[serde(default = "default_empty_string")]
    pub address: String,
    #[validate(range(min = 0.0))]
    pub water_rate: f64,
    #[validate(range(min = 0.0))]
    pub elec_rate: f64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateBranchInput {
    pub name: Option<String>,
    pub address: Option<String>,
    pub water_rate: Option<f64>,
    pub elec_rate: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateRoomInput {
    pub branch_id: String,
    #[validate(length(min = 1, max = 50))]
    pub number: String,
    #[serde(default = "default_floor")]
    pub floor: i32,
    #[validate(range(min = 0.0))]
    pub price: f64,
    #[serde(default = "default_room_status_vacant")]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateRoomInput {
    pub branch_id: Option<String>,
    pub number: Option<String>,
    pub floor: Option<i32>,
    pub price: Option<f64>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateTenantInput {
    #[validate(length(min = 1, max = 255))]
    pub first_name: String,
    #[serde(default = "default_empty_string")]
    pub last_name: String,
    #[validate(length(min = 1, max = 50))]
    pub id_card: String,
    #[serde(default = "default_empty_string")]
    pub phone: String,
    #[serde(default = "default_empty_string")]
    pub line_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateTenantInput {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub id_card: Option<String>,
    pub phone: Option<String>,
    pub line_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateContractInput {
    pub tenant_id: String,
    pub room_id: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_deposit_zero")]
    #[validate(range(min = 0.0))]
    pub deposit: f64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateContractInput {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub deposit: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct TerminateContractInput {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MeterSheetQuery {
    pub branch_id: Option<String>,
    #[validate(range(min = 1, max = 12))]
    pub month: u32,
    #[validate(range(min = 2000, max = 2100))]
    pub year: i32,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct MeterReadingEntry {
    pub room_id: String,
    pub water_reading: i64,
    pub elec_reading: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct SaveMeterReadingsInput {
    #[validate(range(min = 1, max = 12))]
    pub month: u32,
    #[validate(range(min = 2000, max = 2100))]
    pub year: i32,
    #[validate(length(min = 1), nested)]
    pub readings: Vec<MeterReadingEntry>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct InvoicesQuery {
    #[validate(range(min = 1, max = 12))]
    pub month: u32,
    #[validate(range(min = 2000, max = 2100))]
    pub year: i32,
    pub status: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct GenerateInvoicesInput {
    #[validate(range(min = 1, max = 12))]
    pub month: u32,
    #[validate(range(min = 2000, max = 2100))]
    pub year: i32,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateInvoiceStatusInput {
    pub status: String,
}

/// Print selection: explicit invoice ids (comma-separated) win over a
/// (month, year) period filter.
#[derive(Debug, Clone, Deserialize)]
pub struct PrintInvoicesQuery {
    pub ids: Option<String>,
    pub month: Option<u32>,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BranchPath {
    pub branch_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomPath {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TenantPath {
    pub tenant_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractPath {
    pub contract_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoicePath {
    pub invoice_id: String,
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use validator::Validate;

    use super::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, GenerateInvoicesInput,
        UpdateContractInput,
    };

    #[test]
    fn clamps_limits() {
        assert_eq!(clamp_limit_in_range(0, 1, 1000), 1);
        assert_eq!(clamp_limit_in_range(250, 1, 1000), 250);
        assert_eq!(clamp_limit_in_range(5000, 1, 1000), 1000);
    }

    #[test]
    fn drops_null_patch_fields() {
        let patch = UpdateContractInput {
            start_date: None,
            end_date: None,
            deposit: Some(4500.0),
        };
        let map = remove_nulls(serialize_to_map(&patch));
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("deposit"), Some(&json!(4500.0)));
    }

    #[test]
    fn rejects_out_of_range_periods() {
        let bad_month = GenerateInvoicesInput {
            month: 13,
            year: 2026,
        };
        assert!(bad_month.validate().is_err());

        let ok = GenerateInvoicesInput {
            month: 12,
            year: 2026,
        };
        assert!(ok.validate().is_ok());
    }
}
