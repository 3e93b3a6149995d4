use serde_json::Value;
use sqlx::PgPool;

/// Record a state change in the audit trail. Best-effort: a failed write
/// is logged and never fails the operation being audited.
pub async fn write_audit_log(
    pool: Option<&PgPool>,
    action: &str,
    entity: &str,
    entity_id: Option<&str>,
    before: Option<Value>,
    after: Option<Value>,
) {
    let Some(pool) = pool else {
        return;
    };

    let result = sqlx::query(
        "INSERT INTO audit_logs (action, entity, entity_id, before, after)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(action)
    .bind(entity)
    .bind(entity_id)
    .bind(before)
    .bind(after)
    .execute(pool)
    .await;

    if let Err(e) = result {
        tracing::warn!(
            action,
            entity,
            entity_id = entity_id.unwrap_or_default(),
            error = %e,
            "Failed to write audit log"
        );
    }
}
