use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use reconciler_exchange::OrderStatus;

use crate::error::PersistenceError;

/// Append-only audit entry written whenever reconciliation corrects an order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderActivity {
    pub id: i64,
    pub order_id: i64,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
    /// Venue payload that triggered the correction.
    pub exchange_snapshot: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OrderActivityRow {
    id: i64,
    order_id: i64,
    old_status: String,
    new_status: String,
    exchange_snapshot: String,
    recorded_at: DateTime<Utc>,
}

fn row_to_activity(
    OrderActivityRow {
        id,
        order_id,
        old_status,
        new_status,
        exchange_snapshot,
        recorded_at,
    }: OrderActivityRow,
) -> Result<OrderActivity, PersistenceError> {
    Ok(OrderActivity {
        id,
        order_id,
        old_status: old_status.parse()?,
        new_status: new_status.parse()?,
        exchange_snapshot: serde_json::from_str(&exchange_snapshot)?,
        recorded_at,
    })
}

pub async fn append_activity(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    order_id: i64,
    old_status: OrderStatus,
    new_status: OrderStatus,
    exchange_snapshot: &serde_json::Value,
    recorded_at: DateTime<Utc>,
) -> Result<i64, PersistenceError> {
    let snapshot = serde_json::to_string(exchange_snapshot)?;

    let result = sqlx::query(
        "
        INSERT INTO order_activities (
            order_id,
            old_status,
            new_status,
            exchange_snapshot,
            recorded_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5)
        ",
    )
    .bind(order_id)
    .bind(old_status.as_str())
    .bind(new_status.as_str())
    .bind(snapshot)
    .bind(recorded_at)
    .execute(&mut **sql_tx)
    .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_activities_for_order(
    pool: &SqlitePool,
    order_id: i64,
) -> Result<Vec<OrderActivity>, PersistenceError> {
    let rows = sqlx::query_as::<_, OrderActivityRow>(
        "SELECT * FROM order_activities WHERE order_id = ?1 ORDER BY id ASC",
    )
    .bind(order_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_activity).collect()
}
