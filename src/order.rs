use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqlitePool;

use reconciler_exchange::{OrderStatus, OrderType, Side, Symbol};

use crate::db_utils::{decimal_from_db, decimal_to_db, optional_decimal_from_db};
use crate::error::PersistenceError;

/// Locally persisted order. Once `external_order_id` is set, status and fills
/// only change by reconciling against the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: i64,
    pub external_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: i64,
    external_order_id: Option<String>,
    symbol: String,
    side: String,
    order_type: String,
    status: String,
    quantity: String,
    filled_quantity: String,
    avg_price: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_synced_at: Option<DateTime<Utc>>,
}

fn row_to_order(
    OrderRow {
        id,
        external_order_id,
        symbol,
        side,
        order_type,
        status,
        quantity,
        filled_quantity,
        avg_price,
        created_at,
        updated_at,
        last_synced_at,
    }: OrderRow,
) -> Result<Order, PersistenceError> {
    Ok(Order {
        id,
        external_order_id,
        symbol: Symbol::new(symbol),
        side: side.parse()?,
        order_type: order_type.parse()?,
        status: status.parse()?,
        quantity: decimal_from_db("quantity", &quantity)?,
        filled_quantity: decimal_from_db("filled_quantity", &filled_quantity)?,
        avg_price: optional_decimal_from_db("avg_price", avg_price.as_deref())?,
        created_at,
        updated_at,
        last_synced_at,
    })
}

/// An order handed over by the placement flow.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub external_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_price: Option<Decimal>,
}

impl NewOrder {
    pub async fn insert(
        &self,
        pool: &SqlitePool,
        now: DateTime<Utc>,
    ) -> Result<Order, PersistenceError> {
        let row = sqlx::query_as::<_, OrderRow>(
            "
            INSERT INTO orders (
                external_order_id,
                symbol,
                side,
                order_type,
                status,
                quantity,
                filled_quantity,
                avg_price,
                created_at,
                updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            RETURNING *
            ",
        )
        .bind(self.external_order_id.as_deref())
        .bind(&self.symbol.0)
        .bind(self.side.as_str())
        .bind(self.order_type.as_str())
        .bind(self.status.as_str())
        .bind(decimal_to_db(self.quantity))
        .bind(decimal_to_db(self.filled_quantity))
        .bind(self.avg_price.map(decimal_to_db))
        .bind(now)
        .fetch_one(pool)
        .await?;

        row_to_order(row)
    }
}

pub async fn find_order_by_id(
    pool: &SqlitePool,
    order_id: i64,
) -> Result<Option<Order>, PersistenceError> {
    let row = sqlx::query_as::<_, OrderRow>("SELECT * FROM orders WHERE id = ?1")
        .bind(order_id)
        .fetch_optional(pool)
        .await?;

    row.map(row_to_order).transpose()
}

/// Submitted, non-terminal orders not synced since `stale_before`, least
/// recently synced first (never-synced orders lead).
pub async fn find_stale_orders(
    pool: &SqlitePool,
    stale_before: DateTime<Utc>,
    batch_size: u32,
) -> Result<Vec<Order>, PersistenceError> {
    let [pending, new, partial] = OrderStatus::RECONCILABLE;

    let rows = sqlx::query_as::<_, OrderRow>(
        "
        SELECT * FROM orders
        WHERE external_order_id IS NOT NULL
          AND status IN (?1, ?2, ?3)
          AND (last_synced_at IS NULL OR julianday(last_synced_at) < julianday(?4))
        ORDER BY julianday(last_synced_at) ASC, id ASC
        LIMIT ?5
        ",
    )
    .bind(pending.as_str())
    .bind(new.as_str())
    .bind(partial.as_str())
    .bind(stale_before)
    .bind(batch_size)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(row_to_order).collect()
}

/// Overwrites status and fills with the venue's view. A missing `avg_price`
/// keeps the stored one.
pub async fn apply_exchange_state(
    sql_tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    order_id: i64,
    status: OrderStatus,
    filled_quantity: Decimal,
    avg_price: Option<Decimal>,
    now: DateTime<Utc>,
) -> Result<Order, PersistenceError> {
    let row = sqlx::query_as::<_, OrderRow>(
        "
        UPDATE orders
        SET status = ?1,
            filled_quantity = ?2,
            avg_price = COALESCE(?3, avg_price),
            updated_at = ?4,
            last_synced_at = CASE
                WHEN last_synced_at IS NULL OR julianday(last_synced_at) < julianday(?4) THEN ?4
                ELSE last_synced_at
            END
        WHERE id = ?5
        RETURNING *
        ",
    )
    .bind(status.as_str())
    .bind(decimal_to_db(filled_quantity))
    .bind(avg_price.map(decimal_to_db))
    .bind(now)
    .bind(order_id)
    .fetch_optional(&mut **sql_tx)
    .await?
    .ok_or(PersistenceError::OrderNotFound(order_id))?;

    row_to_order(row)
}

/// Records that the order was checked against the venue at `now`. Never moves
/// `last_synced_at` backwards.
pub async fn touch_synced(
    pool: &SqlitePool,
    order_id: i64,
    now: DateTime<Utc>,
) -> Result<(), PersistenceError> {
    let result = sqlx::query(
        "
        UPDATE orders
        SET last_synced_at = CASE
            WHEN last_synced_at IS NULL OR julianday(last_synced_at) < julianday(?1) THEN ?1
            ELSE last_synced_at
        END
        WHERE id = ?2
        ",
    )
    .bind(now)
    .bind(order_id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(PersistenceError::OrderNotFound(order_id));
    }

    Ok(())
}
