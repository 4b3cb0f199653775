use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use reconciler_exchange::{OrderStatus, OrderType, Side, Symbol};

use crate::order::{NewOrder, Order, find_order_by_id, touch_synced};

/// In-memory SQLite database with all migrations applied. A single connection
/// keeps every query on the same in-memory database.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub fn ts(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

/// Builder for test orders. Defaults to a submitted, never-synced pending
/// limit buy of 1.5 BTCUSDT with external id `123`.
pub struct OrderBuilder {
    new_order: NewOrder,
    created_at: DateTime<Utc>,
    last_synced_at: Option<DateTime<Utc>>,
}

impl OrderBuilder {
    pub fn new() -> Self {
        Self {
            new_order: NewOrder {
                external_order_id: Some("123".to_string()),
                symbol: Symbol::new("BTCUSDT"),
                side: Side::Buy,
                order_type: OrderType::Limit,
                status: OrderStatus::Pending,
                quantity: dec!(1.5),
                filled_quantity: Decimal::ZERO,
                avg_price: None,
            },
            created_at: ts("2025-06-01T09:00:00Z"),
            last_synced_at: None,
        }
    }

    #[must_use]
    pub fn with_external_order_id(mut self, external_order_id: Option<&str>) -> Self {
        self.new_order.external_order_id = external_order_id.map(str::to_string);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.new_order.status = status;
        self
    }

    #[must_use]
    pub fn with_avg_price(mut self, avg_price: Option<Decimal>) -> Self {
        self.new_order.avg_price = avg_price;
        self
    }

    #[must_use]
    pub fn with_last_synced_at(mut self, last_synced_at: DateTime<Utc>) -> Self {
        self.last_synced_at = Some(last_synced_at);
        self
    }

    pub async fn insert(self, pool: &SqlitePool) -> Order {
        let order = self.new_order.insert(pool, self.created_at).await.unwrap();

        match self.last_synced_at {
            Some(last_synced_at) => {
                touch_synced(pool, order.id, last_synced_at).await.unwrap();
                find_order_by_id(pool, order.id).await.unwrap().unwrap()
            }
            None => order,
        }
    }
}

impl Default for OrderBuilder {
    fn default() -> Self {
        Self::new()
    }
}
