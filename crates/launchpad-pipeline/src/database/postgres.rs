//! PostgreSQL item store, whitelist and durable work queue
//!
//! Runtime queries only, so the crate builds without a live database.
//! Conditional transitions are single `UPDATE ... WHERE <predicate>`
//! statements; multi-row writes run in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::core::{
    unique_idx, AllocationError, Buyer, Collectible, Collection, EligibilityError, FailedMint,
    Hold, ItemStore, Launch, LaunchItem, Order, OrderStatus, Phase, PhaseKind, PipelineError,
    PipelineResult, Purchase, ReceivedMessage, Reconciliation, SaleRecord, StorageError,
    WhitelistLookup, WorkQueue,
};

/// Shared predicate of candidate selection and the conditional hold.
/// `$stale` is bound to `now - staleness_window`.
const RESERVABLE: &str =
    "status IN ('ACTIVE', 'ON_HOLD') AND (on_hold_until IS NULL OR on_hold_until < $stale)";

const ITEM_COLUMNS: &str =
    "id, launch_id, collectible_id, status, on_hold_by, on_hold_since, on_hold_until, \
     created_at, updated_at";

const COLLECTIBLE_COLUMNS: &str = "id, collection_id, nft_id, cid, status, unique_idx, created_at";

const PURCHASE_COLUMNS: &str =
    "id, launch_id, launch_item_id, buyer_id, buyer_address, phase, price, tx_hash, purchased_at";

const ORDER_COLUMNS: &str = "id, buyer_id, collection_id, launch_id, launch_item_id, \
     funding_address, funding_amount, status, tx_hash, created_at, updated_at";

fn parse_text<T: FromStr<Err = String>>(table: &'static str, value: &str) -> PipelineResult<T> {
    value
        .parse()
        .map_err(|reason| StorageError::CorruptRow { table, reason }.into())
}

fn non_negative(table: &'static str, value: i32) -> PipelineResult<u32> {
    u32::try_from(value).map_err(|_| {
        StorageError::CorruptRow {
            table,
            reason: format!("negative counter {}", value),
        }
        .into()
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

fn item_from_row(row: &PgRow) -> PipelineResult<LaunchItem> {
    let status: String = row.get("status");
    Ok(LaunchItem {
        id: row.get("id"),
        launch_id: row.get("launch_id"),
        collectible_id: row.get("collectible_id"),
        status: parse_text("launch_items", &status)?,
        on_hold_by: row.get("on_hold_by"),
        on_hold_since: row.get("on_hold_since"),
        on_hold_until: row.get("on_hold_until"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn collectible_from_row(row: &PgRow) -> PipelineResult<Collectible> {
    let status: String = row.get("status");
    Ok(Collectible {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        nft_id: row.get("nft_id"),
        cid: row.get("cid"),
        status: parse_text("collectibles", &status)?,
        unique_idx: row.get("unique_idx"),
        created_at: row.get("created_at"),
    })
}

fn purchase_from_row(row: &PgRow) -> PipelineResult<Purchase> {
    let phase: Option<String> = row.get("phase");
    Ok(Purchase {
        id: row.get("id"),
        launch_id: row.get("launch_id"),
        launch_item_id: row.get("launch_item_id"),
        buyer_id: row.get("buyer_id"),
        buyer_address: row.get("buyer_address"),
        phase: phase
            .map(|p| parse_text::<PhaseKind>("purchases", &p))
            .transpose()?,
        price: row.get("price"),
        tx_hash: row.get("tx_hash"),
        purchased_at: row.get("purchased_at"),
    })
}

fn order_from_row(row: &PgRow) -> PipelineResult<Order> {
    let status: String = row.get("status");
    Ok(Order {
        id: row.get("id"),
        buyer_id: row.get("buyer_id"),
        collection_id: row.get("collection_id"),
        launch_id: row.get("launch_id"),
        launch_item_id: row.get("launch_item_id"),
        funding_address: row.get("funding_address"),
        funding_amount: row.get("funding_amount"),
        status: parse_text("orders", &status)?,
        tx_hash: row.get("tx_hash"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// PostgreSQL-backed launch store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and optionally run the embedded migrations
    pub async fn connect(config: &DatabaseConfig) -> PipelineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.postgres_url)
            .await?;

        if config.run_migrations {
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations applied");
        }

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn count_purchases_with<'e, E>(
        executor: E,
        launch_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        buyer_id: Uuid,
        buyer_address: &str,
    ) -> PipelineResult<u32>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM purchases
            WHERE launch_id = $1
              AND purchased_at >= $2 AND purchased_at < $3
              AND (buyer_id = $4 OR lower(buyer_address) = lower($5))
            "#,
        )
        .bind(launch_id)
        .bind(from)
        .bind(to)
        .bind(buyer_id)
        .bind(buyer_address)
        .fetch_one(executor)
        .await?;

        Ok(count.max(0) as u32)
    }

    /// Set CONFIRMED and the immutable unique index inside `tx`
    async fn confirm_collectible(
        tx: &mut Transaction<'_, Postgres>,
        collectible_id: Uuid,
        contract_address: &str,
    ) -> PipelineResult<()> {
        let nft_id: i64 = sqlx::query_scalar("SELECT nft_id FROM collectibles WHERE id = $1")
            .bind(collectible_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| {
                PipelineError::Consistency(format!("collectible {} missing", collectible_id))
            })?;
        let idx = unique_idx(contract_address, nft_id);

        let result = sqlx::query(
            r#"
            UPDATE collectibles
            SET status = 'CONFIRMED', unique_idx = $2
            WHERE id = $1 AND (unique_idx IS NULL OR unique_idx = $2)
            "#,
        )
        .bind(collectible_id)
        .bind(&idx)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(()),
            Ok(_) => Err(PipelineError::Consistency(format!(
                "collectible {} already carries a different unique index",
                collectible_id
            ))),
            Err(err) if is_unique_violation(&err) => Err(PipelineError::Consistency(format!(
                "unique index {} already used",
                idx
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl ItemStore for PostgresStore {
    async fn health_check(&self) -> PipelineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL pool closed");
    }

    async fn get_launch(&self, launch_id: Uuid) -> PipelineResult<Option<Launch>> {
        let row = sqlx::query("SELECT id, collection_id, unlimited_supply FROM launches WHERE id = $1")
            .bind(launch_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let phase_rows = sqlx::query(
            r#"
            SELECT kind, starts_at, ends_at, price, max_per_wallet
            FROM launch_phases WHERE launch_id = $1 ORDER BY position
            "#,
        )
        .bind(launch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut phases = Vec::with_capacity(phase_rows.len());
        for phase in &phase_rows {
            let kind: String = phase.get("kind");
            phases.push(Phase {
                kind: parse_text("launch_phases", &kind)?,
                starts_at: phase.get("starts_at"),
                ends_at: phase.get("ends_at"),
                price: phase.get("price"),
                max_per_wallet: non_negative("launch_phases", phase.get("max_per_wallet"))?,
            });
        }

        Ok(Some(Launch {
            id: row.get("id"),
            collection_id: row.get("collection_id"),
            unlimited_supply: row.get("unlimited_supply"),
            phases,
        }))
    }

    async fn get_collection(&self, collection_id: Uuid) -> PipelineResult<Option<Collection>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, contract_address, minting_model, last_nft_id, metadata_template
            FROM collections WHERE id = $1
            "#,
        )
        .bind(collection_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> PipelineResult<Collection> {
            let model: String = row.get("minting_model");
            Ok(Collection {
                id: row.get("id"),
                name: row.get("name"),
                contract_address: row.get("contract_address"),
                minting_model: parse_text("collections", &model)?,
                last_nft_id: row.get("last_nft_id"),
                metadata_template: row.get("metadata_template"),
            })
        })
        .transpose()
    }

    async fn get_buyer(&self, buyer_id: Uuid) -> PipelineResult<Option<Buyer>> {
        let row = sqlx::query("SELECT id, wallet_address, is_active FROM buyers WHERE id = $1")
            .bind(buyer_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| Buyer {
            id: row.get("id"),
            wallet_address: row.get("wallet_address"),
            is_active: row.get("is_active"),
        }))
    }

    async fn get_item(&self, item_id: Uuid) -> PipelineResult<Option<LaunchItem>> {
        let query = format!("SELECT {} FROM launch_items WHERE id = $1", ITEM_COLUMNS);
        let row = sqlx::query(&query)
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn get_collectible(&self, collectible_id: Uuid) -> PipelineResult<Option<Collectible>> {
        let query = format!("SELECT {} FROM collectibles WHERE id = $1", COLLECTIBLE_COLUMNS);
        let row = sqlx::query(&query)
            .bind(collectible_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(collectible_from_row).transpose()
    }

    async fn pick_reservable_item(
        &self,
        launch_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> PipelineResult<Option<LaunchItem>> {
        let query = format!(
            "SELECT {} FROM launch_items WHERE launch_id = $1 AND {} ORDER BY random() LIMIT 1",
            ITEM_COLUMNS,
            RESERVABLE.replace("$stale", "$2")
        );
        let row = sqlx::query(&query)
            .bind(launch_id)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn try_hold(
        &self,
        item_id: Uuid,
        hold: &Hold,
        stale_before: DateTime<Utc>,
    ) -> PipelineResult<Option<LaunchItem>> {
        let query = format!(
            r#"
            UPDATE launch_items
            SET status = 'ON_HOLD', on_hold_by = $2, on_hold_since = $3, on_hold_until = $4,
                updated_at = NOW()
            WHERE id = $1 AND {}
            RETURNING {}
            "#,
            RESERVABLE.replace("$stale", "$5"),
            ITEM_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(item_id)
            .bind(hold.holder_id)
            .bind(hold.since)
            .bind(hold.until)
            .bind(stale_before)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn extend_hold(
        &self,
        item_id: Uuid,
        holder_id: Uuid,
        hold_until: DateTime<Utc>,
    ) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE launch_items SET on_hold_until = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'ON_HOLD' AND on_hold_by = $2
            "#,
        )
        .bind(item_id)
        .bind(holder_id)
        .bind(hold_until)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_hold(&self, item_id: Uuid, holder_id: Option<Uuid>) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE launch_items
            SET status = 'ACTIVE', on_hold_by = NULL, on_hold_since = NULL, on_hold_until = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'ON_HOLD' AND ($2::uuid IS NULL OR on_hold_by = $2)
            "#,
        )
        .bind(item_id)
        .bind(holder_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_on_demand_item(
        &self,
        launch_id: Uuid,
        hold: &Hold,
        order_id: Option<Uuid>,
    ) -> PipelineResult<(LaunchItem, Collectible)> {
        let mut tx = self.pool.begin().await?;

        let counter = sqlx::query(
            r#"
            UPDATE collections c SET last_nft_id = c.last_nft_id + 1
            FROM launches l
            WHERE l.id = $1 AND c.id = l.collection_id
            RETURNING c.id AS collection_id, c.last_nft_id
            "#,
        )
        .bind(launch_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AllocationError::LaunchNotFound(launch_id))?;
        let collection_id: Uuid = counter.get("collection_id");
        let nft_id: i64 = counter.get("last_nft_id");

        let query = format!(
            r#"
            INSERT INTO collectibles (id, collection_id, nft_id, status)
            VALUES ($1, $2, $3, 'PENDING')
            RETURNING {}
            "#,
            COLLECTIBLE_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(collection_id)
            .bind(nft_id)
            .fetch_one(&mut *tx)
            .await?;
        let collectible = collectible_from_row(&row)?;

        let query = format!(
            r#"
            INSERT INTO launch_items (
                id, launch_id, collectible_id, status, on_hold_by, on_hold_since, on_hold_until
            ) VALUES ($1, $2, $3, 'ON_HOLD', $4, $5, $6)
            RETURNING {}
            "#,
            ITEM_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(launch_id)
            .bind(collectible.id)
            .bind(hold.holder_id)
            .bind(hold.since)
            .bind(hold.until)
            .fetch_one(&mut *tx)
            .await?;
        let item = item_from_row(&row)?;

        if let Some(order_id) = order_id {
            let repointed = sqlx::query(
                "UPDATE orders SET launch_item_id = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(order_id)
            .bind(item.id)
            .execute(&mut *tx)
            .await?;
            if repointed.rows_affected() == 0 {
                return Err(AllocationError::OrderNotFound(order_id).into());
            }
        }

        tx.commit().await?;
        debug!(launch_id = %launch_id, nft_id, "Created on-demand item");
        Ok((item, collectible))
    }

    async fn set_collectible_cid(&self, collectible_id: Uuid, cid: &str) -> PipelineResult<()> {
        sqlx::query("UPDATE collectibles SET cid = $2 WHERE id = $1")
            .bind(collectible_id)
            .bind(cid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count_purchases(
        &self,
        launch_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        buyer_id: Uuid,
        buyer_address: &str,
    ) -> PipelineResult<u32> {
        Self::count_purchases_with(&self.pool, launch_id, from, to, buyer_id, buyer_address).await
    }

    async fn finalize_sale(&self, sale: &SaleRecord) -> PipelineResult<Purchase> {
        let mut tx = self.pool.begin().await?;

        let query = format!("SELECT {} FROM launch_items WHERE id = $1 FOR UPDATE", ITEM_COLUMNS);
        let row = sqlx::query(&query)
            .bind(sale.item_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AllocationError::ItemNotFound(sale.item_id))?;
        let item = item_from_row(&row)?;

        if item.status == crate::core::ItemStatus::Sold {
            return Err(AllocationError::AlreadySold { item_id: item.id }.into());
        }
        if !item.is_held_by(sale.holder_id) {
            return Err(AllocationError::NotHeldByYou { item_id: item.id }.into());
        }

        if let Some(limit) = &sale.limit {
            // Serializes concurrent sales of one buyer within a launch
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(format!("{}:{}", item.launch_id, sale.holder_id))
                .execute(&mut *tx)
                .await?;
            let purchased = Self::count_purchases_with(
                &mut *tx,
                item.launch_id,
                limit.window_start,
                limit.window_end,
                sale.holder_id,
                &sale.buyer_address,
            )
            .await?;
            if purchased >= limit.max_per_wallet {
                return Err(EligibilityError::WalletLimitReached {
                    phase: limit.phase.to_string(),
                    limit: limit.max_per_wallet,
                    purchased,
                }
                .into());
            }
        }

        Self::confirm_collectible(&mut tx, item.collectible_id, &sale.contract_address).await?;

        sqlx::query(
            r#"
            UPDATE launch_items
            SET status = 'SOLD', on_hold_by = NULL, on_hold_since = NULL, on_hold_until = NULL,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(sale.sold_at)
        .execute(&mut *tx)
        .await?;

        let query = format!(
            r#"
            INSERT INTO purchases (
                id, launch_id, launch_item_id, buyer_id, buyer_address, phase, price,
                tx_hash, purchased_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {}
            "#,
            PURCHASE_COLUMNS
        );
        let inserted = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(item.launch_id)
            .bind(item.id)
            .bind(sale.holder_id)
            .bind(sale.buyer_address.to_ascii_lowercase())
            .bind(sale.phase.map(|p| p.as_str()))
            .bind(sale.price)
            .bind(&sale.tx_hash)
            .bind(sale.sold_at)
            .fetch_one(&mut *tx)
            .await;
        let purchase = match inserted {
            Ok(row) => purchase_from_row(&row)?,
            Err(err) if is_unique_violation(&err) => {
                return Err(AllocationError::AlreadySold { item_id: item.id }.into())
            }
            Err(err) => return Err(err.into()),
        };

        if let Some(order_id) = sale.order_id {
            let result = sqlx::query(
                "UPDATE orders SET status = 'DONE', tx_hash = $2, updated_at = $3 WHERE id = $1",
            )
            .bind(order_id)
            .bind(&sale.tx_hash)
            .bind(sale.sold_at)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(AllocationError::OrderNotFound(order_id).into());
            }
        }

        tx.commit().await?;
        Ok(purchase)
    }

    async fn reconcile_minted(&self, reconciliation: &Reconciliation) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT launch_id, collectible_id FROM launch_items WHERE id = $1 FOR UPDATE",
        )
        .bind(reconciliation.item_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AllocationError::ItemNotFound(reconciliation.item_id))?;
        let launch_id: Uuid = row.get("launch_id");
        let collectible_id: Uuid = row.get("collectible_id");

        Self::confirm_collectible(&mut tx, collectible_id, &reconciliation.contract_address)
            .await?;

        sqlx::query(
            r#"
            UPDATE launch_items
            SET status = 'SOLD', on_hold_by = NULL, on_hold_since = NULL, on_hold_until = NULL,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(reconciliation.item_id)
        .bind(reconciliation.reconciled_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO purchases (
                id, launch_id, launch_item_id, buyer_id, buyer_address, phase, price,
                tx_hash, purchased_at
            ) VALUES ($1, $2, $3, NULL, $4, NULL, 0, NULL, $5)
            ON CONFLICT (launch_item_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(launch_id)
        .bind(reconciliation.item_id)
        .bind(reconciliation.owner_address.to_ascii_lowercase())
        .bind(reconciliation.reconciled_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        warn!(
            item_id = %reconciliation.item_id,
            owner = %reconciliation.owner_address,
            "Reconciled item minted outside the pipeline"
        );
        Ok(())
    }

    async fn purchases_for_item(&self, item_id: Uuid) -> PipelineResult<Vec<Purchase>> {
        let query = format!(
            "SELECT {} FROM purchases WHERE launch_item_id = $1 ORDER BY purchased_at",
            PURCHASE_COLUMNS
        );
        let rows = sqlx::query(&query)
            .bind(item_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(purchase_from_row).collect()
    }

    async fn insert_order(&self, order: &Order) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, buyer_id, collection_id, launch_id, launch_item_id, funding_address,
                funding_amount, status, tx_hash, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(order.id)
        .bind(order.buyer_id)
        .bind(order.collection_id)
        .bind(order.launch_id)
        .bind(order.launch_item_id)
        .bind(&order.funding_address)
        .bind(order.funding_amount)
        .bind(order.status.as_str())
        .bind(&order.tx_hash)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> PipelineResult<Option<Order>> {
        let query = format!("SELECT {} FROM orders WHERE id = $1", ORDER_COLUMNS);
        let row = sqlx::query(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn transition_order(
        &self,
        order_id: Uuid,
        from: &[OrderStatus],
        to: OrderStatus,
    ) -> PipelineResult<bool> {
        let from: Vec<&str> = from.iter().map(|status| status.as_str()).collect();
        let result = sqlx::query(
            "UPDATE orders SET status = $2, updated_at = NOW() WHERE id = $1 AND status = ANY($3)",
        )
        .bind(order_id)
        .bind(to.as_str())
        .bind(&from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_failed_mint(&self, failed: &FailedMint) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_mints (
                id, message_id, order_id, buyer_id, launch_item_id, attempts, error_kind,
                reason, payload, failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(failed.id)
        .bind(failed.message_id)
        .bind(failed.order_id)
        .bind(failed.buyer_id)
        .bind(failed.launch_item_id)
        .bind(failed.attempts as i32)
        .bind(&failed.error_kind)
        .bind(&failed.reason)
        .bind(&failed.payload)
        .bind(failed.failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WhitelistLookup for PostgresStore {
    async fn is_eligible(
        &self,
        launch_id: Uuid,
        phase: PhaseKind,
        address: &str,
    ) -> PipelineResult<bool> {
        let eligible: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM whitelist_entries
                WHERE launch_id = $1 AND phase = $2 AND address = lower($3)
            )
            "#,
        )
        .bind(launch_id)
        .bind(phase.as_str())
        .bind(address)
        .fetch_one(&self.pool)
        .await?;
        Ok(eligible)
    }
}

/// Durable queue on a `work_queue` table, leased with `FOR UPDATE SKIP LOCKED`
#[derive(Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    poll_interval: Duration,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    async fn lease(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> PipelineResult<Vec<ReceivedMessage>> {
        let rows = sqlx::query(
            r#"
            UPDATE work_queue
            SET receive_count = receive_count + 1,
                visible_at = NOW() + make_interval(secs => $2),
                receipt_handle = gen_random_uuid()
            WHERE id IN (
                SELECT id FROM work_queue
                WHERE visible_at <= NOW()
                ORDER BY id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING receipt_handle, receive_count, body
            "#,
        )
        .bind(max_messages as i64)
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Queue(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let handle: Uuid = row.get("receipt_handle");
                Ok(ReceivedMessage {
                    receipt_handle: handle.to_string(),
                    receive_count: non_negative("work_queue", row.get("receive_count"))?,
                    body: row.get("body"),
                })
            })
            .collect()
    }
}

#[async_trait]
impl WorkQueue for PostgresQueue {
    async fn send(&self, body: &str) -> PipelineResult<()> {
        sqlx::query("INSERT INTO work_queue (body) VALUES ($1)")
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Queue(e.to_string()))?;
        Ok(())
    }

    async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
        wait_time: Duration,
    ) -> PipelineResult<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + wait_time;
        loop {
            let messages = self.lease(max_messages, visibility_timeout).await?;
            if !messages.is_empty() || Instant::now() >= deadline {
                return Ok(messages);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn delete(&self, receipt_handle: &str) -> PipelineResult<()> {
        let handle = Uuid::parse_str(receipt_handle)
            .map_err(|e| StorageError::Queue(format!("bad receipt handle: {}", e)))?;
        sqlx::query("DELETE FROM work_queue WHERE receipt_handle = $1")
            .bind(handle)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Queue(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CollectibleStatus, ItemStatus};

    #[test]
    fn test_reservable_predicate_placeholders() {
        assert!(RESERVABLE.replace("$stale", "$4").contains("on_hold_until < $4"));
    }

    #[test]
    fn test_parse_text_reports_table() {
        let err = parse_text::<ItemStatus>("launch_items", "GONE").unwrap_err();
        assert!(err.to_string().contains("launch_items"));
        assert_eq!(
            parse_text::<CollectibleStatus>("collectibles", "CONFIRMED").unwrap(),
            CollectibleStatus::Confirmed
        );
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_queue_lease_roundtrip() {
        let store = PostgresStore::connect(&DatabaseConfig::default()).await.unwrap();
        let queue = PostgresQueue::new(store.pool().clone(), Duration::from_millis(50));
        queue.send("{}").await.unwrap();

        let received = queue
            .receive(1, Duration::from_secs(30), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].receive_count, 1);
        queue.delete(&received[0].receipt_handle).await.unwrap();
    }
}
