//! Allocation bindings.
//!
//! `holder` is NULL for a free allocation, a reservation id while a claim is
//! in flight, and an instance id once the server exists.

use async_trait::async_trait;
use berth_id::{AllocationId, InstanceId, NodeId, ReservationId};

use super::{parse_id, PgStore};
use crate::model::{Allocation, AllocationHolder};
use crate::store::{AllocationStore, StoreError, StoreResult};

#[async_trait]
impl AllocationStore for PgStore {
    async fn allocation(&self, id: AllocationId) -> StoreResult<Option<Allocation>> {
        let row = sqlx::query_as::<_, AllocationRow>(
            r#"
            SELECT allocation_id, node_id, ip, port, holder
            FROM allocations
            WHERE allocation_id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Allocation::try_from).transpose()
    }

    async fn free_allocations(&self, node: NodeId) -> StoreResult<Vec<Allocation>> {
        let rows = sqlx::query_as::<_, AllocationRow>(
            r#"
            SELECT allocation_id, node_id, ip, port, holder
            FROM allocations
            WHERE node_id = $1 AND holder IS NULL
            ORDER BY allocation_id
            "#,
        )
        .bind(node.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Allocation::try_from).collect()
    }

    async fn try_claim(&self, allocation: AllocationId, claim: ReservationId) -> StoreResult<bool> {
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE allocations
            SET holder = $2, updated_at = now()
            WHERE allocation_id = $1 AND holder IS NULL
            RETURNING allocation_id
            "#,
        )
        .bind(allocation.to_string())
        .bind(claim.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(true);
        }

        let exists: Option<String> =
            sqlx::query_scalar("SELECT allocation_id FROM allocations WHERE allocation_id = $1")
                .bind(allocation.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(allocation.to_string())),
        }
    }

    async fn release_claim(
        &self,
        allocation: AllocationId,
        claim: ReservationId,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE allocations
            SET holder = NULL, updated_at = now()
            WHERE allocation_id = $1 AND holder = $2
            "#,
        )
        .bind(allocation.to_string())
        .bind(claim.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finalize(
        &self,
        allocation: AllocationId,
        claim: ReservationId,
        instance: InstanceId,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE allocations
            SET holder = $3, updated_at = now()
            WHERE allocation_id = $1 AND holder = $2
            "#,
        )
        .bind(allocation.to_string())
        .bind(claim.to_string())
        .bind(instance.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[derive(Debug)]
struct AllocationRow {
    allocation_id: String,
    node_id: String,
    ip: String,
    port: i32,
    holder: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AllocationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            allocation_id: row.try_get("allocation_id")?,
            node_id: row.try_get("node_id")?,
            ip: row.try_get("ip")?,
            port: row.try_get("port")?,
            holder: row.try_get("holder")?,
        })
    }
}

impl TryFrom<AllocationRow> for Allocation {
    type Error = StoreError;

    fn try_from(row: AllocationRow) -> Result<Self, Self::Error> {
        let port = u16::try_from(row.port)
            .map_err(|_| StoreError::Corrupt(format!("port {} out of range", row.port)))?;

        let holder = match row.holder.as_deref() {
            None => None,
            Some(raw) => Some(
                AllocationHolder::parse(raw)
                    .ok_or_else(|| StoreError::Corrupt(format!("holder '{raw}'")))?,
            ),
        };

        Ok(Self {
            id: parse_id("allocation_id", &row.allocation_id)?,
            node_id: parse_id("node_id", &row.node_id)?,
            ip: row.ip,
            port,
            holder,
        })
    }
}
