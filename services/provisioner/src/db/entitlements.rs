//! Entitlement counters.
//!
//! `activated_count` only ever moves through the two guarded updates below,
//! so the `0 <= activated <= purchased` bound holds under any interleaving.

use async_trait::async_trait;
use berth_id::{PlanId, UserId};
use chrono::{DateTime, Utc};

use super::{parse_id, PgStore};
use crate::model::Entitlement;
use crate::store::{ActivateOutcome, EntitlementStore, StoreError, StoreResult};

#[async_trait]
impl EntitlementStore for PgStore {
    async fn entitlement(&self, user: UserId, plan_name: &str) -> StoreResult<Option<Entitlement>> {
        let row = sqlx::query_as::<_, EntitlementRow>(
            r#"
            SELECT user_id, plan_name, purchased_count, activated_count,
                   plan_id, first_activated_on, last_activated_on
            FROM entitlements
            WHERE user_id = $1 AND plan_name = $2
            "#,
        )
        .bind(user.to_string())
        .bind(plan_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Entitlement::try_from).transpose()
    }

    async fn try_activate(&self, user: UserId, plan_name: &str) -> StoreResult<ActivateOutcome> {
        let activated: Option<(i32, i32)> = sqlx::query_as(
            r#"
            UPDATE entitlements
            SET activated_count = activated_count + 1
            WHERE user_id = $1 AND plan_name = $2 AND activated_count < purchased_count
            RETURNING activated_count, purchased_count
            "#,
        )
        .bind(user.to_string())
        .bind(plan_name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some((activated, purchased)) = activated {
            return Ok(ActivateOutcome::Activated {
                activated,
                purchased,
            });
        }

        // Nothing moved: either no purchase exists or the quota is used up.
        let purchased: Option<i32> = sqlx::query_scalar(
            "SELECT purchased_count FROM entitlements WHERE user_id = $1 AND plan_name = $2",
        )
        .bind(user.to_string())
        .bind(plan_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match purchased {
            Some(purchased) => ActivateOutcome::Exhausted { purchased },
            None => ActivateOutcome::NotOwned,
        })
    }

    async fn deactivate(&self, user: UserId, plan_name: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements
            SET activated_count = activated_count - 1
            WHERE user_id = $1 AND plan_name = $2 AND activated_count > 0
            "#,
        )
        .bind(user.to_string())
        .bind(plan_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_activation(
        &self,
        user: UserId,
        plan_name: &str,
        plan_id: PlanId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE entitlements
            SET plan_id = $3,
                first_activated_on = COALESCE(first_activated_on, $4),
                last_activated_on = $4
            WHERE user_id = $1 AND plan_name = $2
            "#,
        )
        .bind(user.to_string())
        .bind(plan_name)
        .bind(plan_id.to_string())
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "entitlement {user}/{plan_name}"
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct EntitlementRow {
    user_id: String,
    plan_name: String,
    purchased_count: i32,
    activated_count: i32,
    plan_id: Option<String>,
    first_activated_on: Option<DateTime<Utc>>,
    last_activated_on: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EntitlementRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            user_id: row.try_get("user_id")?,
            plan_name: row.try_get("plan_name")?,
            purchased_count: row.try_get("purchased_count")?,
            activated_count: row.try_get("activated_count")?,
            plan_id: row.try_get("plan_id")?,
            first_activated_on: row.try_get("first_activated_on")?,
            last_activated_on: row.try_get("last_activated_on")?,
        })
    }
}

impl TryFrom<EntitlementRow> for Entitlement {
    type Error = StoreError;

    fn try_from(row: EntitlementRow) -> Result<Self, Self::Error> {
        let plan_id = row
            .plan_id
            .as_deref()
            .map(|raw| parse_id("plan_id", raw))
            .transpose()?;

        Ok(Self {
            user_id: parse_id("user_id", &row.user_id)?,
            plan_name: row.plan_name,
            purchased_count: row.purchased_count,
            activated_count: row.activated_count,
            plan_id,
            first_activated_on: row.first_activated_on,
            last_activated_on: row.last_activated_on,
        })
    }
}
