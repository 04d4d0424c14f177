//! Catalog reads.

use async_trait::async_trait;
use berth_id::{EggId, LocationId};
use sqlx::types::Json;

use super::{parse_id, PgStore};
use crate::model::{Egg, EggVariable, Location, Node, Plan};
use crate::store::{CatalogStore, StoreError, StoreResult};

#[async_trait]
impl CatalogStore for PgStore {
    async fn plan_by_name(&self, name: &str) -> StoreResult<Option<Plan>> {
        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT plan_id, name, cpu, memory, disk, servers, allocations, databases, backups, trial
            FROM plans
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Plan::try_from).transpose()
    }

    async fn egg(&self, id: EggId) -> StoreResult<Option<Egg>> {
        let row = sqlx::query_as::<_, EggRow>(
            "SELECT egg_id, name, description, startup, docker_images FROM eggs WHERE egg_id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let variables = self.egg_variables(&row.egg_id).await?;
        row.into_egg(variables).map(Some)
    }

    async fn eggs(&self) -> StoreResult<Vec<Egg>> {
        let rows = sqlx::query_as::<_, EggRow>(
            "SELECT egg_id, name, description, startup, docker_images FROM eggs ORDER BY egg_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut eggs = Vec::with_capacity(rows.len());
        for row in rows {
            let variables = self.egg_variables(&row.egg_id).await?;
            eggs.push(row.into_egg(variables)?);
        }
        Ok(eggs)
    }

    async fn location(&self, id: LocationId) -> StoreResult<Option<Location>> {
        let row = sqlx::query_as::<_, LocationRow>(
            r#"
            SELECT location_id, short, required_plans, max_servers
            FROM locations
            WHERE location_id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Location::try_from).transpose()
    }

    async fn locations(&self) -> StoreResult<Vec<Location>> {
        let rows = sqlx::query_as::<_, LocationRow>(
            r#"
            SELECT location_id, short, required_plans, max_servers
            FROM locations
            ORDER BY location_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Location::try_from).collect()
    }

    async fn public_nodes(&self, location: LocationId) -> StoreResult<Vec<Node>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT node_id, location_id, name, public
            FROM nodes
            WHERE location_id = $1 AND public
            ORDER BY node_id
            "#,
        )
        .bind(location.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Node::try_from).collect()
    }

    async fn bound_count(&self, location: LocationId) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)::BIGINT
            FROM allocations a
            JOIN nodes n ON n.node_id = a.node_id
            WHERE n.location_id = $1 AND a.holder IS NOT NULL
            "#,
        )
        .bind(location.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

impl PgStore {
    async fn egg_variables(&self, egg_id: &str) -> StoreResult<Vec<EggVariable>> {
        let rows = sqlx::query_as::<_, EggVariableRow>(
            r#"
            SELECT name, env_variable, default_value
            FROM egg_variables
            WHERE egg_id = $1
            ORDER BY sort, env_variable
            "#,
        )
        .bind(egg_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| EggVariable {
                name: r.name,
                env_variable: r.env_variable,
                default_value: r.default_value,
            })
            .collect())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(Debug)]
struct PlanRow {
    plan_id: String,
    name: String,
    cpu: i64,
    memory: i64,
    disk: i64,
    servers: i32,
    allocations: i32,
    databases: i32,
    backups: i32,
    trial: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for PlanRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            plan_id: row.try_get("plan_id")?,
            name: row.try_get("name")?,
            cpu: row.try_get("cpu")?,
            memory: row.try_get("memory")?,
            disk: row.try_get("disk")?,
            servers: row.try_get("servers")?,
            allocations: row.try_get("allocations")?,
            databases: row.try_get("databases")?,
            backups: row.try_get("backups")?,
            trial: row.try_get("trial")?,
        })
    }
}

impl TryFrom<PlanRow> for Plan {
    type Error = StoreError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id("plan_id", &row.plan_id)?,
            name: row.name,
            cpu: row.cpu,
            memory: row.memory,
            disk: row.disk,
            servers: row.servers,
            allocations: row.allocations,
            databases: row.databases,
            backups: row.backups,
            trial: row.trial,
        })
    }
}

#[derive(Debug)]
struct EggRow {
    egg_id: String,
    name: String,
    description: String,
    startup: String,
    docker_images: Json<Vec<String>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EggRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            egg_id: row.try_get("egg_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            startup: row.try_get("startup")?,
            docker_images: row.try_get("docker_images")?,
        })
    }
}

impl EggRow {
    fn into_egg(self, variables: Vec<EggVariable>) -> StoreResult<Egg> {
        Ok(Egg {
            id: parse_id("egg_id", &self.egg_id)?,
            name: self.name,
            description: self.description,
            startup: self.startup,
            docker_images: self.docker_images.0,
            variables,
        })
    }
}

#[derive(Debug)]
struct EggVariableRow {
    name: String,
    env_variable: String,
    default_value: Option<String>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EggVariableRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            name: row.try_get("name")?,
            env_variable: row.try_get("env_variable")?,
            default_value: row.try_get("default_value")?,
        })
    }
}

#[derive(Debug)]
struct LocationRow {
    location_id: String,
    short: String,
    required_plans: Vec<String>,
    max_servers: i32,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LocationRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            location_id: row.try_get("location_id")?,
            short: row.try_get("short")?,
            required_plans: row.try_get("required_plans")?,
            max_servers: row.try_get("max_servers")?,
        })
    }
}

impl TryFrom<LocationRow> for Location {
    type Error = StoreError;

    fn try_from(row: LocationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id("location_id", &row.location_id)?,
            short: row.short,
            required_plans: row.required_plans,
            max_servers: row.max_servers,
        })
    }
}

#[derive(Debug)]
struct NodeRow {
    node_id: String,
    location_id: String,
    name: String,
    public: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for NodeRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            node_id: row.try_get("node_id")?,
            location_id: row.try_get("location_id")?,
            name: row.try_get("name")?,
            public: row.try_get("public")?,
        })
    }
}

impl TryFrom<NodeRow> for Node {
    type Error = StoreError;

    fn try_from(row: NodeRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: parse_id("node_id", &row.node_id)?,
            location_id: parse_id("location_id", &row.location_id)?,
            name: row.name,
            public: row.public,
        })
    }
}
