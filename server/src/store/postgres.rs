//! PostgreSQL store.
//!
//! The transactional source of truth. The schema is created on connect if it
//! does not exist. Rows are mapped by hand; unique violations surface as
//! conflicts, every other driver error as a transient backend failure.

use crate::error::{StoreError, StoreResult};
use crate::game::{EntityUpdate, TickResult};
use crate::store::{
    patched_entity, AppliedDeltas, NewEntity, NewPlayer, NewZone, Player, Session, Store,
    ZoneSession,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;
use shared::{Entity, Zone};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and initialize the schema.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS zones (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                metadata JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS entities (
                id UUID PRIMARY KEY,
                zone_id UUID NOT NULL REFERENCES zones(id) ON DELETE CASCADE,
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                width INTEGER NOT NULL DEFAULT 0,
                height INTEGER NOT NULL DEFAULT 0,
                metadata JSONB,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_entities_zone ON entities(zone_id)",
            r#"
            CREATE TABLE IF NOT EXISTS players (
                id UUID PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                is_debug BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                last_login TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id UUID PRIMARY KEY,
                player_id UUID NOT NULL REFERENCES players(id) ON DELETE CASCADE,
                token TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sessions_token ON sessions(token)",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        // 23505 = unique_violation
        if db.code().as_deref() == Some("23505") {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Backend(err.to_string())
}

fn row_to_zone(row: &PgRow) -> StoreResult<Zone> {
    Ok(Zone {
        id: row.try_get("id").map_err(map_sqlx)?,
        name: row.try_get("name").map_err(map_sqlx)?,
        width: row.try_get("width").map_err(map_sqlx)?,
        height: row.try_get("height").map_err(map_sqlx)?,
        metadata: row.try_get("metadata").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

fn row_to_entity(row: &PgRow) -> StoreResult<Entity> {
    Ok(Entity {
        id: row.try_get("id").map_err(map_sqlx)?,
        zone_id: row.try_get("zone_id").map_err(map_sqlx)?,
        x: row.try_get("x").map_err(map_sqlx)?,
        y: row.try_get("y").map_err(map_sqlx)?,
        width: row.try_get("width").map_err(map_sqlx)?,
        height: row.try_get("height").map_err(map_sqlx)?,
        metadata: row.try_get("metadata").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

fn row_to_player(row: &PgRow) -> StoreResult<Player> {
    Ok(Player {
        id: row.try_get("id").map_err(map_sqlx)?,
        username: row.try_get("username").map_err(map_sqlx)?,
        password_hash: row.try_get("password_hash").map_err(map_sqlx)?,
        is_debug: row.try_get("is_debug").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        last_login: row.try_get("last_login").map_err(map_sqlx)?,
    })
}

fn row_to_session(row: &PgRow) -> StoreResult<Session> {
    Ok(Session {
        id: row.try_get("id").map_err(map_sqlx)?,
        player_id: row.try_get("player_id").map_err(map_sqlx)?,
        token: row.try_get("token").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        expires_at: row.try_get("expires_at").map_err(map_sqlx)?,
    })
}

const INSERT_ENTITY: &str = r#"
    INSERT INTO entities (id, zone_id, x, y, width, height, metadata, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
"#;

const UPDATE_ENTITY: &str = r#"
    UPDATE entities SET x = $2, y = $3, width = $4, height = $5, metadata = $6, updated_at = $7
    WHERE id = $1
"#;

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> StoreResult<Box<dyn ZoneSession>> {
        let tx = self.pool.begin().await.map_err(map_sqlx)?;
        Ok(Box::new(PgZoneSession { tx }))
    }

    async fn create_zone(&self, new: NewZone) -> StoreResult<Zone> {
        let now = Utc::now();
        let zone = Zone {
            id: Uuid::new_v4(),
            name: new.name,
            width: new.width,
            height: new.height,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            r#"
            INSERT INTO zones (id, name, width, height, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(zone.id)
        .bind(&zone.name)
        .bind(zone.width)
        .bind(zone.height)
        .bind(&zone.metadata)
        .bind(zone.created_at)
        .bind(zone.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(zone)
    }

    async fn get_zone(&self, zone_id: Uuid) -> StoreResult<Option<Zone>> {
        let row = sqlx::query("SELECT * FROM zones WHERE id = $1")
            .bind(zone_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_zone).transpose()
    }

    async fn list_zones(&self) -> StoreResult<Vec<Zone>> {
        let rows = sqlx::query("SELECT * FROM zones ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(row_to_zone).collect()
    }

    async fn delete_zone(&self, zone_id: Uuid) -> StoreResult<bool> {
        let done = sqlx::query("DELETE FROM zones WHERE id = $1")
            .bind(zone_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(done.rows_affected() > 0)
    }

    async fn create_entity(&self, new: NewEntity) -> StoreResult<Entity> {
        let now = Utc::now();
        let entity = Entity {
            id: Uuid::new_v4(),
            zone_id: new.zone_id,
            x: new.x,
            y: new.y,
            width: new.width,
            height: new.height,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(INSERT_ENTITY)
            .bind(entity.id)
            .bind(entity.zone_id)
            .bind(entity.x)
            .bind(entity.y)
            .bind(entity.width)
            .bind(entity.height)
            .bind(&entity.metadata)
            .bind(entity.created_at)
            .bind(entity.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(entity)
    }

    async fn get_entity(&self, entity_id: Uuid) -> StoreResult<Option<Entity>> {
        let row = sqlx::query("SELECT * FROM entities WHERE id = $1")
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_entity).transpose()
    }

    async fn zone_entities(&self, zone_id: Uuid) -> StoreResult<Vec<Entity>> {
        let rows =
            sqlx::query("SELECT * FROM entities WHERE zone_id = $1 ORDER BY created_at, id")
                .bind(zone_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
        rows.iter().map(row_to_entity).collect()
    }

    async fn update_entity(&self, update: &EntityUpdate) -> StoreResult<Option<Entity>> {
        let existing = match self.get_entity(update.id).await? {
            Some(entity) => entity,
            None => return Ok(None),
        };
        let patched = patched_entity(&existing, update, Utc::now());
        sqlx::query(UPDATE_ENTITY)
            .bind(patched.id)
            .bind(patched.x)
            .bind(patched.y)
            .bind(patched.width)
            .bind(patched.height)
            .bind(&patched.metadata)
            .bind(patched.updated_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(Some(patched))
    }

    async fn delete_entity(&self, entity_id: Uuid) -> StoreResult<bool> {
        let done = sqlx::query("DELETE FROM entities WHERE id = $1")
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(done.rows_affected() > 0)
    }

    async fn create_player(&self, new: NewPlayer) -> StoreResult<Player> {
        let player = Player {
            id: Uuid::new_v4(),
            username: new.username,
            password_hash: new.password_hash,
            is_debug: new.is_debug,
            created_at: Utc::now(),
            last_login: None,
        };
        sqlx::query(
            r#"
            INSERT INTO players (id, username, password_hash, is_debug, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(player.id)
        .bind(&player.username)
        .bind(&player.password_hash)
        .bind(player.is_debug)
        .bind(player.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(player)
    }

    async fn get_player(&self, player_id: Uuid) -> StoreResult<Option<Player>> {
        let row = sqlx::query("SELECT * FROM players WHERE id = $1")
            .bind(player_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_player).transpose()
    }

    async fn find_player_by_username(&self, username: &str) -> StoreResult<Option<Player>> {
        let row = sqlx::query("SELECT * FROM players WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_player).transpose()
    }

    async fn record_login(&self, player_id: Uuid) -> StoreResult<()> {
        sqlx::query("UPDATE players SET last_login = $2 WHERE id = $1")
            .bind(player_id)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn create_session(
        &self,
        player_id: Uuid,
        token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<Session> {
        let session = Session {
            id: Uuid::new_v4(),
            player_id,
            token: token.to_string(),
            created_at: Utc::now(),
            expires_at,
        };
        sqlx::query(
            r#"
            INSERT INTO sessions (id, player_id, token, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.id)
        .bind(session.player_id)
        .bind(&session.token)
        .bind(session.created_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(session)
    }

    async fn find_session(&self, token: &str) -> StoreResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn delete_session(&self, token: &str) -> StoreResult<bool> {
        let done = sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(done.rows_affected() > 0)
    }
}

/// One pooled transaction wrapping a zone's tick work.
struct PgZoneSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl ZoneSession for PgZoneSession {
    async fn get_zone(&mut self, zone_id: Uuid) -> StoreResult<Option<Zone>> {
        let row = sqlx::query("SELECT * FROM zones WHERE id = $1")
            .bind(zone_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(row_to_zone).transpose()
    }

    async fn list_entities(&mut self, zone_id: Uuid) -> StoreResult<Vec<Entity>> {
        let rows =
            sqlx::query("SELECT * FROM entities WHERE zone_id = $1 ORDER BY created_at, id")
                .bind(zone_id)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
        rows.iter().map(row_to_entity).collect()
    }

    async fn apply_deltas(
        &mut self,
        zone: &Zone,
        result: &TickResult,
    ) -> StoreResult<AppliedDeltas> {
        let now = Utc::now();
        let mut applied = AppliedDeltas::default();

        for create in &result.creates {
            if !zone.is_entity_in_bounds(create.x, create.y, create.width, create.height) {
                warn!(
                    "zone {}: dropping out-of-bounds create at ({}, {})",
                    zone.id, create.x, create.y
                );
                applied.skipped += 1;
                continue;
            }
            let entity = Entity {
                id: Uuid::new_v4(),
                zone_id: zone.id,
                x: create.x,
                y: create.y,
                width: create.width,
                height: create.height,
                metadata: create.metadata.clone(),
                created_at: now,
                updated_at: now,
            };
            sqlx::query(INSERT_ENTITY)
                .bind(entity.id)
                .bind(entity.zone_id)
                .bind(entity.x)
                .bind(entity.y)
                .bind(entity.width)
                .bind(entity.height)
                .bind(&entity.metadata)
                .bind(entity.created_at)
                .bind(entity.updated_at)
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
            applied.created.push(entity);
        }

        for update in &result.updates {
            let row = sqlx::query("SELECT * FROM entities WHERE id = $1 AND zone_id = $2")
                .bind(update.id)
                .bind(zone.id)
                .fetch_optional(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
            let existing = match row.as_ref().map(row_to_entity).transpose()? {
                Some(entity) => entity,
                None => {
                    applied.skipped += 1;
                    continue;
                }
            };
            let patched = patched_entity(&existing, update, now);
            if !zone.is_entity_in_bounds(patched.x, patched.y, patched.width, patched.height) {
                warn!(
                    "zone {}: dropping out-of-bounds update for entity {}",
                    zone.id, update.id
                );
                applied.skipped += 1;
                continue;
            }
            sqlx::query(UPDATE_ENTITY)
                .bind(patched.id)
                .bind(patched.x)
                .bind(patched.y)
                .bind(patched.width)
                .bind(patched.height)
                .bind(&patched.metadata)
                .bind(patched.updated_at)
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
            applied.updated.push(patched);
        }

        for entity_id in &result.deletes {
            sqlx::query("DELETE FROM entities WHERE id = $1 AND zone_id = $2")
                .bind(entity_id)
                .bind(zone.id)
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx)?;
        }

        Ok(applied)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await.map_err(map_sqlx)
    }
}
