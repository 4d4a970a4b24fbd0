//! The external, database-backed stores named in §6. These are outside the
//! dispensing control loop's subject matter — the loop only needs the
//! narrow async method sets below — but they are real, tested
//! implementations rather than stubs, since the core cannot be exercised
//! without something behind these traits.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::models::{DrinkRecordRow, Fragment, Grant, Key, Keg, Policy, ThermoLogRow, User};
use super::models::UserRow;
use super::Database;

#[derive(Debug, Clone)]
pub struct KeyStore {
    db: Database,
}

impl KeyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn known_key(&self, token_id: u64) -> Result<bool> {
        Ok(self.get_key(token_id).await?.is_some())
    }

    pub async fn get_key(&self, token_id: u64) -> Result<Option<Key>> {
        let row: Option<Key> = sqlx::query_as("SELECT token_id, user_id FROM keys WHERE token_id = ?")
            .bind(token_id as i64)
            .fetch_optional(&self.db.pool)
            .await
            .context("get_key")?;
        Ok(row)
    }
}

#[derive(Debug, Clone)]
pub struct UserStore {
    db: Database,
}

impl UserStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User> {
        let row: UserRow =
            sqlx::query_as("SELECT id, name, weight_lbs, gender FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_one(&self.db.pool)
                .await
                .context("get_user")?;
        row.into_user().map_err(anyhow::Error::msg)
    }

    pub async fn add_user(&self, name: &str, weight_lbs: f64, gender: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO users (name, weight_lbs, gender) VALUES (?, ?, ?)")
            .bind(name)
            .bind(weight_lbs)
            .bind(gender)
            .execute(&self.db.pool)
            .await
            .context("add_user")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn bind_key(&self, token_id: u64, user_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO keys (token_id, user_id) VALUES (?, ?)
             ON CONFLICT(token_id) DO UPDATE SET user_id = excluded.user_id",
        )
        .bind(token_id as i64)
        .bind(user_id)
        .execute(&self.db.pool)
        .await
        .context("bind_key")?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GrantStore {
    db: Database,
}

impl GrantStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Fetch every grant belonging to `user_id`. Ordering into policy
    /// priority order is `GrantLedger`'s job, not the store's — this
    /// mirrors the original split between `get_grants` and `order_grants`.
    pub async fn get_grants(&self, user_id: i64) -> Result<Vec<Grant>> {
        let rows: Vec<Grant> = sqlx::query_as(
            "SELECT id, user_id, policy_id, unit_cost_per_ounce, allowance_ounces, expires_at
             FROM grants WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await
        .context("get_grants")?;
        Ok(rows)
    }

    pub async fn get_policy(&self, policy_id: i64) -> Result<Policy> {
        let row: Policy = sqlx::query_as(
            "SELECT id, description, unit_cost_per_ounce FROM policies WHERE id = ?",
        )
        .bind(policy_id)
        .fetch_one(&self.db.pool)
        .await
        .context("get_policy")?;
        Ok(row)
    }
}

#[derive(Debug, Clone)]
pub struct KegStore {
    db: Database,
}

impl KegStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get_current_keg(&self) -> Result<Keg> {
        let row: Keg = sqlx::query_as(
            "SELECT id, alcohol_content_percent, ticks_per_ounce, is_current
             FROM kegs WHERE is_current = 1 LIMIT 1",
        )
        .fetch_one(&self.db.pool)
        .await
        .context("get_current_keg")?;
        Ok(row)
    }
}

#[derive(Debug, Clone)]
pub struct DrinkStore {
    db: Database,
}

impl DrinkStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// `(prior_bac, prior_time)`, used by `PourSession` to decompose the
    /// user's standing BAC forward to "now" before adding this pour's
    /// contribution. A user with no prior drinks has `prior_bac = 0`.
    pub async fn get_last_drink(&self, user_id: i64) -> Result<(f64, DateTime<Utc>)> {
        let row: Option<(f64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT bac, recorded_at FROM drinks WHERE user_id = ? ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.db.pool)
        .await
        .context("get_last_drink")?;
        Ok(row.unwrap_or((0.0, Utc::now())))
    }

    /// Persist a completed pour in one terminal write, matching
    /// `DrinkRecord.emit(total_ticks, last_grant, last_grant_ticks, bac)`.
    /// Fragment accumulation happens in memory inside `PourSession`; the
    /// store only ever sees the final, complete record.
    pub async fn emit(
        &self,
        user_id: i64,
        keg_id: i64,
        total_ticks: i64,
        last_grant_id: i64,
        last_grant_ticks: i64,
        bac: f64,
        fragments: &[Fragment],
    ) -> Result<DrinkRecordRow> {
        let fragments_json = serde_json::to_string(fragments).context("serialize fragments")?;
        let result = sqlx::query(
            "INSERT INTO drinks
                (user_id, keg_id, total_ticks, last_grant_id, last_grant_ticks, bac, fragments_json, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
        )
        .bind(user_id)
        .bind(keg_id)
        .bind(total_ticks)
        .bind(last_grant_id)
        .bind(last_grant_ticks)
        .bind(bac)
        .bind(&fragments_json)
        .execute(&self.db.pool)
        .await
        .context("emit drink record")?;

        let row: DrinkRecordRow = sqlx::query_as(
            "SELECT id, user_id, keg_id, total_ticks, last_grant_id, last_grant_ticks, bac,
                    fragments_json, recorded_at
             FROM drinks WHERE id = ?",
        )
        .bind(result.last_insert_rowid())
        .fetch_one(&self.db.pool)
        .await
        .context("reload emitted drink record")?;
        Ok(row)
    }
}

#[derive(Debug, Clone)]
pub struct ThermoStore {
    db: Database,
}

impl ThermoStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn log_reading(&self, sensor_id: i64, temp_c: f64) -> Result<()> {
        sqlx::query("INSERT INTO thermologs (sensor_id, temp_c, recorded_at) VALUES (?, ?, datetime('now'))")
            .bind(sensor_id)
            .bind(temp_c)
            .execute(&self.db.pool)
            .await
            .context("log_reading")?;
        Ok(())
    }

    pub async fn last_reading(&self, sensor_id: i64) -> Result<Option<ThermoLogRow>> {
        let row: Option<ThermoLogRow> = sqlx::query_as(
            "SELECT id, sensor_id, temp_c, recorded_at FROM thermologs
             WHERE sensor_id = ? ORDER BY recorded_at DESC LIMIT 1",
        )
        .bind(sensor_id)
        .fetch_optional(&self.db.pool)
        .await
        .context("last_reading")?;
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn key_store_round_trip() {
        let db = Database::test_db().await;
        let users = UserStore::new(db.clone());
        let keys = KeyStore::new(db.clone());

        let uid = users.add_user("ace", 180.0, "male").await.unwrap();
        users.bind_key(0xA1, uid).await.unwrap();

        assert!(keys.known_key(0xA1).await.unwrap());
        assert!(!keys.known_key(0xB2).await.unwrap());
        let key = keys.get_key(0xA1).await.unwrap().unwrap();
        assert_eq!(key.user_id, uid);
    }

    #[tokio::test]
    async fn user_store_round_trip() {
        let db = Database::test_db().await;
        let users = UserStore::new(db);
        let uid = users.add_user("mox", 140.0, "female").await.unwrap();
        let u = users.get_user(uid).await.unwrap();
        assert_eq!(u.name, "mox");
        assert_eq!(u.gender, crate::db::models::Gender::Female);
    }

    #[tokio::test]
    async fn keg_store_requires_a_current_keg() {
        let db = Database::test_db().await;
        sqlx::query(
            "INSERT INTO kegs (alcohol_content_percent, ticks_per_ounce, is_current)
             VALUES (5.0, 100.0, 1)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let kegs = KegStore::new(db);
        let keg = kegs.get_current_keg().await.unwrap();
        assert!(keg.is_current);
        assert_eq!(keg.drink_ounces(1200), 12.0);
    }

    #[tokio::test]
    async fn drink_store_emits_and_reloads() {
        let db = Database::test_db().await;
        let users = UserStore::new(db.clone());
        let uid = users.add_user("ace", 180.0, "male").await.unwrap();
        sqlx::query(
            "INSERT INTO kegs (alcohol_content_percent, ticks_per_ounce, is_current)
             VALUES (5.0, 100.0, 1)",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let drinks = DrinkStore::new(db.clone());
        let row = drinks
            .emit(uid, 1, 1200, 1, 400, 0.04, &[Fragment { grant_id: 1, ticks: 800 }])
            .await
            .unwrap();
        assert_eq!(row.total_ticks, 1200);

        let (prior_bac, _) = drinks.get_last_drink(uid).await.unwrap();
        assert_eq!(prior_bac, 0.04);
    }

    #[tokio::test]
    async fn get_last_drink_defaults_to_zero_for_new_user() {
        let db = Database::test_db().await;
        let drinks = DrinkStore::new(db);
        let (prior_bac, _) = drinks.get_last_drink(999).await.unwrap();
        assert_eq!(prior_bac, 0.0);
    }
}
