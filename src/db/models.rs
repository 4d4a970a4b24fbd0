use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A user's gender, which feeds directly into the BAC water-fraction
/// constant (`instant_bac`). Anything else is rejected at the row-mapping
/// boundary rather than silently defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn water_fraction(self) -> f64 {
        match self {
            Gender::Male => 0.58,
            Gender::Female => 0.49,
        }
    }
}

impl std::str::FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            other => Err(format!("unknown gender: {other}")),
        }
    }
}

/// {id, name, weight (lbs, 0 means unknown), gender}. Opaque to the core
/// except where BAC math needs weight and gender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub weight_lbs: f64,
    pub gender: Gender,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct UserRow {
    pub id: i64,
    pub name: String,
    pub weight_lbs: f64,
    pub gender: String,
}

impl UserRow {
    pub fn into_user(self) -> Result<User, String> {
        Ok(User {
            id: self.id,
            name: self.name,
            weight_lbs: self.weight_lbs,
            gender: self.gender.parse()?,
        })
    }
}

/// Persistent association {token_id → user_id}.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Key {
    pub token_id: i64,
    pub user_id: i64,
}

/// {id, description, unit_cost_per_ounce}. Opaque to the ledger except for
/// the cost used to order grants.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Policy {
    pub id: i64,
    pub description: String,
    pub unit_cost_per_ounce: f64,
}

/// {id, user_id, policy, remaining_allowance, expiry predicate}. A grant
/// has two independent expiration senses: time and volume. The ledger
/// queries both; see `GrantLedger`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Grant {
    pub id: i64,
    pub user_id: i64,
    pub policy_id: i64,
    pub unit_cost_per_ounce: f64,
    pub allowance_ounces: f64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Grant {
    /// Policy-priority ordering key: lowest cost first, ties broken by id.
    pub fn priority_key(&self) -> (f64, i64) {
        (self.unit_cost_per_ounce, self.id)
    }

    pub fn is_time_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(t) if now >= t)
    }

    /// True once the grant's allowance is at or below what has already
    /// been consumed against it during this pour.
    pub fn is_volume_exhausted(&self, ounces_consumed: f64) -> bool {
        ounces_consumed >= self.allowance_ounces
    }
}

/// {id, alcohol_content_percent, ticks_per_ounce}. Exactly one keg is
/// "current" at any time.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Keg {
    pub id: i64,
    pub alcohol_content_percent: f64,
    pub ticks_per_ounce: f64,
    pub is_current: bool,
}

impl Keg {
    pub fn drink_ounces(&self, ticks: u32) -> f64 {
        if self.ticks_per_ounce <= 0.0 {
            return 0.0;
        }
        ticks as f64 / self.ticks_per_ounce
    }
}

/// A persisted, completed pour. `fragments_json` stores the
/// `(grant_id, ticks)` pairs produced as the pour crossed grant
/// boundaries, serialized because the fragment count is variable and this
/// row is write-once at `DrinkRecord::emit`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DrinkRecordRow {
    pub id: i64,
    pub user_id: i64,
    pub keg_id: i64,
    pub total_ticks: i64,
    pub last_grant_id: i64,
    pub last_grant_ticks: i64,
    pub bac: f64,
    pub fragments_json: String,
    pub recorded_at: DateTime<Utc>,
}

/// A single `(grant_id, ticks_consumed_against_it)` fragment, as stored in
/// `DrinkRecordRow::fragments_json`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Fragment {
    pub grant_id: i64,
    pub ticks: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ThermoLogRow {
    pub id: i64,
    pub sensor_id: i64,
    pub temp_c: f64,
    pub recorded_at: DateTime<Utc>,
}
