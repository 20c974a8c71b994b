use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::ships;
use crate::database::utils::{bool_to_int, int_to_bool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ShipStatus {
    Creating,
    Running,
    Stopped,
}

impl ShipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipStatus::Creating => "Creating",
            ShipStatus::Running => "Running",
            ShipStatus::Stopped => "Stopped",
        }
    }
}

impl std::str::FromStr for ShipStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Creating" => Ok(ShipStatus::Creating),
            "Running" => Ok(ShipStatus::Running),
            "Stopped" => Ok(ShipStatus::Stopped),
            other => Err(format!("unknown ship status: {other}")),
        }
    }
}

/// Diesel-level row (§3 Ship).
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ships)]
pub struct ShipRow {
    pub id: String,
    pub status: String,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub driver: String,
    pub image: String,
    pub cpus: f64,
    pub memory: String,
    pub disk: Option<String>,
    pub ttl_secs: i32,
    pub warm_pool: i32,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: Option<String>,
}

/// Typed Ship with boolean/enum conversions, the shape handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShipData {
    pub id: String,
    pub status: ShipStatus,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub driver: String,
    pub image: String,
    pub cpus: f64,
    pub memory: String,
    pub disk: Option<String>,
    pub ttl_secs: i32,
    pub warm_pool: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<ShipRow> for ShipData {
    type Error = String;

    fn try_from(row: ShipRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            status: row.status.parse()?,
            container_id: row.container_id,
            endpoint: row.endpoint,
            driver: row.driver,
            image: row.image,
            cpus: row.cpus,
            memory: row.memory,
            disk: row.disk,
            ttl_secs: row.ttl_secs,
            warm_pool: int_to_bool(row.warm_pool),
            created_at: parse_rfc3339(&row.created_at)?,
            updated_at: parse_rfc3339(&row.updated_at)?,
            expires_at: row.expires_at.as_deref().map(parse_rfc3339).transpose()?,
        })
    }
}

fn parse_rfc3339(s: &str) -> Result<chrono::DateTime<chrono::Utc>, String> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| format!("invalid timestamp '{s}': {e}"))
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = ships)]
pub struct NewShip {
    pub id: String,
    pub status: String,
    pub container_id: Option<String>,
    pub endpoint: Option<String>,
    pub driver: String,
    pub image: String,
    pub cpus: f64,
    pub memory: String,
    pub disk: Option<String>,
    pub ttl_secs: i32,
    pub warm_pool: i32,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: Option<String>,
}

impl NewShip {
    pub fn creating(
        id: impl Into<String>,
        driver: impl Into<String>,
        image: impl Into<String>,
        cpus: f64,
        memory: impl Into<String>,
        disk: Option<String>,
        ttl_secs: i32,
        warm_pool: bool,
    ) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: id.into(),
            status: ShipStatus::Creating.as_str().to_string(),
            container_id: None,
            endpoint: None,
            driver: driver.into(),
            image: image.into(),
            cpus,
            memory: memory.into(),
            disk,
            ttl_secs,
            warm_pool: bool_to_int(warm_pool),
            created_at: now.clone(),
            updated_at: now,
            expires_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_string() {
        for s in [ShipStatus::Creating, ShipStatus::Running, ShipStatus::Stopped] {
            let parsed: ShipStatus = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn rejects_unknown_status_string() {
        assert!("Zombie".parse::<ShipStatus>().is_err());
    }
}
