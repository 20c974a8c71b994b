use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::sessions;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = sessions)]
pub struct SessionRow {
    pub id: String,
    pub ship_id: String,
    pub created_at: String,
    pub last_activity: String,
    pub expires_at: String,
    pub initial_ttl: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub id: String,
    pub ship_id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub initial_ttl: i32,
}

impl TryFrom<SessionRow> for SessionData {
    type Error = String;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            ship_id: row.ship_id,
            created_at: parse_rfc3339(&row.created_at)?,
            last_activity: parse_rfc3339(&row.last_activity)?,
            expires_at: parse_rfc3339(&row.expires_at)?,
            initial_ttl: row.initial_ttl,
        })
    }
}

fn parse_rfc3339(s: &str) -> Result<chrono::DateTime<chrono::Utc>, String> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| format!("invalid timestamp '{s}': {e}"))
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = sessions)]
pub struct NewSession {
    pub id: String,
    pub ship_id: String,
    pub created_at: String,
    pub last_activity: String,
    pub expires_at: String,
    pub initial_ttl: i32,
}

impl NewSession {
    pub fn new(id: impl Into<String>, ship_id: impl Into<String>, ttl_secs: i64) -> Self {
        let now = chrono::Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl_secs);
        Self {
            id: id.into(),
            ship_id: ship_id.into(),
            created_at: now.to_rfc3339(),
            last_activity: now.to_rfc3339(),
            expires_at: expires_at.to_rfc3339(),
            initial_ttl: ttl_secs as i32,
        }
    }
}
