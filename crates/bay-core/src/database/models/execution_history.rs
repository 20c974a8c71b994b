use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::execution_history;
use crate::database::utils::{bool_to_int, int_to_bool};

/// Output/error fields beyond this size are replaced with a truncation
/// marker (§4.6); the original length is retained so callers can tell a
/// truncated field from a merely large one.
pub const MAX_FIELD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecType {
    Python,
    Shell,
}

impl ExecType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecType::Python => "python",
            ExecType::Shell => "shell",
        }
    }
}

impl std::str::FromStr for ExecType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "python" => Ok(ExecType::Python),
            "shell" => Ok(ExecType::Shell),
            other => Err(format!("unknown exec_type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = execution_history)]
pub struct ExecutionHistoryRow {
    pub id: String,
    pub session_id: String,
    pub ship_id: String,
    pub exec_type: String,
    pub code: String,
    pub success: i32,
    pub execution_time_ms: i32,
    pub output: Option<String>,
    pub error: Option<String>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionHistoryData {
    pub id: String,
    pub session_id: String,
    pub ship_id: String,
    pub exec_type: ExecType,
    pub code: String,
    pub success: bool,
    pub execution_time_ms: i32,
    pub output: Option<String>,
    pub error: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<ExecutionHistoryRow> for ExecutionHistoryData {
    type Error = String;

    fn try_from(row: ExecutionHistoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            session_id: row.session_id,
            ship_id: row.ship_id,
            exec_type: row.exec_type.parse()?,
            code: row.code,
            success: int_to_bool(row.success),
            execution_time_ms: row.execution_time_ms,
            output: row.output,
            error: row.error,
            description: row.description,
            tags: split_tags(row.tags.as_deref()),
            notes: row.notes,
            created_at: chrono::DateTime::parse_from_rfc3339(&row.created_at)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| format!("invalid timestamp: {e}"))?,
        })
    }
}

fn split_tags(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| s.split(',').filter(|t| !t.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Truncates `value` to [`MAX_FIELD_BYTES`], replacing the overflow with a
/// marker that records the original length.
pub fn truncate_field(value: String) -> String {
    if value.len() <= MAX_FIELD_BYTES {
        return value;
    }
    let original_len = value.len();
    let mut cut = MAX_FIELD_BYTES;
    while !value.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[truncated, original length {original_len} bytes]", &value[..cut])
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = execution_history)]
pub struct NewExecutionHistory {
    pub id: String,
    pub session_id: String,
    pub ship_id: String,
    pub exec_type: String,
    pub code: String,
    pub success: i32,
    pub execution_time_ms: i32,
    pub output: Option<String>,
    pub error: Option<String>,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub notes: Option<String>,
    pub created_at: String,
}

impl NewExecutionHistory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        session_id: impl Into<String>,
        ship_id: impl Into<String>,
        exec_type: ExecType,
        code: impl Into<String>,
        success: bool,
        execution_time_ms: i32,
        output: Option<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            session_id: session_id.into(),
            ship_id: ship_id.into(),
            exec_type: exec_type.as_str().to_string(),
            code: code.into(),
            success: bool_to_int(success),
            execution_time_ms,
            output: output.map(truncate_field),
            error: error.map(truncate_field),
            description: None,
            tags: None,
            notes: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_oversize_output() {
        let big = "x".repeat(MAX_FIELD_BYTES + 100);
        let truncated = truncate_field(big);
        assert!(truncated.len() < MAX_FIELD_BYTES + 100);
        assert!(truncated.contains("[truncated"));
    }

    #[test]
    fn leaves_small_output_untouched() {
        let small = "hello".to_string();
        assert_eq!(truncate_field(small.clone()), small);
    }

    #[test]
    fn splits_tags_on_comma() {
        assert_eq!(split_tags(Some("a,b,c")), vec!["a", "b", "c"]);
        assert_eq!(split_tags(None), Vec::<String>::new());
        assert_eq!(split_tags(Some("")), Vec::<String>::new());
    }
}
