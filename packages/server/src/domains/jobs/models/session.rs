//! Planner analysis session model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// One tool invocation recorded during a planner session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub tool: String,
    pub args: serde_json::Value,
    pub result: serde_json::Value,
}

/// One call into the external planner, with its full trace. Append-only.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct AnalysisSession {
    #[builder(default = Uuid::now_v7())]
    pub id: Uuid,
    pub endpoint_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    pub reasoning: String,
    #[builder(default = Json(Vec::new()))]
    pub tool_calls: Json<Vec<ToolCall>>,
    #[builder(default, setter(strip_option))]
    pub token_usage: Option<i64>,
    pub duration_ms: i64,
    #[builder(default, setter(strip_option))]
    pub next_analysis_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_calls_serialize_as_a_list() {
        let session = AnalysisSession::builder()
            .endpoint_id(Uuid::new_v4())
            .analyzed_at(Utc::now())
            .reasoning("traffic is bursty in the morning")
            .tool_calls(Json(vec![ToolCall {
                tool: "get_response_history".to_string(),
                args: serde_json::json!({"limit": 5}),
                result: serde_json::json!([]),
            }]))
            .duration_ms(1_200i64)
            .build();

        let value = serde_json::to_value(&session.tool_calls).unwrap();
        assert_eq!(value[0]["tool"], "get_response_history");
    }
}
