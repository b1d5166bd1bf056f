use std::sync::Arc;

use assessor_core::ComparableSearchRequest;
use assessor_storage::Backend;
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::builder::to_rpc_args;
use crate::CompError;

pub const GET_PARCEL_COMPS: &str = "get_parcel_comps";

/// Produces raw candidate rows for a request. Lower `gower_distance` means
/// more similar; row order carries no meaning.
#[async_trait]
pub trait CompScorer: Send + Sync {
    async fn score(&self, request: &ComparableSearchRequest) -> Result<Vec<JsonValue>, CompError>;
}

/// Delegates scoring to the hosted `get_parcel_comps` procedure.
pub struct RpcCompScorer {
    backend: Arc<dyn Backend>,
    function: String,
}

impl RpcCompScorer {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            function: GET_PARCEL_COMPS.to_string(),
        }
    }
}

#[async_trait]
impl CompScorer for RpcCompScorer {
    async fn score(&self, request: &ComparableSearchRequest) -> Result<Vec<JsonValue>, CompError> {
        match self.backend.rpc(&self.function, &to_rpc_args(request)).await? {
            JsonValue::Array(rows) => Ok(rows),
            JsonValue::Null => Ok(Vec::new()),
            other => Err(CompError::Payload(format!(
                "{} returned {} instead of a row list",
                self.function,
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
