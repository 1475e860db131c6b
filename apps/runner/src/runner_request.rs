use serde::{Deserialize, Serialize};
use serde_json::Value;
use tessera_core::{AppError, AppResult};
use tessera_domain::{Accountability, QueryTree};

/// Read request accepted on stdin.
#[derive(Debug, Deserialize)]
pub struct RunnerRequest {
    #[serde(default)]
    pub accountability: Accountability,
    pub query: QueryTree,
}

impl RunnerRequest {
    pub fn parse(input: &str) -> AppResult<Self> {
        serde_json::from_str(input)
            .map_err(|error| AppError::InvalidQuery(format!("invalid request: {error}")))
    }
}

/// Result written to stdout.
#[derive(Debug, Serialize)]
pub struct RunnerResponse {
    pub data: Vec<Value>,
}
