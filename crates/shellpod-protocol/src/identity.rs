//! Bodies of the internal identity endpoints.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetIdentityRequest {
    #[serde(default)]
    pub bucket_identifier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetIdentityResponse {
    pub success: bool,
    pub bucket_identifier: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetIdentityResponse {
    pub bucket_identifier: Option<String>,
}
