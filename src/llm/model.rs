use serde::{Deserialize, Serialize};

#[derive(Serialize, Debug)]
pub struct GenerateContentRequest<'a> {
    pub contents: Vec<Content<'a>>,
}

#[derive(Serialize, Debug)]
pub struct Content<'a> {
    pub role: &'static str,
    pub parts: Vec<PartIn<'a>>,
}

#[derive(Serialize, Debug)]
pub struct PartIn<'a> {
    pub text: &'a str,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<CandidateContent>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<PartOut>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PartOut {
    #[serde(default)]
    pub text: Option<String>,
}

/// `{"error": {...}}` envelope returned with non-2xx statuses.
#[derive(Deserialize, Debug)]
pub struct ApiErrorEnvelope {
    pub error: ApiError,
}

#[derive(Deserialize, Debug, Default)]
pub struct ApiError {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub details: Vec<ApiErrorDetail>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorDetail {
    #[serde(default)]
    pub violations: Vec<QuotaViolation>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct QuotaViolation {
    #[serde(default)]
    pub quota_metric: String,
    #[serde(default)]
    pub quota_id: String,
}
