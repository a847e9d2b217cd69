use super::SourceError;
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Send `request` and decode a JSON body, mapping failures onto [`SourceError`]
///
/// - 429 → `RateLimited`, with `Retry-After` (seconds) when present
/// - 5xx or transport failure → `ServiceUnavailable`
/// - other non-2xx, or an undecodable body → `InvalidResponse`
pub(crate) async fn get_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, SourceError> {
    let response = request
        .send()
        .await
        .map_err(|e| SourceError::ServiceUnavailable(e.to_string()))?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(SourceError::RateLimited { retry_after });
    }
    if status.is_server_error() {
        return Err(SourceError::ServiceUnavailable(format!("HTTP {}", status)));
    }
    if !status.is_success() {
        return Err(SourceError::InvalidResponse(format!("HTTP {}", status)));
    }

    response.json::<T>().await.map_err(|e| {
        if e.is_decode() {
            SourceError::InvalidResponse(e.to_string())
        } else {
            SourceError::ServiceUnavailable(e.to_string())
        }
    })
}
