//! Pre-request session refresh for the coding-agent upstream.
//!
//! The credential file holds a long-lived `__client` cookie JWT; each
//! request trades it for a short-lived WebSocket token that must not be
//! reused across requests.

use std::path::Path;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use tracing::warn;

use aigw_provider_core::{AdapterError, AdapterResult};

use crate::credential_file::{
    format_expires_at, get_str, read_credential_file, update_credential_file,
};
use crate::http_client::request_json;

/// Assumed token lifetime when the JWT carries no `exp` claim.
const FALLBACK_TOKEN_LIFETIME_SECS: i64 = 50;

#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub user_id: String,
    pub ws_token: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Read `exp` without verifying the signature; we are a consumer of the
/// token, not its audience.
fn token_expiry(token: &str) -> Option<OffsetDateTime> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.algorithms = vec![
        Algorithm::RS256,
        Algorithm::HS256,
        Algorithm::ES256,
    ];
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    let data =
        jsonwebtoken::decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    let exp = data.claims.exp?;
    OffsetDateTime::from_unix_timestamp(exp).ok()
}

pub async fn refresh_session(
    client: &wreq::Client,
    credential_path: &Path,
    session_base: &str,
) -> AdapterResult<Session> {
    let doc = read_credential_file(credential_path).await?;
    let client_jwt = get_str(&doc, &["client", "__client", "clientJwt"])
        .ok_or_else(|| {
            AdapterError::Auth("orchids credential has no __client cookie".to_string())
        })?
        .to_string();

    let url = format!(
        "{}/v1/client/sessions",
        session_base.trim_end_matches('/')
    );
    let listing = request_json(
        client
            .get(url)
            .header("cookie", format!("__client={client_jwt}")),
        "orchids.sessions",
    )
    .await?;

    let sessions = listing
        .as_array()
        .cloned()
        .or_else(|| listing["response"].as_array().cloned())
        .or_else(|| listing["sessions"].as_array().cloned())
        .unwrap_or_default();
    let first = sessions
        .first()
        .ok_or_else(|| AdapterError::Auth("orchids session listing is empty".to_string()))?;

    let session_id = first["id"]
        .as_str()
        .ok_or_else(|| AdapterError::Auth("orchids session has no id".to_string()))?
        .to_string();
    let user_id = first["user"]["id"].as_str().unwrap_or_default().to_string();
    let ws_token = session_token(first)
        .ok_or_else(|| AdapterError::Auth("orchids session has no active token".to_string()))?;

    let expires_at = token_expiry(&ws_token).unwrap_or_else(|| {
        OffsetDateTime::now_utc() + time::Duration::seconds(FALLBACK_TOKEN_LIFETIME_SECS)
    });

    if let Err(err) = update_credential_file(credential_path, |doc| {
        doc["tokenExpiresAt"] = JsonValue::String(format_expires_at(expires_at));
    })
    .await
    {
        warn!(event = "orchids.persist_expiry_failed", error = %err);
    }

    Ok(Session {
        session_id,
        user_id,
        ws_token,
        expires_at,
    })
}

fn session_token(session: &JsonValue) -> Option<String> {
    session["last_active_token"]["jwt"]
        .as_str()
        .or_else(|| session["lastActiveToken"]["jwt"].as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_falls_back_on_garbage_tokens() {
        assert!(token_expiry("not-a-jwt").is_none());
    }

    #[test]
    fn session_token_accepts_both_casings() {
        let snake = serde_json::json!({"last_active_token": {"jwt": "a"}});
        assert_eq!(session_token(&snake).as_deref(), Some("a"));
        let camel = serde_json::json!({"lastActiveToken": {"jwt": "b"}});
        assert_eq!(session_token(&camel).as_deref(), Some("b"));
    }
}
