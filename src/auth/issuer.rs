//! Token issuance against ArcGIS `generateToken`.
//!
//! With a portal configured the request goes to
//! `<portal>/sharing/rest/generateToken`; otherwise to the stand-alone
//! server endpoint `<server>/tokens/generateToken`, derived from the layer
//! URL. Tokens are always requested with `client=referer`.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::Deserialize;

use super::{AuthResponse, TOKEN_LIFETIME_MINUTES};
use crate::{Result, SyncError};

/// Everything one issuance call needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub referer: String,
}

impl TokenRequest {
    /// Resolve the issuance endpoint from an optional portal and the layer URL.
    pub fn endpoint_for(portal: Option<&str>, service_url: &str) -> Result<String> {
        if let Some(portal) = portal.map(str::trim).filter(|p| !p.is_empty()) {
            let base = portal.trim_end_matches('/');
            return Ok(if base.ends_with("/sharing/rest") {
                format!("{base}/generateToken")
            } else {
                format!("{base}/sharing/rest/generateToken")
            });
        }

        let lower = service_url.to_ascii_lowercase();
        let idx = lower.find("/rest/services").ok_or_else(|| {
            SyncError::Config(format!(
                "cannot derive a token endpoint from {service_url}; set a portal"
            ))
        })?;
        Ok(format!("{}/tokens/generateToken", &service_url[..idx]))
    }
}

/// The issuance capability. One call, one tagged response.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Transport failures are `Err`; a refusal by the server is
    /// `Ok(AuthResponse::Rejected)`.
    async fn issue(&self, request: &TokenRequest) -> Result<AuthResponse>;
}

/// HTTP issuer for ArcGIS Server and ArcGIS Enterprise/Online portals.
pub struct ArcgisTokenIssuer {
    http: reqwest::Client,
}

impl ArcgisTokenIssuer {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    token: Option<String>,
    /// Epoch milliseconds.
    #[serde(default)]
    expires: Option<i64>,
    #[serde(default)]
    error: Option<TokenError>,
}

#[derive(Debug, Deserialize)]
struct TokenError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    details: Vec<String>,
}

impl TokenError {
    fn reason(&self) -> String {
        let mut reason = self
            .message
            .clone()
            .unwrap_or_else(|| "token request rejected".to_string());
        if let Some(code) = self.code {
            reason = format!("{reason} (code {code})");
        }
        if !self.details.is_empty() {
            reason = format!("{reason}: {}", self.details.join("; "));
        }
        reason
    }
}

fn interpret(body: TokenBody, referer: &str) -> AuthResponse {
    if let Some(error) = body.error {
        return AuthResponse::Rejected {
            reason: error.reason(),
        };
    }
    let Some(token) = body.token.filter(|t| !t.is_empty()) else {
        return AuthResponse::Rejected {
            reason: "response carried no token".to_string(),
        };
    };
    let Some(expires_at) = body
        .expires
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    else {
        return AuthResponse::Rejected {
            reason: "response carried no expiry".to_string(),
        };
    };
    AuthResponse::Issued {
        token,
        expires_at,
        referer: referer.to_string(),
    }
}

#[async_trait]
impl TokenIssuer for ArcgisTokenIssuer {
    async fn issue(&self, request: &TokenRequest) -> Result<AuthResponse> {
        let expiration = TOKEN_LIFETIME_MINUTES.to_string();
        let form = [
            ("username", request.username.as_str()),
            ("password", request.password.as_str()),
            ("client", "referer"),
            ("referer", request.referer.as_str()),
            ("expiration", expiration.as_str()),
            ("f", "json"),
        ];

        let resp = self
            .http
            .post(&request.endpoint)
            .header(reqwest::header::REFERER, &request.referer)
            .form(&form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!(
                "token request failed ({status}): {body}"
            )));
        }

        let body: TokenBody = resp.json().await?;
        Ok(interpret(body, &request.referer))
    }
}
