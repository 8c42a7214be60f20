//! Identity tokens minted from a service account key file.
//!
//! A short-lived JWT assertion is signed with the account's private key and
//! exchanged at the key's token endpoint for an ID token scoped to the
//! requested audience.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};

use super::{IdentityToken, IdentityTokenSource, TokenError};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// The fields of a service account key file this proxy needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub key_type: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: &str) -> Result<Self, TokenError> {
        let json = std::fs::read_to_string(path).map_err(|source| TokenError::CredentialsFile {
            path: path.to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self, TokenError> {
        let key: ServiceAccountKey = serde_json::from_str(json)?;
        if key.key_type != "service_account" {
            return Err(TokenError::UnsupportedCredentials(key.key_type));
        }
        Ok(key)
    }
}

/// Claims of the assertion sent to the token endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    /// The token endpoint, not the backend.
    pub aud: String,
    pub iat: u64,
    pub exp: u64,
    /// The backend the resulting ID token will be scoped to.
    pub target_audience: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    id_token: Option<String>,
}

pub struct ServiceAccountSource {
    client: reqwest::Client,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
}

impl ServiceAccountSource {
    pub fn new(client: reqwest::Client, key: ServiceAccountKey) -> Result<Self, TokenError> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
        Ok(Self {
            client,
            key,
            encoding_key,
        })
    }

    fn assertion(&self, audience: &str) -> Result<String, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let claims = AssertionClaims {
            iss: self.key.client_email.clone(),
            sub: self.key.client_email.clone(),
            aud: self.key.token_uri.clone(),
            iat: now,
            exp: now + ASSERTION_LIFETIME_SECS,
            target_audience: audience.to_string(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();

        Ok(encode(&header, &claims, &self.encoding_key)?)
    }
}

#[async_trait]
impl IdentityTokenSource for ServiceAccountSource {
    #[tracing::instrument(skip(self), fields(client_email = %self.key.client_email))]
    async fn fetch(&self, audience: &str) -> Result<IdentityToken, TokenError> {
        let assertion = self.assertion(audience)?;

        let resp = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TokenError::Rejected { status, body });
        }

        let id_token = resp
            .json::<TokenResponse>()
            .await?
            .id_token
            .ok_or(TokenError::MissingIdToken)?;

        Ok(IdentityToken::from_jwt(id_token))
    }
}
