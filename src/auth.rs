//! Caller identity from JWT access tokens

use anyhow::{anyhow, Result};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Request;

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// admin, user or assistant
    pub role: String,
    /// User an assistant imports on behalf of
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub iat: usize,
    pub exp: usize,
}

#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub user_id: Uuid,
    pub role: String,
    pub owner_id: Option<Uuid>,
}

impl AuthInfo {
    /// User whose staging areas and jobs the request acts on. Assistants
    /// work in their owner's imports.
    pub fn import_user_id(&self) -> Uuid {
        if self.role == "assistant" {
            self.owner_id.unwrap_or(self.user_id)
        } else {
            self.user_id
        }
    }
}

pub fn validate_token(token: &str, secret: &str) -> Result<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| anyhow!("Invalid token: {}", e))?;

    Ok(token_data.claims)
}

/// Caller identity of a NATS request; a valid token is required
pub fn extract_auth<T>(request: &Request<T>, jwt_secret: &str) -> Result<AuthInfo> {
    let token = request
        .token
        .as_deref()
        .ok_or_else(|| anyhow!("No authentication provided, JWT token is required"))?;

    let claims = validate_token(token, jwt_secret)?;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|e| anyhow!("Invalid user_id in token: {}", e))?;
    let owner_id = claims
        .owner_id
        .as_deref()
        .map(Uuid::parse_str)
        .transpose()
        .map_err(|e| anyhow!("Invalid owner_id in token: {}", e))?;

    Ok(AuthInfo {
        user_id,
        role: claims.role,
        owner_id,
    })
}

#[cfg(test)]
pub fn generate_token(user_id: Uuid, role: &str, owner_id: Option<Uuid>, secret: &str) -> Result<String> {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = chrono::Utc::now().timestamp() as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        role: role.to_string(),
        owner_id: owner_id.map(|id| id.to_string()),
        iat: now,
        exp: now + 60 * 60,
    };
    Ok(encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))?)
}
