use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Display name, when the issuer includes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Claims {
    pub fn new(user_id: impl Into<String>, ttl_seconds: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            sub: user_id.into(),
            exp: now + ttl_seconds,
            iat: now,
            roles: Vec::new(),
            name: None,
            extra: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.sub
    }
}
