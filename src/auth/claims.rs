use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Claims carried by the bearer tokens the dashboard's session service
/// issues. The hub only reads them; issuance lives outside this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id the token was issued for
    pub sub: String,
    /// Expiration (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Whatever else the session service put in the token
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Claims {
    /// The principal a connection presenting this token must declare itself as.
    pub fn user_id(&self) -> &str {
        &self.sub
    }
}
