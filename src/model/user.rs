use serde::{Deserialize, Serialize};

/// API user. The secret is a random key presented as a bearer token;
/// it is never serialized into API responses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct User {
    #[serde(skip)]
    pub id: i64,
    pub login: String,
    #[serde(skip_serializing, default)]
    pub secret: String,
    #[serde(default)]
    pub admin: bool,
}
