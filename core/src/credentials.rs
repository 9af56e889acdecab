use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A credential record as served on the instance metadata surface.
///
/// Field names match the EC2 metadata JSON document exactly; the SDKs running
/// inside pods parse this body verbatim. Records are immutable once issued
/// and replaced wholesale on refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "Code")]
    pub code: String,

    #[serde(rename = "Type")]
    pub credential_type: String,

    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,

    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,

    #[serde(rename = "Token")]
    pub token: String,

    #[serde(rename = "Expiration")]
    pub expiration: DateTime<Utc>,

    #[serde(rename = "LastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl Credentials {
    /// Whether the record is still servable at `now` given a refresh margin.
    ///
    /// A record inside the margin is treated as absent so that callers always
    /// hold credentials with a usable remaining lifetime.
    pub fn valid_at(&self, now: DateTime<Utc>, margin: std::time::Duration) -> bool {
        match Duration::from_std(margin) {
            Ok(margin) => now < self.expiration - margin,
            // A margin beyond chrono's range can never be satisfied.
            Err(_) => false,
        }
    }

    /// Whether the record is within `margin` of its expiration.
    pub fn expires_within(&self, margin: std::time::Duration) -> bool {
        !self.valid_at(Utc::now(), margin)
    }
}
