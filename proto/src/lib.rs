//! Generated protobuf/gRPC bindings for the broker protocol, plus
//! conversions to and from the core credential record.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod v1 {
    tonic::include_proto!("podiam.v1");
}

use chrono::{DateTime, Utc};
use podiam_core::Credentials;

impl From<Credentials> for v1::Credentials {
    fn from(c: Credentials) -> Self {
        Self {
            code: c.code,
            r#type: c.credential_type,
            access_key_id: c.access_key_id,
            secret_access_key: c.secret_access_key,
            token: c.token,
            expiration: c.expiration.to_rfc3339(),
            last_updated: c.last_updated.to_rfc3339(),
        }
    }
}

impl TryFrom<v1::Credentials> for Credentials {
    type Error = chrono::ParseError;

    fn try_from(c: v1::Credentials) -> Result<Self, Self::Error> {
        Ok(Self {
            code: c.code,
            credential_type: c.r#type,
            access_key_id: c.access_key_id,
            secret_access_key: c.secret_access_key,
            token: c.token,
            expiration: DateTime::parse_from_rfc3339(&c.expiration)?.with_timezone(&Utc),
            last_updated: DateTime::parse_from_rfc3339(&c.last_updated)?.with_timezone(&Utc),
        })
    }
}
