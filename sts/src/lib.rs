//! Credential issuance: the STS gateway and the per-role credential cache.
//!
//! The cache sits between the request path and STS. It deduplicates
//! concurrent issuance per role, refreshes records before they expire, and
//! backs off after transient failures so a broken role cannot hammer the
//! issuer.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod gateway;

pub use self::{
    cache::{Cache, CacheMetrics},
    gateway::{resolve_role_arn, Gateway, StsGateway},
};
