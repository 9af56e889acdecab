//! Core types for the podiam credential broker.
//!
//! The broker issues short-lived AWS credentials to pods based on a role
//! annotation. This crate holds the domain types shared by the server, the
//! agent, and the caches: the credential record, the error taxonomy, and the
//! capability traits implemented at the seams between components.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod credentials;

pub use self::credentials::Credentials;

use std::net::IpAddr;

/// Why an IP→role lookup could not produce an answer.
///
/// A successful lookup that simply finds nothing is expressed as `Ok(None)`,
/// not an error: an unknown IP may belong to a pod whose event has not been
/// observed yet, and callers are expected to retry within their budget.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The pod's namespace policy denies the annotated role, or the caller
    /// requested a role other than the one annotated on the pod.
    #[error("{0}")]
    Forbidden(String),

    /// The answer cannot be trusted: the watch on the cluster has been
    /// disconnected beyond the staleness budget, or the backend could not be
    /// reached.
    #[error("{0}")]
    Unavailable(String),
}

/// Why credentials could not be issued for a role.
///
/// The distinction drives retry behavior: policy failures are permanent and
/// propagate unchanged, transient failures are retried with backoff by the
/// credential cache.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CredentialsError {
    /// The issuer denied the request. Retrying cannot help.
    #[error("unable to assume role {role}: {message}")]
    Policy { role: String, message: String },

    /// The issuer could not be reached or failed temporarily.
    #[error("credential issuance failed: {0}")]
    Transient(String),
}

/// Resolves the role assigned to the pod behind a source IP.
///
/// Implemented by the server's pod index and, on the agent, by the gRPC
/// client that asks the server.
#[async_trait::async_trait]
pub trait RoleFinder {
    /// Returns the role assigned to the pod with the given IP, `None` when no
    /// matching pod (or no role annotation) is currently known.
    async fn find_role_by_ip(&self, ip: IpAddr) -> Result<Option<String>, LookupError>;
}

/// Issues credentials for a role, from cache or from the upstream issuer.
#[async_trait::async_trait]
pub trait CredentialsProvider {
    async fn credentials_for_role(&self, role: &str) -> Result<Credentials, CredentialsError>;
}
