//! The cluster-wide broker process: serves agent RPCs over mTLS and keeps
//! credentials warm for roles in use.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod grpc;
mod prefetch;

pub use self::{grpc::BrokerGrpc, prefetch::CredentialManager};

use anyhow::{Context, Result};
use futures::prelude::*;
use podiam_core::{CredentialsProvider, LookupError, RoleFinder};
use podiam_k8s::SharedIndex;
use podiam_proto::v1::credential_broker_server::CredentialBrokerServer;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
};
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{info, instrument};

/// Paths to the broker's mTLS material.
#[derive(Clone, Debug)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// Adapts the shared pod index to the role-finder seam the RPC surface is
/// written against.
#[derive(Clone, Debug)]
pub struct IndexFinder(SharedIndex);

// === impl IndexFinder ===

impl IndexFinder {
    pub fn new(index: SharedIndex) -> Self {
        Self(index)
    }
}

#[async_trait::async_trait]
impl RoleFinder for IndexFinder {
    async fn find_role_by_ip(&self, ip: IpAddr) -> Result<Option<String>, LookupError> {
        self.0.read().find_role_by_ip(ip)
    }
}

/// Serves the broker RPCs over mutually-authenticated TLS until drained.
///
/// A verified client certificate is required on every connection; the CA
/// bundle authenticates agents and the identity authenticates the server to
/// them.
#[instrument(skip_all, fields(port = %addr.port()))]
pub async fn serve<F, C>(
    addr: SocketAddr,
    tls: TlsPaths,
    svc: BrokerGrpc<F, C>,
    drain: drain::Watch,
) -> Result<()>
where
    F: RoleFinder + Send + Sync + 'static,
    C: CredentialsProvider + Send + Sync + 'static,
{
    let cert = tokio::fs::read(&tls.cert)
        .await
        .with_context(|| format!("reading server certificate {}", tls.cert.display()))?;
    let key = tokio::fs::read(&tls.key)
        .await
        .with_context(|| format!("reading server key {}", tls.key.display()))?;
    let ca = tokio::fs::read(&tls.ca)
        .await
        .with_context(|| format!("reading CA bundle {}", tls.ca.display()))?;

    let tls = ServerTlsConfig::new()
        .identity(Identity::from_pem(cert, key))
        .client_ca_root(Certificate::from_pem(ca));

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .tls_config(tls)?
            .add_service(CredentialBrokerServer::new(svc))
            .serve_with_shutdown(addr, close_rx.map(|_| ()));
    }

    info!(%addr, "credential broker gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?;
        }
    }
    Ok(())
}
