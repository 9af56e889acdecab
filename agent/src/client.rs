use anyhow::{Context, Result};
use podiam_core::{Credentials, CredentialsError, LookupError, RoleFinder};
use podiam_proto::v1::{
    credential_broker_client::CredentialBrokerClient, GetHealthRequest, GetPodRoleRequest,
    GetRoleCredentialsRequest,
};
use rand::Rng;
use std::{
    net::IpAddr,
    path::PathBuf,
    time::{Duration, Instant},
};
use tonic::{
    transport::{Certificate, Channel, ClientTlsConfig, Identity},
    Code,
};
use tracing::debug;

/// Paths to the agent's mTLS material.
#[derive(Clone, Debug)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

/// gRPC client of the broker server, speaking mutually-authenticated TLS.
#[derive(Clone, Debug)]
pub struct GrpcBroker {
    client: CredentialBrokerClient<Channel>,
}

// === impl GrpcBroker ===

impl GrpcBroker {
    /// Connects lazily: requests fail with `Unavailable` until the server is
    /// reachable, and the retry loop in the handlers absorbs that window.
    pub async fn connect(addr: String, tls: &TlsPaths) -> Result<Self> {
        let cert = tokio::fs::read(&tls.cert)
            .await
            .with_context(|| format!("reading client certificate {}", tls.cert.display()))?;
        let key = tokio::fs::read(&tls.key)
            .await
            .with_context(|| format!("reading client key {}", tls.key.display()))?;
        let ca = tokio::fs::read(&tls.ca)
            .await
            .with_context(|| format!("reading CA bundle {}", tls.ca.display()))?;

        let tls = ClientTlsConfig::new()
            .identity(Identity::from_pem(cert, key))
            .ca_certificate(Certificate::from_pem(ca));

        let channel = Channel::from_shared(addr)
            .context("invalid server address")?
            .tls_config(tls)?
            .connect_lazy();

        Ok(Self {
            client: CredentialBrokerClient::new(channel),
        })
    }

    pub async fn health(&self) -> Result<String> {
        let status = self
            .client
            .clone()
            .get_health(GetHealthRequest {})
            .await
            .context("health rpc failed")?
            .into_inner();
        Ok(status.message)
    }
}

#[async_trait::async_trait]
impl RoleFinder for GrpcBroker {
    async fn find_role_by_ip(&self, ip: IpAddr) -> Result<Option<String>, LookupError> {
        let request = GetPodRoleRequest { ip: ip.to_string() };
        match self.client.clone().get_pod_role(request).await {
            Ok(role) => {
                let name = role.into_inner().name;
                Ok((!name.is_empty()).then_some(name))
            }
            Err(status) => match status.code() {
                Code::NotFound => Ok(None),
                Code::PermissionDenied => {
                    Err(LookupError::Forbidden(status.message().to_string()))
                }
                _ => Err(LookupError::Unavailable(status.message().to_string())),
            },
        }
    }
}

#[async_trait::async_trait]
impl podiam_core::CredentialsProvider for GrpcBroker {
    async fn credentials_for_role(&self, role: &str) -> Result<Credentials, CredentialsError> {
        let request = GetRoleCredentialsRequest {
            role: role.to_string(),
        };
        let creds = self
            .client
            .clone()
            .get_role_credentials(request)
            .await
            .map_err(|status| match status.code() {
                Code::PermissionDenied => CredentialsError::Policy {
                    role: role.to_string(),
                    message: status.message().to_string(),
                },
                _ => CredentialsError::Transient(status.message().to_string()),
            })?
            .into_inner();

        creds.try_into().map_err(|error| {
            CredentialsError::Transient(format!("unreadable credential timestamps: {error}"))
        })
    }
}

const RETRY_FLOOR: Duration = Duration::from_millis(100);
const RETRY_CEILING: Duration = Duration::from_secs(2);

/// Resolves the role for `ip`, retrying while the pod is still unknown.
///
/// A pod's first credential fetch races the server's view of the cluster,
/// so not-found and transient answers are retried with jittered exponential
/// backoff until `budget` elapses. Policy denials exit immediately.
pub async fn resolve_role<B: RoleFinder>(
    broker: &B,
    ip: IpAddr,
    budget: Duration,
) -> Result<Option<String>, LookupError> {
    let start = Instant::now();
    let mut delay = RETRY_FLOOR;
    loop {
        let result = broker.find_role_by_ip(ip).await;
        match &result {
            Ok(Some(_)) | Err(LookupError::Forbidden(_)) => return result,
            Ok(None) | Err(LookupError::Unavailable(_)) => {
                let remaining = budget.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    return result;
                }
                // Jitter 0.5x..1.5x so a burst of new pods does not retry in
                // lockstep.
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let sleep = delay.mul_f64(jitter).min(remaining);
                debug!(%ip, ?sleep, "pod not resolved yet, retrying");
                tokio::time::sleep(sleep).await;
                delay = (delay * 2).min(RETRY_CEILING);
            }
        }
    }
}
