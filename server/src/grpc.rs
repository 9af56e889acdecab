use podiam_core::{CredentialsError, CredentialsProvider, LookupError, RoleFinder};
use podiam_proto::v1::{
    credential_broker_server::CredentialBroker, Credentials, GetHealthRequest, GetPodRoleRequest,
    GetRoleCredentialsRequest, HealthStatus, Role,
};
use std::net::IpAddr;
use tonic::{Request, Response, Status};
use tracing::debug;

/// The broker RPC surface over an injected role finder and credential
/// provider.
#[derive(Clone, Debug)]
pub struct BrokerGrpc<F, C> {
    finder: F,
    credentials: C,
}

// === impl BrokerGrpc ===

impl<F, C> BrokerGrpc<F, C> {
    pub fn new(finder: F, credentials: C) -> Self {
        Self {
            finder,
            credentials,
        }
    }
}

#[tonic::async_trait]
impl<F, C> CredentialBroker for BrokerGrpc<F, C>
where
    F: RoleFinder + Send + Sync + 'static,
    C: CredentialsProvider + Send + Sync + 'static,
{
    async fn get_pod_role(
        &self,
        req: Request<GetPodRoleRequest>,
    ) -> Result<Response<Role>, Status> {
        let ip = req.into_inner().ip;
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| Status::invalid_argument(format!("invalid ip: {ip}")))?;

        match self.finder.find_role_by_ip(ip).await {
            Ok(Some(name)) => {
                debug!(%ip, role = %name, "resolved pod role");
                Ok(Response::new(Role { name }))
            }
            Ok(None) => Err(Status::not_found(format!(
                "no pod with a role found for ip {ip}"
            ))),
            Err(LookupError::Forbidden(message)) => Err(Status::permission_denied(message)),
            Err(LookupError::Unavailable(message)) => Err(Status::unavailable(message)),
        }
    }

    async fn get_role_credentials(
        &self,
        req: Request<GetRoleCredentialsRequest>,
    ) -> Result<Response<Credentials>, Status> {
        let role = req.into_inner().role;
        if role.is_empty() {
            return Err(Status::invalid_argument("no role specified"));
        }

        match self.credentials.credentials_for_role(&role).await {
            Ok(creds) => Ok(Response::new(creds.into())),
            Err(error @ CredentialsError::Policy { .. }) => {
                Err(Status::permission_denied(error.to_string()))
            }
            Err(CredentialsError::Transient(message)) => Err(Status::unavailable(message)),
        }
    }

    async fn get_health(
        &self,
        _req: Request<GetHealthRequest>,
    ) -> Result<Response<HealthStatus>, Status> {
        Ok(Response::new(HealthStatus {
            message: "ok".to_string(),
        }))
    }
}
