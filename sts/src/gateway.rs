use aws_sdk_sts::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use chrono::{DateTime, Utc};
use podiam_core::{Credentials, CredentialsError};
use std::time::Duration;

/// The issuer behind the credential cache.
///
/// Implementations exchange a role ARN and session name for a credential
/// record. Errors partition into policy denials (permanent) and transient
/// failures (retried by the cache with backoff).
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> Result<Credentials, CredentialsError>;
}

/// Builds the fully-qualified role ARN from the configured base and a role
/// name. Names that already carry an ARN are used as-is, so namespaces may
/// grant cross-account roles.
pub fn resolve_role_arn(base: &str, role: &str) -> String {
    if role.starts_with("arn:") {
        role.to_string()
    } else {
        format!("{base}{role}")
    }
}

/// STS-backed [`Gateway`].
#[derive(Clone, Debug)]
pub struct StsGateway {
    client: aws_sdk_sts::Client,
    session_duration: Duration,
}

// === impl StsGateway ===

impl StsGateway {
    /// The STS minimum; keeps issued credentials short-lived.
    pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(900);

    pub async fn from_env(session_duration: Duration) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_sts::Client::new(&config),
            session_duration,
        }
    }
}

#[async_trait::async_trait]
impl Gateway for StsGateway {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
    ) -> Result<Credentials, CredentialsError> {
        let issued = self
            .client
            .assume_role()
            .role_arn(role_arn)
            .role_session_name(session_name)
            .duration_seconds(self.session_duration.as_secs() as i32)
            .send()
            .await
            .map_err(|error| classify(role_arn, error))?;

        let creds = issued.credentials().ok_or_else(|| {
            CredentialsError::Transient("sts returned no credentials".to_string())
        })?;

        let expiration = creds.expiration();
        let expiration =
            DateTime::from_timestamp(expiration.secs(), expiration.subsec_nanos())
                .ok_or_else(|| {
                    CredentialsError::Transient("sts returned an unreadable expiry".to_string())
                })?;

        Ok(Credentials {
            code: "Success".to_string(),
            credential_type: "AWS-HMAC".to_string(),
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            token: creds.session_token().to_string(),
            expiration,
            last_updated: Utc::now(),
        })
    }
}

fn classify<E, R>(role_arn: &str, error: SdkError<E, R>) -> CredentialsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    if let SdkError::ServiceError(_) = &error {
        if let Some(code) = error.meta().code() {
            if matches!(
                code,
                "AccessDenied" | "MalformedPolicyDocument" | "PackedPolicyTooLarge"
            ) {
                return CredentialsError::Policy {
                    role: role_arn.to_string(),
                    message: error
                        .meta()
                        .message()
                        .unwrap_or("denied by policy")
                        .to_string(),
                };
            }
        }
    }
    CredentialsError::Transient(format!("{}", DisplayErrorContext(&error)))
}

#[cfg(test)]
mod tests {
    use super::resolve_role_arn;

    #[test]
    fn resolves_role_arns() {
        let base = "arn:aws:iam::123456789012:role/";
        assert_eq!(
            resolve_role_arn(base, "reader"),
            "arn:aws:iam::123456789012:role/reader"
        );
        assert_eq!(
            resolve_role_arn(base, "arn:aws:iam::999999999999:role/other"),
            "arn:aws:iam::999999999999:role/other"
        );
    }
}
