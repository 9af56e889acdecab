use crate::gateway::{resolve_role_arn, Gateway};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use podiam_core::{Credentials, CredentialsError, CredentialsProvider};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tracing::{debug, warn};

type IssueResult = Result<Credentials, CredentialsError>;

/// Per-role credential cache with single-flight issuance.
///
/// A role's slot is either a valid record, an issuance in flight, or a
/// parked error with a retry horizon. Concurrent callers for the same role
/// attach to the in-flight issuance and observe the same result; at most one
/// STS call per role is outstanding at any instant.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<Inner>,
}

struct Inner {
    gateway: Arc<dyn Gateway>,
    role_base_arn: String,
    session_name: String,
    refresh_margin: Duration,
    slots: Mutex<HashMap<String, Slot>>,
    metrics: CacheMetrics,
}

enum Slot {
    Valid(Credentials),
    Issuing {
        rx: watch::Receiver<Option<IssueResult>>,
        /// Record being replaced, retained if a refresh fails while it is
        /// still servable.
        prev: Option<Credentials>,
        failures: u32,
    },
    Errored {
        error: CredentialsError,
        retry_after: Instant,
        failures: u32,
    },
}

const RETRY_FLOOR: Duration = Duration::from_millis(500);
const RETRY_CEILING: Duration = Duration::from_secs(60);

fn retry_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(7);
    (RETRY_FLOOR * 2u32.pow(exp)).min(RETRY_CEILING)
}

// === impl Cache ===

impl Cache {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        role_base_arn: impl Into<String>,
        session_name: impl Into<String>,
        refresh_margin: Duration,
        metrics: CacheMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                gateway,
                role_base_arn: role_base_arn.into(),
                session_name: session_name.into(),
                refresh_margin,
                slots: Mutex::new(HashMap::default()),
                metrics,
            }),
        }
    }

    /// Returns a record with at least the refresh margin of lifetime left,
    /// issuing one if necessary.
    ///
    /// Cancelling a waiting caller only drops its future; the issuance runs
    /// on a detached task and completes for the remaining waiters.
    pub async fn credentials_for_role(&self, role: &str) -> IssueResult {
        let mut rx = {
            let mut slots = self.inner.slots.lock();
            match slots.get(role) {
                Some(Slot::Valid(creds)) if !creds.expires_within(self.inner.refresh_margin) => {
                    return Ok(creds.clone());
                }
                Some(Slot::Errored {
                    error, retry_after, ..
                }) if Instant::now() < *retry_after => return Err(error.clone()),
                Some(Slot::Issuing { rx, .. }) => rx.clone(),
                _ => self.begin_issue(&mut slots, role),
            }
        };
        Self::await_issue(&mut rx).await
    }

    /// Forces re-issuance regardless of the cached record's validity.
    ///
    /// On success the record is replaced atomically. On failure, a record
    /// that is still servable is retained; otherwise the slot parks the
    /// error until its retry horizon.
    pub async fn refresh(&self, role: &str) -> IssueResult {
        let mut rx = {
            let mut slots = self.inner.slots.lock();
            match slots.get(role) {
                Some(Slot::Issuing { rx, .. }) => rx.clone(),
                _ => self.begin_issue(&mut slots, role),
            }
        };
        Self::await_issue(&mut rx).await
    }

    /// Roles currently occupying a slot, for the periodic refresher.
    pub fn cached_roles(&self) -> Vec<String> {
        self.inner.slots.lock().keys().cloned().collect()
    }

    /// Whether the periodic refresher should re-issue for `role` now: the
    /// record is inside the refresh margin, or a parked error has reached
    /// its retry horizon.
    pub fn needs_refresh(&self, role: &str) -> bool {
        match self.inner.slots.lock().get(role) {
            Some(Slot::Valid(creds)) => creds.expires_within(self.inner.refresh_margin),
            Some(Slot::Errored { retry_after, .. }) => Instant::now() >= *retry_after,
            Some(Slot::Issuing { .. }) | None => false,
        }
    }

    /// Drops the slot for a role that no longer has consumers. An in-flight
    /// issuance is left to complete; the next idle pass collects it.
    pub fn evict(&self, role: &str) {
        let mut slots = self.inner.slots.lock();
        if !matches!(slots.get(role), Some(Slot::Issuing { .. })) {
            slots.remove(role);
        }
    }

    fn begin_issue(
        &self,
        slots: &mut HashMap<String, Slot>,
        role: &str,
    ) -> watch::Receiver<Option<IssueResult>> {
        let (tx, rx) = watch::channel(None);

        let (prev, failures) = match slots.remove(role) {
            Some(Slot::Valid(creds)) => (Some(creds), 0),
            Some(Slot::Errored { failures, .. }) => (None, failures),
            Some(Slot::Issuing { rx, prev, failures }) => {
                // Guarded against by the callers; keep the existing flight.
                slots.insert(
                    role.to_string(),
                    Slot::Issuing {
                        rx: rx.clone(),
                        prev,
                        failures,
                    },
                );
                return rx;
            }
            None => (None, 0),
        };
        slots.insert(
            role.to_string(),
            Slot::Issuing {
                rx: rx.clone(),
                prev,
                failures,
            },
        );

        let inner = self.inner.clone();
        let role = role.to_string();
        tokio::spawn(async move {
            let arn = resolve_role_arn(&inner.role_base_arn, &role);
            let result = inner.gateway.assume_role(&arn, &inner.session_name).await;

            let mut slots = inner.slots.lock();
            match &result {
                Ok(creds) => {
                    inner.metrics.issued.inc();
                    debug!(%role, expiration = %creds.expiration, "issued credentials");
                    slots.insert(role.clone(), Slot::Valid(creds.clone()));
                }
                Err(error) => {
                    inner.metrics.errors.inc();
                    warn!(%role, %error, "credential issuance failed");
                    let (prev, failures) = match slots.remove(&role) {
                        Some(Slot::Issuing { prev, failures, .. }) => (prev, failures),
                        _ => (None, 0),
                    };
                    let slot = match prev {
                        // A still-servable record outlives a failed refresh.
                        Some(creds) if !creds.expires_within(inner.refresh_margin) => {
                            Slot::Valid(creds)
                        }
                        _ => {
                            let failures = failures + 1;
                            Slot::Errored {
                                error: error.clone(),
                                retry_after: Instant::now() + retry_delay(failures),
                                failures,
                            }
                        }
                    };
                    slots.insert(role.clone(), slot);
                }
            }
            let _ = tx.send(Some(result));
        });

        rx
    }

    async fn await_issue(rx: &mut watch::Receiver<Option<IssueResult>>) -> IssueResult {
        match rx.wait_for(|r| r.is_some()).await {
            Ok(guard) => match &*guard {
                Some(result) => result.clone(),
                None => Err(CredentialsError::Transient(
                    "issuance completed without a result".to_string(),
                )),
            },
            Err(_) => Err(CredentialsError::Transient(
                "issuer task dropped before completing".to_string(),
            )),
        }
    }
}

#[async_trait::async_trait]
impl CredentialsProvider for Cache {
    async fn credentials_for_role(&self, role: &str) -> IssueResult {
        Cache::credentials_for_role(self, role).await
    }
}

/// Issuance counters, registered into the process registry.
#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    issued: Counter,
    errors: Counter,
}

// === impl CacheMetrics ===

impl CacheMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "credentials_issued",
            "Total credential records issued",
            metrics.issued.clone(),
        );
        reg.register(
            "credential_errors",
            "Total failed credential issuances",
            metrics.errors.clone(),
        );
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubGateway {
        calls: AtomicUsize,
        delay: Duration,
        lifetime: Duration,
        failures: Mutex<Vec<CredentialsError>>,
    }

    impl StubGateway {
        fn new(lifetime: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(20),
                lifetime,
                failures: Mutex::new(Vec::new()),
            })
        }

        fn fail_next(&self, error: CredentialsError) {
            self.failures.lock().push(error);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Gateway for StubGateway {
        async fn assume_role(&self, _: &str, _: &str) -> IssueResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if let Some(error) = self.failures.lock().pop() {
                return Err(error);
            }
            Ok(Credentials {
                code: "Success".to_string(),
                credential_type: "AWS-HMAC".to_string(),
                access_key_id: format!("AKIA{n}"),
                secret_access_key: "secret".to_string(),
                token: "token".to_string(),
                expiration: Utc::now()
                    + chrono::Duration::from_std(self.lifetime).unwrap(),
                last_updated: Utc::now(),
            })
        }
    }

    fn cache(gateway: Arc<StubGateway>, margin: Duration) -> Cache {
        Cache::new(
            gateway,
            "arn:aws:iam::123456789012:role/",
            "podiam",
            margin,
            CacheMetrics::default(),
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_share_one_issuance() {
        let gateway = StubGateway::new(Duration::from_secs(3600));
        let cache = cache(gateway.clone(), Duration::from_secs(60));

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(
                async move { cache.credentials_for_role("reader").await },
            ));
        }

        let mut keys = Vec::new();
        for task in tasks {
            keys.push(task.await.unwrap().unwrap().access_key_id);
        }

        assert_eq!(gateway.calls(), 1);
        assert!(keys.iter().all(|k| k == &keys[0]));
    }

    #[tokio::test]
    async fn record_inside_margin_is_reissued() {
        let gateway = StubGateway::new(Duration::from_millis(50));
        let cache = cache(gateway.clone(), Duration::ZERO);

        let first = cache.credentials_for_role("reader").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let second = cache.credentials_for_role("reader").await.unwrap();

        assert_eq!(gateway.calls(), 2);
        assert_ne!(first.access_key_id, second.access_key_id);
        assert!(second.expiration > first.expiration);
    }

    #[tokio::test]
    async fn refresh_replaces_a_valid_record() {
        let gateway = StubGateway::new(Duration::from_secs(3600));
        let cache = cache(gateway.clone(), Duration::from_secs(60));

        let first = cache.credentials_for_role("reader").await.unwrap();
        let refreshed = cache.refresh("reader").await.unwrap();
        let looked_up = cache.credentials_for_role("reader").await.unwrap();

        assert_eq!(gateway.calls(), 2);
        assert_ne!(first.access_key_id, refreshed.access_key_id);
        assert_eq!(refreshed.access_key_id, looked_up.access_key_id);
    }

    #[tokio::test]
    async fn failed_refresh_retains_a_servable_record() {
        let gateway = StubGateway::new(Duration::from_secs(3600));
        let cache = cache(gateway.clone(), Duration::from_secs(60));

        let first = cache.credentials_for_role("reader").await.unwrap();

        gateway.fail_next(CredentialsError::Transient("sts down".to_string()));
        assert!(cache.refresh("reader").await.is_err());

        let retained = cache.credentials_for_role("reader").await.unwrap();
        assert_eq!(retained.access_key_id, first.access_key_id);
        assert_eq!(gateway.calls(), 2);
    }

    #[tokio::test]
    async fn transient_errors_park_until_the_retry_horizon() {
        let gateway = StubGateway::new(Duration::from_secs(3600));
        let cache = cache(gateway.clone(), Duration::from_secs(60));

        gateway.fail_next(CredentialsError::Transient("sts down".to_string()));
        assert!(cache.credentials_for_role("reader").await.is_err());

        // The parked error answers without touching the gateway.
        assert!(cache.credentials_for_role("reader").await.is_err());
        assert_eq!(gateway.calls(), 1);
    }

    #[tokio::test]
    async fn policy_errors_propagate_unchanged() {
        let gateway = StubGateway::new(Duration::from_secs(3600));
        let cache = cache(gateway.clone(), Duration::from_secs(60));

        gateway.fail_next(CredentialsError::Policy {
            role: "reader".to_string(),
            message: "denied".to_string(),
        });

        assert!(matches!(
            cache.credentials_for_role("reader").await,
            Err(CredentialsError::Policy { .. })
        ));
    }

    #[tokio::test]
    async fn waiter_cancellation_leaves_the_issuance_running() {
        let gateway = StubGateway::new(Duration::from_secs(3600));
        let cache = cache(gateway.clone(), Duration::from_secs(60));

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.credentials_for_role("reader").await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        waiter.abort();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let record = cache.credentials_for_role("reader").await.unwrap();
        assert_eq!(gateway.calls(), 1);
        assert_eq!(record.access_key_id, "AKIA0");
    }

    #[tokio::test]
    async fn idle_roles_can_be_evicted() {
        let gateway = StubGateway::new(Duration::from_secs(3600));
        let cache = cache(gateway.clone(), Duration::from_secs(60));

        cache.credentials_for_role("reader").await.unwrap();
        assert_eq!(cache.cached_roles(), vec!["reader".to_string()]);

        cache.evict("reader");
        assert!(cache.cached_roles().is_empty());

        cache.credentials_for_role("reader").await.unwrap();
        assert_eq!(gateway.calls(), 2);
    }
}
