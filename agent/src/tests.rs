use crate::{client::resolve_role, route, Agent, Config, Route};
use chrono::Utc;
use hyper::{Body, Request, StatusCode};
use parking_lot::Mutex;
use podiam_core::{
    Credentials, CredentialsError, CredentialsProvider, LookupError, RoleFinder,
};
use prometheus_client::registry::Registry;
use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[derive(Clone)]
struct StubBroker {
    roles: Arc<Mutex<Vec<Result<Option<String>, LookupError>>>>,
    creds: Result<Credentials, CredentialsError>,
    calls: Arc<AtomicUsize>,
    last_ip: Arc<Mutex<Option<IpAddr>>>,
}

impl StubBroker {
    fn returning(role: Result<Option<String>, LookupError>) -> Self {
        Self::sequence(vec![role])
    }

    /// Answers from the front of the sequence, repeating the final entry.
    fn sequence(roles: Vec<Result<Option<String>, LookupError>>) -> Self {
        Self {
            roles: Arc::new(Mutex::new(roles)),
            creds: Ok(record()),
            calls: Arc::new(AtomicUsize::new(0)),
            last_ip: Arc::new(Mutex::new(None)),
        }
    }

    fn with_credentials(mut self, creds: Result<Credentials, CredentialsError>) -> Self {
        self.creds = creds;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RoleFinder for StubBroker {
    async fn find_role_by_ip(&self, ip: IpAddr) -> Result<Option<String>, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_ip.lock() = Some(ip);
        let mut roles = self.roles.lock();
        if roles.len() > 1 {
            roles.remove(0)
        } else {
            roles[0].clone()
        }
    }
}

#[async_trait::async_trait]
impl CredentialsProvider for StubBroker {
    async fn credentials_for_role(&self, _: &str) -> Result<Credentials, CredentialsError> {
        self.creds.clone()
    }
}

fn record() -> Credentials {
    Credentials {
        code: "Success".to_string(),
        credential_type: "AWS-HMAC".to_string(),
        access_key_id: "AKIAEXAMPLE".to_string(),
        secret_access_key: "secret".to_string(),
        token: "token".to_string(),
        expiration: Utc::now() + chrono::Duration::seconds(900),
        last_updated: Utc::now(),
    }
}

fn agent(config: Config, broker: StubBroker) -> Agent<StubBroker> {
    Agent::new(config, broker, Registry::default()).unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

async fn body_text(resp: hyper::Response<Body>) -> String {
    let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn serves_credentials_for_the_annotated_role() {
    let agent = agent(
        Config::new(3100),
        StubBroker::returning(Ok(Some("reader".to_string()))),
    );

    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/reader"),
            "10.0.0.5:40000".to_string(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(hyper::header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let body: serde_json::Value = serde_json::from_str(&body_text(resp).await).unwrap();
    assert_eq!(body["AccessKeyId"], "AKIAEXAMPLE");
    assert_eq!(body["Code"], "Success");
}

#[tokio::test]
async fn denies_requests_for_other_roles() {
    let agent = agent(
        Config::new(3100),
        StubBroker::returning(Ok(Some("reader".to_string()))),
    );

    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/admin"),
            "10.0.0.5:40000".to_string(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_text(resp).await;
    assert!(
        body.contains("unable to assume role admin"),
        "unexpected body: {body}"
    );
}

#[tokio::test]
async fn lists_the_role_name_on_the_index_path() {
    let agent = agent(
        Config::new(3100),
        StubBroker::returning(Ok(Some("reader".to_string()))),
    );

    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/"),
            "10.0.0.5:40000".to_string(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "reader");
}

#[tokio::test]
async fn unknown_ips_are_not_found_after_the_budget() {
    let mut config = Config::new(3100);
    config.max_elapsed_time = Duration::from_millis(50);
    let broker = StubBroker::returning(Ok(None));
    let agent = agent(config, broker.clone());

    let start = Instant::now();
    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/"),
            "10.0.0.99:40000".to_string(),
        )
        .await;

    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_text(resp).await, "pod not found for ip 10.0.0.99");
    assert!(broker.calls() > 1);
}

#[tokio::test]
async fn resolves_pods_that_appear_mid_retry() {
    let broker = StubBroker::sequence(vec![
        Ok(None),
        Ok(None),
        Ok(Some("reader".to_string())),
    ]);
    let agent = agent(Config::new(3100), broker.clone());

    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/reader"),
            "10.0.0.5:40000".to_string(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert!(broker.calls() >= 3);
}

#[tokio::test]
async fn forbidden_answers_are_not_retried() {
    let broker = StubBroker::returning(Err(LookupError::Forbidden(
        "namespace ns-0 does not permit role admin".to_string(),
    )));
    let agent = agent(Config::new(3100), broker.clone());

    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/admin"),
            "10.0.0.5:40000".to_string(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(broker.calls(), 1);
}

#[tokio::test]
async fn malformed_remote_addresses_are_internal_errors() {
    let agent = agent(
        Config::new(3100),
        StubBroker::returning(Ok(Some("reader".to_string()))),
    );

    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/reader"),
            "nonsense".to_string(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_text(resp).await;
    assert!(
        body.contains("incorrect format"),
        "unexpected body: {body}"
    );
}

#[tokio::test]
async fn ip_query_overrides_the_source_address_when_allowed() {
    let mut config = Config::new(3100);
    config.allow_ip_query = true;
    let broker = StubBroker::returning(Ok(Some("reader".to_string())));
    let agent = agent(config, broker.clone());

    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/?ip=10.0.0.7"),
            "10.0.0.5:40000".to_string(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(*broker.last_ip.lock(), Some("10.0.0.7".parse().unwrap()));
}

#[tokio::test]
async fn ip_query_is_ignored_by_default() {
    let broker = StubBroker::returning(Ok(Some("reader".to_string())));
    let agent = agent(Config::new(3100), broker.clone());

    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/?ip=10.0.0.7"),
            "10.0.0.5:40000".to_string(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(*broker.last_ip.lock(), Some("10.0.0.5".parse().unwrap()));
}

#[tokio::test]
async fn sts_failures_are_internal_errors() {
    let broker = StubBroker::returning(Ok(Some("reader".to_string()))).with_credentials(Err(
        CredentialsError::Transient("sts unreachable".to_string()),
    ));
    let agent = agent(Config::new(3100), broker);

    let resp = agent
        .handle(
            get("/latest/meta-data/iam/security-credentials/reader"),
            "10.0.0.5:40000".to_string(),
        )
        .await;

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn empty_requested_roles_are_bad_requests() {
    let agent = agent(
        Config::new(3100),
        StubBroker::returning(Ok(Some("reader".to_string()))),
    );

    let err = agent
        .credentials(
            get("/latest/meta-data/iam/security-credentials/"),
            "10.0.0.5:40000".to_string(),
            String::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pings_pong() {
    let agent = agent(Config::new(3100), StubBroker::returning(Ok(None)));
    let resp = agent
        .handle(get("/ping"), "10.0.0.5:40000".to_string())
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_text(resp).await, "pong");
}

#[test]
fn unrelated_paths_fall_through_to_the_proxy() {
    assert!(matches!(
        route("/latest/dynamic/instance-identity/document"),
        Route::Proxy
    ));
    assert!(matches!(route("/"), Route::Proxy));
    assert!(matches!(
        route("/latest/meta-data/iam/security-credentials"),
        Route::RoleName
    ));
    assert!(matches!(
        route("/latest/meta-data/iam/security-credentials/team/reader"),
        Route::Credentials(role) if role == "team/reader"
    ));
}

#[tokio::test]
async fn repeated_lookups_return_identical_roles() {
    let broker = StubBroker::returning(Ok(Some("reader".to_string())));

    let first = resolve_role(&broker, "10.0.0.5".parse().unwrap(), Duration::from_secs(1))
        .await
        .unwrap();
    let second = resolve_role(&broker, "10.0.0.5".parse().unwrap(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(first.as_deref(), Some("reader"));
}

#[tokio::test]
async fn transient_answers_are_retried_until_the_budget() {
    let broker = StubBroker::returning(Err(LookupError::Unavailable(
        "server unreachable".to_string(),
    )));

    let start = Instant::now();
    let result = resolve_role(&broker, "10.0.0.5".parse().unwrap(), Duration::from_millis(80)).await;

    assert!(start.elapsed() >= Duration::from_millis(80));
    assert!(matches!(result, Err(LookupError::Unavailable(_))));
    assert!(broker.calls() > 1);
}
