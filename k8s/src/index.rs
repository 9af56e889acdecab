use crate::{namespace::Namespace, pod::Pod};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;
use podiam_core::LookupError;
use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

/// A pod change observed by the cache, published on the announce channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodUpdate {
    Added(Pod),
    Updated(Pod),
    Removed(Pod),
}

/// Holds all indexing state. Owned and updated by a single writer task that
/// applies watch events serially; readers share it behind the lock.
#[derive(Debug)]
pub struct Index {
    /// All known pods by UID, including terminal ones awaiting deletion.
    pods: HashMap<String, Pod>,

    /// Live pod IPs. A given IP maps to at most one non-terminal pod.
    by_ip: HashMap<IpAddr, String>,

    /// Non-terminal pods by annotated role. Assignment additionally
    /// requires the namespace permission, applied at read time so namespace
    /// events never reindex pods.
    by_role: HashMap<String, HashSet<String>>,

    namespaces: HashMap<String, Namespace>,

    staleness_budget: Duration,

    /// Set while the watch source is disconnected. Lookups degrade once the
    /// disconnect outlives the staleness budget.
    disconnected_at: Option<Instant>,

    announce: async_channel::Sender<PodUpdate>,
}

// === impl Index ===

impl Index {
    /// Builds the shared index and the announce stream consumed by the
    /// credential prefetcher. The stream closes when the index is dropped;
    /// a fresh cache must be constructed to restart it.
    pub fn new(
        staleness_budget: Duration,
        announce_capacity: usize,
    ) -> (SharedIndex, async_channel::Receiver<PodUpdate>) {
        let (announce, updates) = async_channel::bounded(announce_capacity.max(1));
        let index = Arc::new(RwLock::new(Self {
            pods: HashMap::default(),
            by_ip: HashMap::default(),
            by_role: HashMap::default(),
            namespaces: HashMap::default(),
            staleness_budget,
            disconnected_at: None,
            announce,
        }));
        (index, updates)
    }

    /// Finds the non-terminal pod bound to `ip`.
    ///
    /// Misses surface as `Unavailable` once the watch has been disconnected
    /// beyond the staleness budget; hits keep serving the last known state.
    pub fn find_pod_by_ip(&self, ip: IpAddr) -> Result<Option<Pod>, LookupError> {
        match self.by_ip.get(&ip).and_then(|uid| self.pods.get(uid)) {
            Some(pod) => Ok(Some(pod.clone())),
            None if self.is_degraded() => Err(LookupError::Unavailable(format!(
                "pod cache is stale: cluster watch disconnected beyond {:?}",
                self.staleness_budget
            ))),
            None => Ok(None),
        }
    }

    /// Resolves `ip` to the role its pod is permitted to assume.
    ///
    /// `Ok(None)` when no pod is known, the pod carries no role annotation,
    /// or the pod's namespace has not been observed yet (the next namespace
    /// event re-answers the question). `Forbidden` when the namespace's
    /// permission expression denies the annotated role.
    pub fn find_role_by_ip(&self, ip: IpAddr) -> Result<Option<String>, LookupError> {
        let pod = match self.find_pod_by_ip(ip)? {
            Some(pod) => pod,
            None => return Ok(None),
        };
        let role = match pod.role {
            Some(role) => role,
            None => return Ok(None),
        };
        match self.namespaces.get(&pod.namespace) {
            None => Ok(None),
            Some(ns) if ns.permits(&role) => Ok(Some(role)),
            Some(_) => Err(LookupError::Forbidden(format!(
                "namespace {} does not permit role {}",
                pod.namespace, role
            ))),
        }
    }

    /// Whether at least one non-terminal pod is assigned `role`: annotated
    /// with it and permitted by its namespace's expression.
    pub fn active_pods_for_role(&self, role: &str) -> bool {
        self.by_role.get(role).is_some_and(|uids| {
            uids.iter().any(|uid| {
                self.pods
                    .get(uid)
                    .is_some_and(|pod| self.permits(&pod.namespace, role))
            })
        })
    }

    /// The role `pod` is assigned: its annotated role, when the namespace's
    /// permission expression allows it.
    pub fn assigned_role(&self, pod: &Pod) -> Option<String> {
        let role = pod.role.as_deref()?;
        self.permits(&pod.namespace, role).then(|| role.to_string())
    }

    fn permits(&self, namespace: &str, role: &str) -> bool {
        self.namespaces
            .get(namespace)
            .is_some_and(|ns| ns.permits(role))
    }

    pub(crate) fn pod_count(&self) -> usize {
        self.pods.len()
    }

    pub(crate) fn namespace_count(&self) -> usize {
        self.namespaces.len()
    }

    pub(crate) fn role_count(&self) -> usize {
        self.by_role.len()
    }

    // === writes, driven by the single writer task ===

    pub fn apply_pod(&mut self, pod: k8s_openapi::api::core::v1::Pod) {
        match Pod::project(pod) {
            Some(pod) => self.apply(pod),
            None => warn!("ignoring pod without uid or namespace"),
        }
    }

    pub fn delete_pod(&mut self, pod: k8s_openapi::api::core::v1::Pod) {
        if let Some(pod) = Pod::project(pod) {
            self.remove(&pod.uid);
        }
    }

    /// Applies a full relist. Any pod absent from the list is treated as
    /// removed.
    pub fn reset_pods(&mut self, pods: Vec<k8s_openapi::api::core::v1::Pod>) {
        let mut seen = HashSet::with_capacity(pods.len());
        for pod in pods {
            if let Some(pod) = Pod::project(pod) {
                seen.insert(pod.uid.clone());
                self.apply(pod);
            }
        }

        let dropped = self
            .pods
            .keys()
            .filter(|uid| !seen.contains(uid.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        for uid in dropped {
            self.remove(&uid);
        }
    }

    pub fn apply_namespace(&mut self, ns: k8s_openapi::api::core::v1::Namespace) {
        if let Some(ns) = Namespace::project(ns) {
            self.namespaces.insert(ns.name.clone(), ns);
        }
    }

    pub fn delete_namespace(&mut self, ns: k8s_openapi::api::core::v1::Namespace) {
        if let Some(ns) = Namespace::project(ns) {
            self.namespaces.remove(&ns.name);
        }
    }

    pub fn reset_namespaces(&mut self, nss: Vec<k8s_openapi::api::core::v1::Namespace>) {
        self.namespaces.clear();
        for ns in nss {
            self.apply_namespace(ns);
        }
    }

    /// Folds watch readiness into the staleness state. The disconnect
    /// instant is pinned on the first not-ready observation and cleared on
    /// reconnect.
    pub fn set_source_ready(&mut self, ready: bool) {
        if ready {
            self.disconnected_at = None;
        } else if self.disconnected_at.is_none() {
            self.disconnected_at = Some(Instant::now());
        }
    }

    fn is_degraded(&self) -> bool {
        self.disconnected_at
            .is_some_and(|since| since.elapsed() > self.staleness_budget)
    }

    fn apply(&mut self, pod: Pod) {
        let prev = self.pods.insert(pod.uid.clone(), pod.clone());
        if let Some(prev) = &prev {
            if *prev == pod {
                return;
            }
            self.unlink(prev);
        }
        self.link(&pod);

        let update = if prev.is_some() {
            PodUpdate::Updated(pod)
        } else {
            PodUpdate::Added(pod)
        };
        self.announce(update);
    }

    fn remove(&mut self, uid: &str) {
        if let Some(prev) = self.pods.remove(uid) {
            self.unlink(&prev);
            self.announce(PodUpdate::Removed(prev));
        }
    }

    fn link(&mut self, pod: &Pod) {
        if pod.is_terminal() {
            return;
        }
        if let Some(ip) = pod.ip {
            if let Some(prev) = self.by_ip.insert(ip, pod.uid.clone()) {
                if prev != pod.uid {
                    warn!(%ip, "ip rebound while previous pod still indexed");
                }
            }
        }
        if let Some(role) = &pod.role {
            self.by_role
                .entry(role.clone())
                .or_default()
                .insert(pod.uid.clone());
        }
    }

    fn unlink(&mut self, pod: &Pod) {
        if let Some(ip) = pod.ip {
            if self.by_ip.get(&ip).is_some_and(|uid| *uid == pod.uid) {
                self.by_ip.remove(&ip);
            }
        }
        if let Some(role) = &pod.role {
            if let Some(uids) = self.by_role.get_mut(role) {
                uids.remove(&pod.uid);
                if uids.is_empty() {
                    self.by_role.remove(role);
                }
            }
        }
    }

    fn announce(&self, update: PodUpdate) {
        match self.announce.force_send(update) {
            // Overflow displaced the oldest pending update; the periodic
            // refresh covers whatever it would have warmed.
            Ok(Some(_)) => debug!("announce buffer full, dropped oldest pending update"),
            Ok(None) => {}
            // No consumer; prefetching is disabled or shutting down.
            Err(_) => {}
        }
    }
}
