use ahash::AHashMap as HashMap;
use podiam_k8s::{PodUpdate, SharedIndex};
use podiam_sts::Cache;
use std::time::{Duration, Instant};
use tokio::{task::JoinSet, time};
use tracing::{debug, warn};

/// Keeps the credential cache warm for roles in use.
///
/// Workers consume the pod announce stream and warm credentials for roles
/// assigned to newly scheduled pods, so the request path almost never waits
/// on a synchronous issuance. Assignment is checked against the index, so a
/// role the pod's namespace denies is never issued. A periodic tick
/// refreshes records nearing their margin for roles that still have active
/// pods, and evicts records for roles that have had none for the idle
/// interval.
pub struct CredentialManager {
    cache: Cache,
    index: SharedIndex,
    updates: async_channel::Receiver<PodUpdate>,
    refresh_interval: Duration,
    idle_eviction: Duration,
}

// === impl CredentialManager ===

impl CredentialManager {
    pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(15 * 60);

    pub fn new(
        cache: Cache,
        index: SharedIndex,
        updates: async_channel::Receiver<PodUpdate>,
    ) -> Self {
        Self {
            cache,
            index,
            updates,
            refresh_interval: Self::DEFAULT_REFRESH_INTERVAL,
            idle_eviction: Self::DEFAULT_IDLE_EVICTION,
        }
    }

    pub fn with_intervals(mut self, refresh_interval: Duration, idle_eviction: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self.idle_eviction = idle_eviction;
        self
    }

    /// Runs `workers` warm workers plus the refresh ticker until shutdown is
    /// signaled or the announce stream closes.
    pub async fn run(self, workers: usize, shutdown: drain::Watch) {
        let Self {
            cache,
            index,
            updates,
            refresh_interval,
            idle_eviction,
        } = self;

        let mut tasks = JoinSet::new();
        for worker in 0..workers.max(1) {
            tasks.spawn(warm(
                cache.clone(),
                index.clone(),
                updates.clone(),
                shutdown.clone(),
                worker,
            ));
        }
        tasks.spawn(refresh(
            cache,
            index,
            refresh_interval,
            idle_eviction,
            shutdown,
        ));

        while tasks.join_next().await.is_some() {}
    }
}

async fn warm(
    cache: Cache,
    index: SharedIndex,
    updates: async_channel::Receiver<PodUpdate>,
    shutdown: drain::Watch,
    worker: usize,
) {
    tokio::pin! {
        let drained = shutdown.signaled();
    }
    loop {
        let update = tokio::select! {
            _ = &mut drained => return,
            update = updates.recv() => match update {
                Ok(update) => update,
                Err(_) => return,
            },
        };

        let pod = match update {
            PodUpdate::Added(pod) | PodUpdate::Updated(pod) => pod,
            PodUpdate::Removed(_) => continue,
        };
        let Some(role) = index.read().assigned_role(&pod) else { continue };

        debug!(worker, %role, pod = %pod.name, "warming credentials");
        if let Err(error) = cache.credentials_for_role(&role).await {
            warn!(%role, %error, "prefetch failed");
        }
    }
}

async fn refresh(
    cache: Cache,
    index: SharedIndex,
    interval: Duration,
    idle_eviction: Duration,
    shutdown: drain::Watch,
) {
    let mut tick = time::interval(interval);
    tick.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let mut last_active: HashMap<String, Instant> = HashMap::default();

    tokio::pin! {
        let drained = shutdown.signaled();
    }
    loop {
        tokio::select! {
            _ = &mut drained => return,
            _ = tick.tick() => {}
        }

        for role in cache.cached_roles() {
            if index.read().active_pods_for_role(&role) {
                last_active.insert(role.clone(), Instant::now());
                if cache.needs_refresh(&role) {
                    if let Err(error) = cache.refresh(&role).await {
                        warn!(%role, %error, "credential refresh failed");
                    }
                }
            } else {
                let idle_since = *last_active.entry(role.clone()).or_insert_with(Instant::now);
                if idle_since.elapsed() >= idle_eviction {
                    debug!(%role, "evicting credentials for idle role");
                    cache.evict(&role);
                    last_active.remove(&role);
                }
            }
        }
    }
}
