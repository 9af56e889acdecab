//! Pod and namespace observation cache.
//!
//! The cache watches Pods and Namespaces and maintains three indexes in
//! lockstep: `uid → pod`, `ip → uid`, and `role → pods`, plus the namespace
//! permission expressions. Lookups answer "which role may the workload at
//! this source IP assume?" without touching the cluster.
//!
//! ```ignore
//! [ Pod watch ]       [ Namespace watch ]
//!       \                   /
//!        single writer task
//!       /        |          \
//!  ip → pod   role → pods   announce channel (prefetch)
//! ```
//!
//! All updates are applied by a single writer task, so the indexing logic
//! never worries about concurrent mutation; readers take the shared lock for
//! the duration of a lookup and never across I/O. Pod changes are published
//! on a bounded announce channel consumed by the credential prefetcher;
//! overflow displaces the oldest pending update.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod metrics;
mod namespace;
mod pod;
mod watch;

pub use self::{
    index::{Index, PodUpdate, SharedIndex},
    namespace::Namespace,
    pod::{Phase, Pod},
    watch::Watch,
};
pub use metrics::register as register_metrics;

use kube::api::ListParams;
use std::time::Duration;
use tokio::time;
use tracing::warn;

/// Periodic full-relist configuration for the writer task.
pub struct Resync {
    pub pods: kube::Api<k8s_openapi::api::core::v1::Pod>,
    pub namespaces: kube::Api<k8s_openapi::api::core::v1::Namespace>,
    pub interval: Duration,
}

/// How often readiness of the watches is folded into the staleness state,
/// even when no events arrive.
const STALENESS_CHECK: Duration = Duration::from_secs(10);

/// Drives indexing for pods and namespaces on a single task.
///
/// Watch events are applied serially; a `Restarted` relist resets the
/// indexes, removing any pod absent from the list. When a `Resync` is
/// provided, a periodic full list backstops the watches. Runs until the
/// process shuts down.
pub async fn run(
    index: SharedIndex,
    mut pods: Watch<k8s_openapi::api::core::v1::Pod>,
    mut namespaces: Watch<k8s_openapi::api::core::v1::Namespace>,
    resync: Resync,
) {
    use watch::Event;

    let mut staleness = time::interval(STALENESS_CHECK);
    let mut relist = time::interval(resync.interval);
    relist.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            ev = pods.recv() => {
                let mut idx = index.write();
                match ev {
                    Event::Applied(pod) => idx.apply_pod(pod),
                    Event::Deleted(pod) => idx.delete_pod(pod),
                    Event::Restarted(pods) => idx.reset_pods(pods),
                }
            }

            ev = namespaces.recv() => {
                let mut idx = index.write();
                match ev {
                    Event::Applied(ns) => idx.apply_namespace(ns),
                    Event::Deleted(ns) => idx.delete_namespace(ns),
                    Event::Restarted(nss) => idx.reset_namespaces(nss),
                }
            }

            _ = relist.tick() => {
                let params = ListParams::default();
                let lists = futures::future::try_join(
                    resync.pods.list(&params),
                    resync.namespaces.list(&params),
                );
                match lists.await {
                    Ok((pods, nss)) => {
                        let mut idx = index.write();
                        idx.reset_namespaces(nss.items);
                        idx.reset_pods(pods.items);
                    }
                    Err(error) => warn!(%error, "resync list failed"),
                }
            }

            _ = staleness.tick() => {}
        }

        index
            .write()
            .set_source_ready(pods.ready() && namespaces.ready());
    }
}
