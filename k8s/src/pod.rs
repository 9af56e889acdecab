use kube::ResourceExt;
use std::net::IpAddr;

/// Annotation naming the IAM role a pod may assume.
pub const ROLE_ANNOTATION: &str = "iam.amazonaws.com/role";

/// The slice of a cluster Pod the index cares about.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pod {
    pub uid: String,
    pub name: String,
    pub namespace: String,

    /// Unset until the pod is scheduled onto the network.
    pub ip: Option<IpAddr>,

    pub phase: Phase,

    /// The annotated role name, if any.
    pub role: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Running,
    Terminal,
}

// === impl Pod ===

impl Pod {
    /// Projects a cluster Pod onto the indexed representation. Pods without
    /// a UID or namespace cannot be indexed and yield `None`.
    pub(crate) fn project(pod: k8s_openapi::api::core::v1::Pod) -> Option<Self> {
        let uid = pod.uid()?;
        let namespace = pod.namespace()?;
        let name = pod.name_any();
        let role = pod
            .annotations()
            .get(ROLE_ANNOTATION)
            .filter(|r| !r.is_empty())
            .cloned();

        let status = pod.status.unwrap_or_default();
        let ip = status.pod_ip.as_deref().and_then(|ip| ip.parse().ok());
        let phase = match status.phase.as_deref() {
            Some("Running") => Phase::Running,
            Some("Succeeded") | Some("Failed") => Phase::Terminal,
            _ => Phase::Pending,
        };

        Some(Pod {
            uid,
            name,
            namespace,
            ip,
            phase,
            role,
        })
    }

    /// A terminal pod no longer owns its IP and receives no credentials.
    pub fn is_terminal(&self) -> bool {
        self.phase == Phase::Terminal
    }
}
