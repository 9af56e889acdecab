use kube::ResourceExt;
use regex::Regex;
use tracing::warn;

/// Annotation holding the expression of role names pods in the namespace may
/// assume. Matched in full, so a literal role name acts as an exact rule.
pub const PERMITTED_ANNOTATION: &str = "iam.amazonaws.com/permitted";

/// The slice of a cluster Namespace the index cares about.
#[derive(Clone, Debug)]
pub struct Namespace {
    pub name: String,

    /// Compiled permission expression. A namespace without one (or with an
    /// expression that fails to compile) permits no roles.
    permitted: Option<Regex>,
}

// === impl Namespace ===

impl Namespace {
    pub(crate) fn project(ns: k8s_openapi::api::core::v1::Namespace) -> Option<Self> {
        let name = ns.name_any();
        if name.is_empty() {
            return None;
        }

        let permitted = ns.annotations().get(PERMITTED_ANNOTATION).and_then(|expr| {
            match Regex::new(&format!("^(?:{expr})$")) {
                Ok(re) => Some(re),
                Err(error) => {
                    warn!(namespace = %name, %error, "invalid permitted-roles expression");
                    None
                }
            }
        });

        Some(Namespace { name, permitted })
    }

    /// Whether pods in this namespace may assume `role`.
    pub fn permits(&self, role: &str) -> bool {
        self.permitted
            .as_ref()
            .is_some_and(|re| re.is_match(role))
    }
}
