use crate::{
    index::Index,
    sets::{Membership, Memberships},
};
use netpol_controller_core::{set, Op, Protocol, SetKind, POD_TEMPLATE_HASH_LABEL};
use netpol_controller_k8s_api::{self as k8s, ResourceExt};
use std::net::IpAddr;
use tracing::{debug, instrument, warn};

const EXCLUDED_PHASES: [&str; 3] = ["Failed", "Succeeded", "Unknown"];

/// Returns the IP of a pod that should be enforced against, if any.
///
/// Pods that have terminated (or whose state is unknown) and pods that have
/// not been assigned an IP are not members of any set.
pub fn enforced_ip(pod: &k8s::Pod) -> Option<IpAddr> {
    let status = pod.status.as_ref()?;
    if let Some(phase) = status.phase.as_deref() {
        if EXCLUDED_PHASES.contains(&phase) {
            return None;
        }
    }

    let ip = status.pod_ip.as_deref().filter(|ip| !ip.is_empty())?;
    match ip.parse() {
        Ok(ip) => Some(ip),
        Err(error) => {
            warn!(%ip, %error, "Ignoring invalid pod IP");
            None
        }
    }
}

/// Computes every set membership contributed by a pod.
pub(crate) fn memberships(pod: &k8s::Pod, namespace: &str) -> Memberships {
    let mut memberships = Memberships::new();
    let Some(ip) = enforced_ip(pod) else {
        return memberships;
    };
    let ip = ip.to_string();

    memberships.insert(Membership::new(
        set::namespace_set(namespace),
        SetKind::Namespace,
        &ip,
    ));

    for (key, value) in pod.labels() {
        if key == POD_TEMPLATE_HASH_LABEL {
            continue;
        }
        memberships.insert(Membership::new(set::pod_label_set(key), SetKind::PodLabel, &ip));
        memberships.insert(Membership::new(
            set::pod_label_set(&set::label(key, value)),
            SetKind::PodLabel,
            &ip,
        ));
    }

    let ports = pod
        .spec
        .iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|c| c.ports.iter().flatten());
    for port in ports {
        let Some(name) = port.name.as_deref().filter(|n| !n.is_empty()) else {
            continue;
        };
        let protocol = match port.protocol.as_deref().unwrap_or("TCP").parse::<Protocol>() {
            Ok(protocol) => protocol,
            Err(error) => {
                warn!(port = %name, %error, "Ignoring container port");
                continue;
            }
        };
        let member = format!(
            "{ip},{}:{}",
            protocol.to_string().to_ascii_lowercase(),
            port.container_port
        );
        memberships.insert(Membership::new(
            set::named_port_set(name),
            SetKind::NamedPort,
            &member,
        ));
    }

    memberships
}

// === impl Index ===

impl Index {
    /// Creates or updates a pod's set memberships.
    #[instrument(
        skip(self, pod),
        fields(
            ns = ?pod.metadata.namespace,
            name = ?pod.metadata.name,
        )
    )]
    pub fn apply_pod(&mut self, pod: k8s::Pod) -> Vec<Op> {
        let Some(namespace) = pod.namespace() else {
            warn!("Ignoring pod without a namespace");
            return vec![];
        };
        let name = pod.name_unchecked();
        let desired = memberships(&pod, &namespace);
        if desired.is_empty() {
            debug!("Pod is not enforced");
        }

        let mut ops = vec![];
        let ns = self.namespaces.get_or_default(&namespace);
        let current = ns.pods.remove(&name).unwrap_or_default();
        if !desired.is_empty() {
            ns.pods.insert(name, desired.clone());
        }
        self.sets.update_memberships(&current, &desired, &mut ops);
        self.namespaces.gc(&namespace);
        ops
    }

    /// Removes all of a pod's set memberships.
    #[instrument(skip(self))]
    pub fn delete_pod(&mut self, namespace: &str, name: &str) -> Vec<Op> {
        let mut ops = vec![];
        let Some(current) = self
            .namespaces
            .by_ns
            .get_mut(namespace)
            .and_then(|ns| ns.pods.remove(name))
        else {
            return ops;
        };
        self.sets
            .update_memberships(&current, &Memberships::new(), &mut ops);
        self.namespaces.gc(namespace);
        ops
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Pod> for Index {
    fn apply(&mut self, pod: k8s::Pod) {
        let ops = self.apply_pod(pod);
        self.publish(ops);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let ops = self.delete_pod(&namespace, &name);
        self.publish(ops);
    }

    // Since apply only reindexes a single pod at a time, there's no need to
    // handle resets specially.
}
