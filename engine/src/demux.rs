/// Normalizes the four trigger shapes the system accepts into a
/// `reconcile(clusterId)` call (§4.5). Lambda/SQS/S3 event-envelope parsing
/// lives in the worker binary; `Trigger` is the already-parsed shape so this
/// reduction stays a pure function, independent of any Lambda SDK type.
///
/// `VmStateChange` carries its cluster name pre-resolved (the caller looks
/// the instance's `ClusterName` tag up via the Compute Driver, in the
/// event's own region, before constructing the trigger) — keeping the tag
/// lookup, which is inherently I/O, out of this reduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    DirectInvoke { cluster_name: String },
    ObjectStoreWrite { key: String },
    Requeue { cluster_name: String, attempt: u32 },
    VmStateChange { cluster_name: Option<String> },
}

/// Returns `None` when the cluster name cannot be extracted; callers treat
/// that as a no-op success (§4.5), never an error.
pub fn extract_cluster_name(trigger: &Trigger) -> Option<String> {
    match trigger {
        Trigger::DirectInvoke { cluster_name } => Some(cluster_name.clone()),
        Trigger::ObjectStoreWrite { key } => parse_object_key(key),
        Trigger::Requeue { cluster_name, .. } => Some(cluster_name.clone()),
        Trigger::VmStateChange { cluster_name } => cluster_name.clone(),
    }
}

/// Parses `clusters/{name}/(config|status).json`; anything else (including
/// the token and kubeconfig keys, which never trigger reconciles) yields
/// `None`.
fn parse_object_key(key: &str) -> Option<String> {
    let rest = key.strip_prefix("clusters/")?;
    let (name, tail) = rest.split_once('/')?;
    if name.is_empty() {
        return None;
    }
    match tail {
        "config.json" | "status.json" => Some(name.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_invoke_is_identity() {
        let t = Trigger::DirectInvoke { cluster_name: "c1".into() };
        assert_eq!(extract_cluster_name(&t), Some("c1".to_string()));
    }

    #[test]
    fn parses_config_and_status_keys() {
        assert_eq!(
            extract_cluster_name(&Trigger::ObjectStoreWrite { key: "clusters/c1/config.json".into() }),
            Some("c1".to_string())
        );
        assert_eq!(
            extract_cluster_name(&Trigger::ObjectStoreWrite { key: "clusters/c1/status.json".into() }),
            Some("c1".to_string())
        );
    }

    #[test]
    fn ignores_token_and_kubeconfig_keys() {
        assert_eq!(
            extract_cluster_name(&Trigger::ObjectStoreWrite { key: "clusters/c1/k3s-server-token".into() }),
            None
        );
        assert_eq!(
            extract_cluster_name(&Trigger::ObjectStoreWrite { key: "clusters/c1/kubeconfig".into() }),
            None
        );
    }

    #[test]
    fn ignores_malformed_keys() {
        assert_eq!(extract_cluster_name(&Trigger::ObjectStoreWrite { key: "unrelated/path".into() }), None);
        assert_eq!(extract_cluster_name(&Trigger::ObjectStoreWrite { key: "clusters//config.json".into() }), None);
    }

    #[test]
    fn requeue_carries_cluster_name_through() {
        let t = Trigger::Requeue { cluster_name: "c2".into(), attempt: 3 };
        assert_eq!(extract_cluster_name(&t), Some("c2".to_string()));
    }

    #[test]
    fn unresolved_vm_state_change_is_noop() {
        assert_eq!(extract_cluster_name(&Trigger::VmStateChange { cluster_name: None }), None);
    }

    #[test]
    fn resolved_vm_state_change_passes_through() {
        let t = Trigger::VmStateChange { cluster_name: Some("c3".into()) };
        assert_eq!(extract_cluster_name(&t), Some("c3".to_string()));
    }
}
