//! Precondition pass run before any remote call.
//!
//! An item is eligible only when it belongs to the service, environment and
//! cluster selected for the run, is neither read-only nor stale, and manages
//! at least one resource.

use tracing::debug;

use nodeflow_types::sync::{ItemReport, SyncItem, SyncScope};

/// `Err(reason)` when `item` must not be synced in `scope`.
pub fn check_eligibility(item: &SyncItem, scope: &SyncScope) -> Result<(), String> {
    if item.service != scope.service {
        return Err(format!(
            "belongs to service '{}', run selected '{}'",
            item.service, scope.service
        ));
    }
    if item.environment != scope.environment {
        return Err(format!(
            "belongs to environment '{}', run selected '{}'",
            item.environment, scope.environment
        ));
    }
    if item.cluster != scope.cluster {
        return Err(format!(
            "belongs to cluster '{}', run selected '{}'",
            item.cluster, scope.cluster
        ));
    }
    if item.read_only {
        return Err("item is read-only".to_string());
    }
    if item.stale {
        return Err("item is stale".to_string());
    }
    if item.managed_resources.is_empty() {
        return Err("item manages no resources".to_string());
    }
    Ok(())
}

/// Split `items` into the eligible ones and failure reports for the rest.
pub fn partition_eligible(items: &[SyncItem], scope: &SyncScope) -> (Vec<SyncItem>, Vec<ItemReport>) {
    let mut eligible = Vec::new();
    let mut rejected = Vec::new();
    for item in items {
        match check_eligibility(item, scope) {
            Ok(()) => eligible.push(item.clone()),
            Err(reason) => {
                debug!(item = %item.name, reason = %reason, "sync item not eligible");
                rejected.push(ItemReport::for_item(item).with_message(format!("not eligible: {reason}")));
            }
        }
    }
    (eligible, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> SyncScope {
        SyncScope {
            service: "checkout".into(),
            environment: "prod".into(),
            cluster: "eu-1".into(),
        }
    }

    fn item(name: &str) -> SyncItem {
        SyncItem {
            name: name.into(),
            agent: "argo".into(),
            service: "checkout".into(),
            environment: "prod".into(),
            cluster: "eu-1".into(),
            read_only: false,
            stale: false,
            managed_resources: vec!["deployment/checkout".into()],
        }
    }

    #[test]
    fn matching_item_is_eligible() {
        assert_eq!(check_eligibility(&item("a"), &scope()), Ok(()));
    }

    #[test]
    fn each_rule_rejects() {
        let mut wrong_cluster = item("a");
        wrong_cluster.cluster = "us-1".into();
        assert!(check_eligibility(&wrong_cluster, &scope()).unwrap_err().contains("cluster"));

        let mut read_only = item("b");
        read_only.read_only = true;
        assert_eq!(check_eligibility(&read_only, &scope()), Err("item is read-only".into()));

        let mut stale = item("c");
        stale.stale = true;
        assert_eq!(check_eligibility(&stale, &scope()), Err("item is stale".into()));

        let mut empty = item("d");
        empty.managed_resources.clear();
        assert_eq!(
            check_eligibility(&empty, &scope()),
            Err("item manages no resources".into())
        );
    }

    #[test]
    fn partition_records_reasons() {
        let mut other_env = item("b");
        other_env.environment = "qa".into();
        let (eligible, rejected) = partition_eligible(&[item("a"), other_env], &scope());
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].name, "a");
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].name, "b");
        assert!(rejected[0].message.starts_with("not eligible: belongs to environment 'qa'"));
    }
}
