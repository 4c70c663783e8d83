//! Account reconciler
//!
//! Accounts are provisioned by the NATS server or its resolver. Reconciling
//! an Account confirms JetStream is enabled for it and that its limits match
//! any the object pins. Accounts are also connection domains: streams,
//! consumers and templates referencing one connect with its settings.

use super::{DiffError, Operation, ReconcileKey, ResourceReconciler, lifecycle_ops, track, update_or_reject};
use crate::cache::ObjectCache;
use async_trait::async_trait;
use crds::{Account, AccountLimitsSpec};
use jetstream_client::{AccountInfo, AccountLimits, JetStreamClientTrait, JetStreamError};
use kube::ResourceExt;
use tracing::info;

/// Reconciler for [`Account`]
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountReconciler;

/// Limits the account should have, starting from `base` for unset fields
fn wanted_limits(spec: Option<&AccountLimitsSpec>, base: AccountLimits) -> AccountLimits {
    let Some(spec) = spec else {
        return base;
    };
    AccountLimits {
        max_memory: spec.max_memory.unwrap_or(base.max_memory),
        max_storage: spec.max_storage.unwrap_or(base.max_storage),
        max_streams: spec.max_streams.unwrap_or(base.max_streams),
        max_consumers: spec.max_consumers.unwrap_or(base.max_consumers),
    }
}

#[async_trait]
impl ResourceReconciler for AccountReconciler {
    type Object = Account;
    type Observed = AccountInfo;

    fn parents(_cache: &ObjectCache, _obj: &Account) -> Vec<ReconcileKey> {
        Vec::new()
    }

    fn dependents(cache: &ObjectCache, obj: &Account) -> Vec<ReconcileKey> {
        cache.account_dependents(&obj.namespace().unwrap_or_default(), &obj.name_any())
    }

    async fn observe(
        client: &dyn JetStreamClientTrait,
        obj: &Account,
    ) -> Result<Option<AccountInfo>, JetStreamError> {
        client.get_account(&obj.broker_name()).await
    }

    fn diff(obj: &Account, observed: Option<&AccountInfo>) -> Result<Vec<Operation>, DiffError> {
        if let Some(ops) = lifecycle_ops(obj, observed) {
            return Ok(ops);
        }
        let Some(info) = observed else {
            return Ok(vec![Operation::NoOp]);
        };

        let wanted = wanted_limits(obj.spec.limits.as_ref(), info.limits);
        let mut changed = Vec::new();
        track(&mut changed, "limits", &info.limits, &wanted);
        update_or_reject(changed, &[])
    }

    async fn apply(
        client: &dyn JetStreamClientTrait,
        obj: &Account,
        observed: Option<&AccountInfo>,
        op: &Operation,
    ) -> Result<(), JetStreamError> {
        let name = obj.broker_name();
        match op {
            Operation::Create => {
                let limits = wanted_limits(obj.spec.limits.as_ref(), AccountLimits::default());
                client.create_account(&name, &limits).await?;
                info!("Account {} is available", name);
            }
            Operation::Update(_) => {
                let base = observed.map(|o| o.limits).unwrap_or_default();
                let limits = wanted_limits(obj.spec.limits.as_ref(), base);
                client.update_account(&name, &limits).await?;
                info!("Updated limits of account {}", name);
            }
            Operation::Delete => {
                client.delete_account(&name).await?;
                info!("Released account {}", name);
            }
            Operation::NoOp => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_account, mark_deleting};

    #[test]
    fn test_absent_account_is_created() {
        let account = create_test_account("acct-a", "default");
        assert_eq!(AccountReconciler::diff(&account, None).unwrap(), vec![Operation::Create]);
    }

    #[test]
    fn test_unpinned_limits_never_drift() {
        let account = create_test_account("acct-a", "default");
        let info = AccountInfo {
            limits: AccountLimits {
                max_memory: 1024,
                ..AccountLimits::default()
            },
            ..AccountInfo::default()
        };
        assert_eq!(AccountReconciler::diff(&account, Some(&info)).unwrap(), vec![Operation::NoOp]);
    }

    #[test]
    fn test_pinned_limit_drift() {
        let mut account = create_test_account("acct-a", "default");
        account.spec.limits = Some(AccountLimitsSpec {
            max_streams: Some(10),
            ..AccountLimitsSpec::default()
        });
        let info = AccountInfo::default();

        assert_eq!(
            AccountReconciler::diff(&account, Some(&info)).unwrap(),
            vec![Operation::Update(vec!["limits"])]
        );
    }

    #[test]
    fn test_deleting_account() {
        let mut account = create_test_account("acct-a", "default");
        mark_deleting(&mut account.metadata);

        assert_eq!(
            AccountReconciler::diff(&account, Some(&AccountInfo::default())).unwrap(),
            vec![Operation::Delete]
        );
        assert_eq!(AccountReconciler::diff(&account, None).unwrap(), vec![Operation::NoOp]);
    }
}
