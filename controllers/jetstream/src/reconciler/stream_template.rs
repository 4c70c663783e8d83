//! StreamTemplate reconciler
//!
//! The broker has no update for templates, so any drift on an existing
//! template is an unsupported change.

use super::stream::{changed_fields as stream_changes, desired_config, overlay};
use super::{DiffError, Operation, ReconcileKey, ResourceKind, ResourceReconciler, lifecycle_ops, track};
use crate::cache::ObjectCache;
use async_trait::async_trait;
use crds::{JetStreamResource, StreamTemplate};
use jetstream_client::{JetStreamClientTrait, JetStreamError, StreamTemplateConfig, StreamTemplateInfo};
use kube::ResourceExt;
use tracing::info;

/// Reconciler for [`StreamTemplate`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamTemplateReconciler;

fn desired(obj: &StreamTemplate) -> Result<StreamTemplateConfig, DiffError> {
    let name = obj.broker_name();
    if obj.spec.max_streams == 0 {
        return Err(DiffError::InvalidSpec("maxStreams must be at least 1".to_string()));
    }
    Ok(StreamTemplateConfig {
        config: desired_config(name.clone(), &obj.spec.stream)?,
        name,
        max_streams: obj.spec.max_streams,
    })
}

#[async_trait]
impl ResourceReconciler for StreamTemplateReconciler {
    type Object = StreamTemplate;
    type Observed = StreamTemplateInfo;

    fn parents(_cache: &ObjectCache, obj: &StreamTemplate) -> Vec<ReconcileKey> {
        obj.account()
            .map(|account| {
                ReconcileKey::new(ResourceKind::Account, obj.namespace().unwrap_or_default(), account)
            })
            .into_iter()
            .collect()
    }

    async fn observe(
        client: &dyn JetStreamClientTrait,
        obj: &StreamTemplate,
    ) -> Result<Option<StreamTemplateInfo>, JetStreamError> {
        client.get_stream_template(&obj.broker_name()).await
    }

    fn diff(obj: &StreamTemplate, observed: Option<&StreamTemplateInfo>) -> Result<Vec<Operation>, DiffError> {
        if let Some(ops) = lifecycle_ops(obj, observed) {
            if ops == [Operation::Create] {
                desired(obj)?;
            }
            return Ok(ops);
        }
        let Some(info) = observed else {
            return Ok(vec![Operation::NoOp]);
        };

        let mut wanted = info.config.config.clone();
        overlay(&obj.spec.stream, &mut wanted)?;
        let mut changed = Vec::new();
        track(&mut changed, "maxStreams", &info.config.max_streams, &obj.spec.max_streams);
        if !stream_changes(&info.config.config, &wanted).is_empty() {
            changed.push("stream");
        }
        if changed.is_empty() {
            Ok(vec![Operation::NoOp])
        } else {
            Err(DiffError::UnsupportedChange(changed))
        }
    }

    async fn apply(
        client: &dyn JetStreamClientTrait,
        obj: &StreamTemplate,
        _observed: Option<&StreamTemplateInfo>,
        op: &Operation,
    ) -> Result<(), JetStreamError> {
        let name = obj.broker_name();
        match op {
            Operation::Create => {
                let config = desired(obj).map_err(|e| JetStreamError::InvalidRequest(e.to_string()))?;
                client.create_stream_template(&config).await?;
                info!("Created stream template {}", name);
            }
            Operation::Update(fields) => {
                return Err(JetStreamError::Unsupported(format!(
                    "stream template {} cannot be updated ({})",
                    name,
                    fields.join(", ")
                )));
            }
            Operation::Delete => {
                if client.delete_stream_template(&name).await? {
                    info!("Deleted stream template {}", name);
                }
            }
            Operation::NoOp => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_template;
    use jetstream_client::MockJetStreamClient;

    #[tokio::test]
    async fn test_template_lifecycle() {
        let broker = MockJetStreamClient::default();
        let template = create_test_template("orders", "default");

        let observed = StreamTemplateReconciler::observe(&broker, &template).await.unwrap();
        let ops = StreamTemplateReconciler::diff(&template, observed.as_ref()).unwrap();
        assert_eq!(ops, vec![Operation::Create]);
        StreamTemplateReconciler::apply(&broker, &template, None, &ops[0]).await.unwrap();

        let observed = StreamTemplateReconciler::observe(&broker, &template).await.unwrap();
        assert_eq!(
            StreamTemplateReconciler::diff(&template, observed.as_ref()).unwrap(),
            vec![Operation::NoOp],
            "server defaults on the embedded stream are not drift"
        );
        assert_eq!(broker.stream_template("orders").unwrap().max_streams, 10);
    }

    #[test]
    fn test_any_change_is_unsupported() {
        let mut template = create_test_template("orders", "default");
        let info = StreamTemplateInfo {
            config: desired(&template).unwrap(),
            streams: Vec::new(),
        };
        template.spec.max_streams = 20;
        template.spec.stream.subjects = vec!["other.*".to_string()];

        assert_eq!(
            StreamTemplateReconciler::diff(&template, Some(&info)).unwrap_err(),
            DiffError::UnsupportedChange(vec!["maxStreams", "stream"])
        );
    }

    #[test]
    fn test_zero_max_streams_is_invalid() {
        let mut template = create_test_template("orders", "default");
        template.spec.max_streams = 0;
        assert!(matches!(
            StreamTemplateReconciler::diff(&template, None),
            Err(DiffError::InvalidSpec(_))
        ));
    }
}
