use std::collections::BTreeMap;

use k8s_openapi::api::core::v1 as api_v1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{Attributes, ExtractionRules, FieldExtractionRule, IGNORE_ANNOTATION};

pub const TAG_CONTAINER_ID: &str = "k8s.container.id";
pub const TAG_CONTAINER_IMAGE: &str = "k8s.container.image";
pub const TAG_CONTAINER_NAME: &str = "k8s.container.name";
pub const TAG_DAEMON_SET_NAME: &str = "k8s.daemonset.name";
pub const TAG_DEPLOYMENT_NAME: &str = "k8s.deployment.name";
pub const TAG_HOST_NAME: &str = "k8s.pod.hostname";
pub const TAG_CRON_JOB_NAME: &str = "k8s.cronjob.name";
pub const TAG_JOB_NAME: &str = "k8s.job.name";
pub const TAG_POD_UID: &str = "k8s.pod.uid";
pub const TAG_POD_NAME: &str = "k8s.pod.name";
pub const TAG_NAMESPACE_NAME: &str = "k8s.namespace.name";
pub const TAG_NODE_NAME: &str = "k8s.node.name";
pub const TAG_REPLICA_SET_NAME: &str = "k8s.replicaset.name";
pub const TAG_SERVICE_NAME: &str = "k8s.service.name";
pub const TAG_START_TIME: &str = "k8s.pod.startTime";
pub const TAG_STATEFUL_SET_NAME: &str = "k8s.statefulset.name";

impl ExtractionRules {
    /// Attributes read directly off the pod and, for namespace-level rules,
    /// its namespace. Owner-derived attributes are resolved at lookup time.
    pub fn extract_pod_attributes(
        &self,
        pod: &api_v1::Pod,
        namespace: Option<&api_v1::Namespace>,
    ) -> Attributes {
        let mut tags = Attributes::new();
        let meta = &pod.metadata;
        let name = meta.name.as_deref().unwrap_or_default();
        let spec = pod.spec.as_ref();

        if self.pod_name {
            tags.insert(self.tags.pod_name.clone(), name.to_string());
        }
        if self.namespace {
            tags.insert(
                self.tags.namespace.clone(),
                meta.namespace.clone().unwrap_or_default(),
            );
        }
        if self.start_time
            && let Some(ts) = &meta.creation_timestamp
        {
            tags.insert(self.tags.start_time.clone(), ts.0.to_rfc3339());
        }
        if self.pod_uid {
            tags.insert(
                self.tags.pod_uid.clone(),
                meta.uid.clone().unwrap_or_default(),
            );
        }
        if self.node_name {
            tags.insert(
                self.tags.node_name.clone(),
                spec.and_then(|s| s.node_name.clone()).unwrap_or_default(),
            );
        }
        if self.host_name {
            // The pod name is the hostname unless spec.hostname overrides it.
            let host = spec
                .and_then(|s| s.hostname.as_deref())
                .filter(|h| !h.is_empty())
                .unwrap_or(name);
            tags.insert(self.tags.host_name.clone(), host.to_string());
        }

        if self.container_id
            && let Some(status) = pod
                .status
                .as_ref()
                .and_then(|s| s.container_statuses.as_ref())
                .and_then(|c| c.first())
        {
            tags.insert(
                self.tags.container_id.clone(),
                status.container_id.clone().unwrap_or_default(),
            );
        }
        if let Some(container) = spec.and_then(|s| s.containers.first()) {
            if self.container_name {
                tags.insert(self.tags.container_name.clone(), container.name.clone());
            }
            if self.container_image {
                tags.insert(
                    self.tags.container_image.clone(),
                    container.image.clone().unwrap_or_default(),
                );
            }
        }

        for rule in &self.labels {
            rule.extract_into(meta.labels.as_ref(), &mut tags);
        }
        for rule in &self.annotations {
            rule.extract_into(meta.annotations.as_ref(), &mut tags);
        }

        if self.owner_lookup_enabled
            && let Some(ns) = namespace
        {
            for rule in &self.namespace_labels {
                rule.extract_into(ns.metadata.labels.as_ref(), &mut tags);
            }
            for rule in &self.namespace_annotations {
                rule.extract_into(ns.metadata.annotations.as_ref(), &mut tags);
            }
        }

        tags
    }

    /// Drops every pod field that neither extraction nor the cache bookkeeping
    /// reads, so the informer's local store holds slim copies.
    ///
    /// Extraction over the result is identical to extraction over the input.
    pub fn retain_pod_fields(&self, pod: api_v1::Pod) -> api_v1::Pod {
        let api_v1::Pod {
            metadata,
            spec,
            status,
        } = pod;

        let metadata = ObjectMeta {
            name: metadata.name,
            namespace: metadata.namespace,
            uid: metadata.uid,
            owner_references: metadata.owner_references,
            creation_timestamp: if self.start_time {
                metadata.creation_timestamp
            } else {
                None
            },
            labels: retain_keys(metadata.labels, &self.labels, None),
            annotations: retain_keys(
                metadata.annotations,
                &self.annotations,
                Some(IGNORE_ANNOTATION),
            ),
            ..ObjectMeta::default()
        };

        let spec = spec.map(|spec| api_v1::PodSpec {
            host_network: spec.host_network,
            node_name: if self.node_name { spec.node_name } else { None },
            hostname: if self.host_name { spec.hostname } else { None },
            containers: if self.container_name || self.container_image {
                spec.containers
                    .into_iter()
                    .take(1)
                    .map(|c| api_v1::Container {
                        name: c.name,
                        image: c.image,
                        ..api_v1::Container::default()
                    })
                    .collect()
            } else {
                Vec::new()
            },
            ..api_v1::PodSpec::default()
        });

        let status = status.map(|status| api_v1::PodStatus {
            pod_ip: status.pod_ip,
            start_time: status.start_time,
            container_statuses: if self.container_id {
                status.container_statuses.map(|statuses| {
                    statuses
                        .into_iter()
                        .take(1)
                        .map(|s| api_v1::ContainerStatus {
                            container_id: s.container_id,
                            ..api_v1::ContainerStatus::default()
                        })
                        .collect()
                })
            } else {
                None
            },
            ..api_v1::PodStatus::default()
        });

        api_v1::Pod {
            metadata,
            spec,
            status,
        }
    }
}

fn retain_keys(
    map: Option<BTreeMap<String, String>>,
    rules: &[FieldExtractionRule],
    always: Option<&str>,
) -> Option<BTreeMap<String, String>> {
    let map = map?;
    if rules.iter().any(|r| r.key == "*") {
        return Some(map);
    }
    let kept: BTreeMap<String, String> = map
        .into_iter()
        .filter(|(k, _)| always == Some(k.as_str()) || rules.iter().any(|r| &r.key == k))
        .collect();
    (!kept.is_empty()).then_some(kept)
}

impl FieldExtractionRule {
    /// Applies the rule to one label or annotation map. A missing key leaves
    /// `tags` untouched.
    pub fn extract_into(&self, source: Option<&BTreeMap<String, String>>, tags: &mut Attributes) {
        let Some(source) = source else { return };
        if self.key == "*" {
            for (key, value) in source {
                tags.insert(self.name.replace("%s", key), self.extract_value(value));
            }
        } else if let Some(value) = source.get(&self.key) {
            tags.insert(self.name.clone(), self.extract_value(value));
        }
    }

    /// The first capture group when a regex is set (empty on no match),
    /// the raw value otherwise.
    pub fn extract_value(&self, value: &str) -> String {
        match &self.regex {
            Some(re) => re
                .captures(value)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
            None => value.to_string(),
        }
    }
}
