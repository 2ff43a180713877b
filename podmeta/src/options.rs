//! Validates [`Settings`] and turns them into a [`ClientConfig`].

use std::{collections::HashMap, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use log::warn;
use regex::Regex;

use crate::kube::{
    Association, ClientConfig, DEFAULT_DELETE_INTERVAL, DEFAULT_POD_DELETE_GRACE_PERIOD,
    ExcludePods, Excludes, ExtractionFieldTags, ExtractionRules, FieldExtractionRule, FieldFilter,
    FilterOp, Filters, ServiceSource,
};
use crate::settings::{
    ExcludeSettings, FieldExtractSettings, FieldFilterSettings, FilterSettings, Settings,
};

const METADATA_CONTAINER_ID: &str = "containerId";
const METADATA_CONTAINER_NAME: &str = "containerName";
const METADATA_CONTAINER_IMAGE: &str = "containerImage";
const METADATA_CRON_JOB_NAME: &str = "cronJobName";
const METADATA_DAEMON_SET_NAME: &str = "daemonSetName";
const METADATA_DEPLOYMENT_NAME: &str = "deploymentName";
const METADATA_HOST_NAME: &str = "hostName";
const METADATA_JOB_NAME: &str = "jobName";
const METADATA_NAMESPACE: &str = "namespace";
const METADATA_NODE_NAME: &str = "nodeName";
const METADATA_POD_ID: &str = "podId";
const METADATA_POD_NAME: &str = "podName";
const METADATA_REPLICA_SET_NAME: &str = "replicaSetName";
const METADATA_SERVICE_NAME: &str = "serviceName";
const METADATA_START_TIME: &str = "startTime";
const METADATA_STATEFUL_SET_NAME: &str = "statefulSetName";
const DEPRECATED_METADATA_CLUSTER_NAME: &str = "clusterName";

/// Extracted when `extract.metadata` is empty.
const DEFAULT_METADATA: &[&str] = &[
    METADATA_CONTAINER_ID,
    METADATA_CONTAINER_IMAGE,
    METADATA_CONTAINER_NAME,
    METADATA_DAEMON_SET_NAME,
    METADATA_DEPLOYMENT_NAME,
    METADATA_HOST_NAME,
    METADATA_NAMESPACE,
    METADATA_NODE_NAME,
    METADATA_POD_NAME,
    METADATA_POD_ID,
    METADATA_REPLICA_SET_NAME,
    METADATA_SERVICE_NAME,
    METADATA_START_TIME,
    METADATA_STATEFUL_SET_NAME,
];

pub fn client_config(settings: &Settings) -> Result<ClientConfig> {
    let mut rules = ExtractionRules {
        owner_lookup_enabled: settings.owner_lookup_enabled,
        ..ExtractionRules::default()
    };
    extract_metadata(&mut rules, &settings.extract.metadata)?;
    rules.tags = extract_tags(&settings.extract.tags)?;
    rules.labels = extract_field_rules("labels", &settings.extract.labels)?;
    rules.annotations = extract_field_rules("annotations", &settings.extract.annotations)?;
    rules.namespace_labels =
        extract_field_rules("namespace_labels", &settings.extract.namespace_labels)?;
    rules.namespace_annotations = extract_field_rules(
        "namespace_annotations",
        &settings.extract.namespace_annotations,
    )?;

    let service_source = match settings.service_source.as_deref() {
        None | Some("") | Some("endpoints") => ServiceSource::Endpoints,
        Some("endpoint_slices") => ServiceSource::EndpointSlices,
        Some(other) => bail!("'{}' is not a valid service source", other),
    };

    let delete_interval = seconds(settings.delete_interval_secs, DEFAULT_DELETE_INTERVAL);
    if delete_interval.is_zero() {
        bail!("delete_interval_secs must be positive");
    }

    Ok(ClientConfig {
        rules,
        filters: filters(&settings.filter)?,
        associations: settings
            .pod_association
            .iter()
            .map(|a| Association {
                from: a.from.clone(),
                name: a.name.clone(),
            })
            .collect(),
        excludes: excludes(&settings.exclude)?,
        delimiter: settings.extract.delimiter.clone(),
        delete_interval,
        grace_period: seconds(
            settings.pod_delete_grace_period_secs,
            DEFAULT_POD_DELETE_GRACE_PERIOD,
        ),
        service_source,
    })
}

fn seconds(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(default)
}

/// Turns on the extraction flag for each metadata name or its semantic
/// convention alias.
fn extract_metadata(rules: &mut ExtractionRules, fields: &[String]) -> Result<()> {
    let fields: Vec<&str> = if fields.is_empty() {
        DEFAULT_METADATA.to_vec()
    } else {
        fields.iter().map(String::as_str).collect()
    };

    for field in fields {
        match field {
            METADATA_CONTAINER_ID | "container.id" => rules.container_id = true,
            METADATA_CONTAINER_IMAGE | "container.image.name" => rules.container_image = true,
            METADATA_CONTAINER_NAME | "container.name" => rules.container_name = true,
            METADATA_CRON_JOB_NAME | "k8s.cronjob.name" => rules.cron_job_name = true,
            METADATA_DAEMON_SET_NAME | "k8s.daemonset.name" => rules.daemon_set_name = true,
            METADATA_DEPLOYMENT_NAME | "k8s.deployment.name" => rules.deployment_name = true,
            METADATA_HOST_NAME | "host.name" => rules.host_name = true,
            METADATA_JOB_NAME | "k8s.job.name" => rules.job_name = true,
            METADATA_NAMESPACE | "k8s.namespace.name" => rules.namespace = true,
            METADATA_NODE_NAME | "k8s.node.name" => rules.node_name = true,
            METADATA_POD_ID | "k8s.pod.uid" => rules.pod_uid = true,
            METADATA_POD_NAME | "k8s.pod.name" => rules.pod_name = true,
            METADATA_REPLICA_SET_NAME | "k8s.replicaset.name" => rules.replica_set_name = true,
            METADATA_SERVICE_NAME | "k8s.service.name" => rules.service_name = true,
            METADATA_START_TIME | "k8s.pod.startTime" => rules.start_time = true,
            METADATA_STATEFUL_SET_NAME | "k8s.statefulset.name" => {
                rules.stateful_set_name = true
            }
            DEPRECATED_METADATA_CLUSTER_NAME | "k8s.cluster.name" => {
                warn!("clusterName metadata field has been deprecated and is ignored")
            }
            other => bail!("\"{}\" is not a supported metadata field", other),
        }
    }
    Ok(())
}

/// Applies attribute name overrides; field names match case-insensitively.
fn extract_tags(overrides: &HashMap<String, String>) -> Result<ExtractionFieldTags> {
    let mut tags = ExtractionFieldTags::default();
    for (field, tag) in overrides {
        let slot = match field.to_lowercase() {
            f if f == METADATA_CONTAINER_ID.to_lowercase() => &mut tags.container_id,
            f if f == METADATA_CONTAINER_NAME.to_lowercase() => &mut tags.container_name,
            f if f == METADATA_CONTAINER_IMAGE.to_lowercase() => &mut tags.container_image,
            f if f == METADATA_CRON_JOB_NAME.to_lowercase() => &mut tags.cron_job_name,
            f if f == METADATA_DAEMON_SET_NAME.to_lowercase() => &mut tags.daemon_set_name,
            f if f == METADATA_DEPLOYMENT_NAME.to_lowercase() => &mut tags.deployment_name,
            f if f == METADATA_HOST_NAME.to_lowercase() => &mut tags.host_name,
            f if f == METADATA_JOB_NAME.to_lowercase() => &mut tags.job_name,
            f if f == METADATA_NAMESPACE.to_lowercase() => &mut tags.namespace,
            f if f == METADATA_NODE_NAME.to_lowercase() => &mut tags.node_name,
            f if f == METADATA_POD_ID.to_lowercase() => &mut tags.pod_uid,
            f if f == METADATA_POD_NAME.to_lowercase() => &mut tags.pod_name,
            f if f == METADATA_REPLICA_SET_NAME.to_lowercase() => &mut tags.replica_set_name,
            f if f == METADATA_SERVICE_NAME.to_lowercase() => &mut tags.service_name,
            f if f == METADATA_START_TIME.to_lowercase() => &mut tags.start_time,
            f if f == METADATA_STATEFUL_SET_NAME.to_lowercase() => &mut tags.stateful_set_name,
            f if f == DEPRECATED_METADATA_CLUSTER_NAME.to_lowercase() => {
                warn!("clusterName metadata field has been deprecated and is ignored");
                continue;
            }
            _ => bail!("\"{}\" is not a supported metadata field", field),
        };
        *slot = tag.clone();
    }
    Ok(tags)
}

/// Builds label/annotation rules. `kind` names the default attribute
/// prefix, e.g. `k8s.labels.<key>`.
pub fn extract_field_rules(
    kind: &str,
    fields: &[FieldExtractSettings],
) -> Result<Vec<FieldExtractionRule>> {
    fields
        .iter()
        .map(|field| {
            let name = match (field.tag_name.as_str(), field.key.as_str()) {
                ("", "*") => format!("k8s.{}.%s", kind),
                ("", key) => format!("k8s.{}.{}", kind, key),
                (name, _) => name.to_string(),
            };
            let regex = if field.regex.is_empty() {
                None
            } else {
                let re = Regex::new(&field.regex)
                    .with_context(|| format!("invalid {} regex {:?}", kind, field.regex))?;
                let names: Vec<Option<&str>> = re.capture_names().skip(1).collect();
                if names != [Some("value")] {
                    bail!("regex must contain exactly one named submatch (value)");
                }
                Some(re)
            };
            Ok(FieldExtractionRule {
                name,
                key: field.key.clone(),
                regex,
            })
        })
        .collect()
}

fn filter_op(filter: &FieldFilterSettings, allow_existence: bool) -> Result<FilterOp> {
    let op = match filter.op.as_str() {
        "" | "equals" => FilterOp::Equals,
        "not-equals" => FilterOp::NotEquals,
        "exists" if allow_existence => FilterOp::Exists,
        "does-not-exist" if allow_existence => FilterOp::DoesNotExist,
        other => {
            return Err(anyhow!(
                "'{}' is not a valid {} filter operation for key={}, value={}",
                other,
                if allow_existence { "label" } else { "field" },
                filter.key,
                filter.value
            ));
        }
    };
    Ok(op)
}

fn filters(settings: &FilterSettings) -> Result<Filters> {
    let node = if settings.node_from_env_var.is_empty() {
        settings.node.clone()
    } else {
        std::env::var(&settings.node_from_env_var).unwrap_or_default()
    };

    let convert = |filters: &[FieldFilterSettings], allow_existence: bool| {
        filters
            .iter()
            .map(|f| {
                Ok(FieldFilter {
                    key: f.key.clone(),
                    value: f.value.clone(),
                    op: filter_op(f, allow_existence)?,
                })
            })
            .collect::<Result<Vec<_>>>()
    };

    Ok(Filters {
        node,
        namespace: settings.namespace.clone(),
        fields: convert(&settings.fields, false)?,
        labels: convert(&settings.labels, true)?,
    })
}

fn excludes(settings: &ExcludeSettings) -> Result<Excludes> {
    let pods = settings
        .pods
        .iter()
        .map(|pod| {
            Regex::new(&pod.name)
                .map(|name| ExcludePods { name })
                .with_context(|| format!("invalid pod exclude pattern {:?}", pod.name))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Excludes { pods })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{ExcludePodSettings, PodAssociationSettings};
    use serial_test::serial;

    fn field(tag_name: &str, key: &str, regex: &str) -> FieldExtractSettings {
        FieldExtractSettings {
            tag_name: tag_name.to_string(),
            key: key.to_string(),
            regex: regex.to_string(),
        }
    }

    fn filter(key: &str, value: &str, op: &str) -> FieldFilterSettings {
        FieldFilterSettings {
            key: key.to_string(),
            value: value.to_string(),
            op: op.to_string(),
        }
    }

    #[test]
    fn test_defaults() {
        let config = client_config(&Settings::default()).unwrap();
        let rules = &config.rules;

        assert!(rules.pod_name && rules.namespace && rules.deployment_name && rules.service_name);
        assert!(!rules.job_name && !rules.cron_job_name);
        assert!(!rules.owner_lookup_enabled);
        assert_eq!(config.delimiter, ", ");
        assert_eq!(config.delete_interval, DEFAULT_DELETE_INTERVAL);
        assert_eq!(config.grace_period, DEFAULT_POD_DELETE_GRACE_PERIOD);
        assert_eq!(config.service_source, ServiceSource::Endpoints);
        assert_eq!(config.excludes.pods.len(), 2);
        assert!(config.excludes.pods[0].name.is_match("jaeger-agent-x1"));
    }

    #[test]
    fn test_metadata_names_and_aliases() {
        let mut rules = ExtractionRules::default();
        extract_metadata(
            &mut rules,
            &["k8s.cronjob.name".to_string(), "jobName".to_string(), "clusterName".to_string()],
        )
        .unwrap();
        assert!(rules.cron_job_name && rules.job_name);
        assert!(!rules.pod_name);

        let mut rules = ExtractionRules::default();
        assert!(extract_metadata(&mut rules, &["bogus".to_string()]).is_err());
    }

    #[test]
    fn test_tag_overrides() {
        let tags = extract_tags(&HashMap::from([
            ("PODNAME".to_string(), "pod".to_string()),
            ("serviceName".to_string(), "svc".to_string()),
        ]))
        .unwrap();
        assert_eq!(tags.pod_name, "pod");
        assert_eq!(tags.service_name, "svc");
        assert_eq!(tags.namespace, "k8s.namespace.name");

        assert!(extract_tags(&HashMap::from([("nope".to_string(), "x".to_string())])).is_err());
    }

    #[test]
    fn test_field_rule_names() {
        let rules = extract_field_rules(
            "labels",
            &[field("", "app", ""), field("", "*", ""), field("team", "owner", "")],
        )
        .unwrap();
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["k8s.labels.app", "k8s.labels.%s", "team"]);
    }

    #[test]
    fn test_field_rule_regex_validation() {
        assert!(extract_field_rules("labels", &[field("", "k", "k5=(?P<value>.*)")]).is_ok());
        assert!(extract_field_rules("labels", &[field("", "k", "k5=(.*)")]).is_err());
        assert!(
            extract_field_rules("labels", &[field("", "k", "(?P<value>a)(?P<other>b)")]).is_err()
        );
        assert!(extract_field_rules("labels", &[field("", "k", "(?P<value>")]).is_err());
    }

    #[test]
    fn test_filter_operations() {
        let settings = FilterSettings {
            labels: vec![
                filter("a", "1", ""),
                filter("b", "2", "not-equals"),
                filter("c", "", "exists"),
                filter("d", "", "does-not-exist"),
            ],
            fields: vec![filter("status.phase", "Running", "equals")],
            ..FilterSettings::default()
        };
        let filters = filters(&settings).unwrap();
        let ops: Vec<FilterOp> = filters.labels.iter().map(|f| f.op).collect();
        assert_eq!(
            ops,
            vec![
                FilterOp::Equals,
                FilterOp::NotEquals,
                FilterOp::Exists,
                FilterOp::DoesNotExist,
            ]
        );
        assert_eq!(filters.fields[0].op, FilterOp::Equals);

        let bad_field = FilterSettings {
            fields: vec![filter("status.phase", "", "exists")],
            ..FilterSettings::default()
        };
        assert!(super::filters(&bad_field).is_err());

        let bad_label = FilterSettings {
            labels: vec![filter("a", "1", "like")],
            ..FilterSettings::default()
        };
        assert!(super::filters(&bad_label).is_err());
    }

    #[test]
    #[serial]
    fn test_node_from_env_var() {
        unsafe {
            std::env::set_var("PODMETA_TEST_NODE", "node-7");
        }
        let settings = FilterSettings {
            node: "ignored".to_string(),
            node_from_env_var: "PODMETA_TEST_NODE".to_string(),
            ..FilterSettings::default()
        };
        assert_eq!(filters(&settings).unwrap().node, "node-7");
        unsafe {
            std::env::remove_var("PODMETA_TEST_NODE");
        }
    }

    #[test]
    fn test_full_settings() {
        let settings = Settings {
            owner_lookup_enabled: true,
            pod_association: vec![PodAssociationSettings {
                from: "connection".to_string(),
                name: String::new(),
            }],
            exclude: ExcludeSettings {
                pods: vec![ExcludePodSettings {
                    name: "^istio-".to_string(),
                }],
            },
            pod_delete_grace_period_secs: Some(10),
            delete_interval_secs: Some(1),
            service_source: Some("endpoint_slices".to_string()),
            ..Settings::default()
        };
        let config = client_config(&settings).unwrap();
        assert!(config.rules.owner_lookup_enabled);
        assert_eq!(config.associations[0].from, "connection");
        assert_eq!(config.grace_period, Duration::from_secs(10));
        assert_eq!(config.delete_interval, Duration::from_secs(1));
        assert_eq!(config.service_source, ServiceSource::EndpointSlices);
        assert_eq!(config.excludes.pods.len(), 1);
    }

    #[test]
    fn test_invalid_settings() {
        let settings = Settings {
            service_source: Some("pods".to_string()),
            ..Settings::default()
        };
        assert!(client_config(&settings).is_err());

        let settings = Settings {
            delete_interval_secs: Some(0),
            ..Settings::default()
        };
        assert!(client_config(&settings).is_err());

        let settings = Settings {
            exclude: ExcludeSettings {
                pods: vec![ExcludePodSettings {
                    name: "(".to_string(),
                }],
            },
            ..Settings::default()
        };
        assert!(client_config(&settings).is_err());
    }
}
