//! Kubernetes pod metadata cache.
//!
//! Tracks live pods, and the workloads, services and namespaces around them,
//! from informer events and answers point lookups keyed by pod IP, pod UID or
//! `{name}.{namespace}`:
//! 1. [`WatchClient`] owns the identifier -> pod map and its deferred deletes
//! 2. [`OwnerCache`] indexes ownership edges, service membership and namespaces
//! 3. [`Informer`] / [`InformerFactory`] adapt a Kubernetes watch to add/update/delete callbacks

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use regex::Regex;
use serde::Deserialize;

mod attributes;
mod client;
#[cfg(test)]
pub(crate) mod fake;
mod informer;
mod owner;
mod selectors;

pub use attributes::*;
pub use client::WatchClient;
pub use informer::{
    DeletedFinalStateUnknown, Informer, InformerFactory, InformerObject, KubeInformer,
    KubeInformerFactory, ResourceEventHandler, Transform, make_client,
};
pub use owner::{ObjectOwner, OwnerCache};
pub use selectors::{Selectors, selectors_from_filters};

/// Annotation that opts a pod out of tagging when set to `true`.
pub const IGNORE_ANNOTATION: &str = "opentelemetry.io/k8s-processor/ignore";

/// Field selector key used by the node filter.
pub const POD_NODE_FIELD: &str = "spec.nodeName";

/// Long enough to outlast the gap between an IP being freed and the watch
/// delivering the pod's delete event.
pub const DEFAULT_POD_DELETE_GRACE_PERIOD: Duration = Duration::from_secs(120);
pub const DEFAULT_DELETE_INTERVAL: Duration = Duration::from_secs(30);
pub const WATCH_SYNC_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Flat attribute map attached to telemetry.
pub type Attributes = HashMap<String, String>;

/// Lookup key for a pod: an IP address, a pod UID or `{name}.{namespace}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodIdentifier(String);

impl PodIdentifier {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `{name}.{namespace}` key, only when both parts are known.
    pub fn from_name_namespace(name: &str, namespace: &str) -> Option<Self> {
        if name.is_empty() || namespace.is_empty() {
            return None;
        }
        Some(Self(format!("{}.{}", name, namespace)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PodIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PodIdentifier {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PodIdentifier {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Every non-empty identifier a pod can be looked up by, in UID, IP,
/// `name.namespace` order.
pub(crate) fn pod_identifiers(
    uid: &str,
    ip: &str,
    name: &str,
    namespace: &str,
) -> Vec<PodIdentifier> {
    let mut ids = Vec::with_capacity(3);
    if !uid.is_empty() {
        ids.push(PodIdentifier::new(uid));
    }
    if !ip.is_empty() {
        ids.push(PodIdentifier::new(ip));
    }
    ids.extend(PodIdentifier::from_name_namespace(name, namespace));
    ids
}

/// A pod as last observed.
///
/// Never mutated once stored: updates build a new `Pod` and replace the map
/// entries, so all identifiers of one event share the same `Arc<Pod>`.
#[derive(Debug, Clone, Default)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub address: String,
    pub pod_uid: String,
    /// `status.startTime`, used to reject out-of-order updates.
    pub start_time: Option<DateTime<Utc>>,
    /// Host-network pods, excluded pod names and pods annotated with
    /// [`IGNORE_ANNOTATION`] are stored but never returned by lookups.
    pub ignore: bool,
    pub attributes: Attributes,
    pub owner_references: Arc<[OwnerReference]>,
}

impl Pod {
    pub fn identifiers(&self) -> Vec<PodIdentifier> {
        pod_identifiers(&self.pod_uid, &self.address, &self.name, &self.namespace)
    }
}

/// Which pod, owner and namespace fields become attributes, and under what keys.
#[derive(Debug, Clone, Default)]
pub struct ExtractionRules {
    pub container_id: bool,
    pub container_image: bool,
    pub container_name: bool,
    pub daemon_set_name: bool,
    pub deployment_name: bool,
    pub host_name: bool,
    pub job_name: bool,
    pub cron_job_name: bool,
    pub pod_uid: bool,
    pub pod_name: bool,
    pub replica_set_name: bool,
    pub service_name: bool,
    pub stateful_set_name: bool,
    pub start_time: bool,
    pub namespace: bool,
    pub node_name: bool,

    /// Watch owning workloads, services and namespaces. Required by every
    /// owner-derived and namespace-level rule.
    pub owner_lookup_enabled: bool,

    pub tags: ExtractionFieldTags,
    pub annotations: Vec<FieldExtractionRule>,
    pub namespace_annotations: Vec<FieldExtractionRule>,
    pub labels: Vec<FieldExtractionRule>,
    pub namespace_labels: Vec<FieldExtractionRule>,
}

impl ExtractionRules {
    pub(crate) fn needs_namespace(&self) -> bool {
        self.owner_lookup_enabled
            && !(self.namespace_labels.is_empty() && self.namespace_annotations.is_empty())
    }
}

/// Attribute keys for the extracted fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionFieldTags {
    pub container_id: String,
    pub container_image: String,
    pub container_name: String,
    pub daemon_set_name: String,
    pub deployment_name: String,
    pub host_name: String,
    pub cron_job_name: String,
    pub job_name: String,
    pub pod_uid: String,
    pub pod_name: String,
    pub namespace: String,
    pub node_name: String,
    pub replica_set_name: String,
    pub service_name: String,
    pub start_time: String,
    pub stateful_set_name: String,
}

impl Default for ExtractionFieldTags {
    fn default() -> Self {
        Self {
            container_id: TAG_CONTAINER_ID.to_string(),
            container_image: TAG_CONTAINER_IMAGE.to_string(),
            container_name: TAG_CONTAINER_NAME.to_string(),
            daemon_set_name: TAG_DAEMON_SET_NAME.to_string(),
            deployment_name: TAG_DEPLOYMENT_NAME.to_string(),
            host_name: TAG_HOST_NAME.to_string(),
            cron_job_name: TAG_CRON_JOB_NAME.to_string(),
            job_name: TAG_JOB_NAME.to_string(),
            pod_uid: TAG_POD_UID.to_string(),
            pod_name: TAG_POD_NAME.to_string(),
            namespace: TAG_NAMESPACE_NAME.to_string(),
            node_name: TAG_NODE_NAME.to_string(),
            replica_set_name: TAG_REPLICA_SET_NAME.to_string(),
            service_name: TAG_SERVICE_NAME.to_string(),
            start_time: TAG_START_TIME.to_string(),
            stateful_set_name: TAG_STATEFUL_SET_NAME.to_string(),
        }
    }
}

/// Copies one label or annotation into the attributes.
#[derive(Debug, Clone)]
pub struct FieldExtractionRule {
    /// Attribute key. With `key == "*"` it is a template where `%s` is
    /// replaced by each label/annotation name.
    pub name: String,
    /// Label/annotation name, or `*` for all of them.
    pub key: String,
    /// Optional sub-extraction; the first capture group becomes the value.
    pub regex: Option<Regex>,
}

/// Server-side filters applied to the pod watch.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    pub node: String,
    pub namespace: String,
    pub fields: Vec<FieldFilter>,
    pub labels: Vec<FieldFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldFilter {
    pub key: String,
    pub value: String,
    pub op: FilterOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Equals,
    NotEquals,
    Exists,
    DoesNotExist,
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FilterOp::Equals => "=",
            FilterOp::NotEquals => "!=",
            FilterOp::Exists => "exists",
            FilterOp::DoesNotExist => "!",
        })
    }
}

/// One rule for finding the pod identifier of incoming telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub from: String,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct Excludes {
    pub pods: Vec<ExcludePods>,
}

#[derive(Debug, Clone)]
pub struct ExcludePods {
    pub name: Regex,
}

/// Which resource feeds pod -> service membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ServiceSource {
    #[default]
    Endpoints,
    EndpointSlices,
}

/// How the agent authenticates against the API server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthType {
    /// In-cluster service account token.
    #[default]
    ServiceAccount,
    /// `$KUBECONFIG` or `~/.kube/config`.
    KubeConfig,
    /// Kubeconfig if present, in-cluster otherwise.
    #[serde(alias = "default")]
    Infer,
}

/// Everything [`WatchClient::new`] needs besides the informer factory.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub rules: ExtractionRules,
    pub filters: Filters,
    pub associations: Vec<Association>,
    pub excludes: Excludes,
    /// Joins multiple service names.
    pub delimiter: String,
    pub delete_interval: Duration,
    pub grace_period: Duration,
    pub service_source: ServiceSource,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rules: ExtractionRules::default(),
            filters: Filters::default(),
            associations: Vec::new(),
            excludes: Excludes::default(),
            delimiter: ", ".to_string(),
            delete_interval: DEFAULT_DELETE_INTERVAL,
            grace_period: DEFAULT_POD_DELETE_GRACE_PERIOD,
            service_source: ServiceSource::default(),
        }
    }
}
