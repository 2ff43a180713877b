//! Ownership graph, pod -> service membership and namespace objects.
//!
//! Each watched kind contributes [`ObjectOwner`] nodes keyed by UID; a pod's
//! owners are found by walking owner UIDs breadth-first from the pod's own
//! owner references. Deletes are deferred by the grace period so late
//! lookups for a just-deleted pod still resolve its workload.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use k8s_openapi::{
    api::{
        core::v1::{self as api_v1, Endpoints, Namespace},
        discovery::v1::{self as discovery_v1, EndpointSlice},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    ExtractionRules, Pod, ServiceSource,
    informer::{Informer, InformerFactory, InformerObject, ResourceEventHandler},
    selectors::Selectors,
};
use crate::telemetry;

/// Label carrying the owning service name on an EndpointSlice.
const ENDPOINT_SLICE_SERVICE_LABEL: &str = "kubernetes.io/service-name";

/// A workload object reduced to what owner resolution needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectOwner {
    pub uid: String,
    pub namespace: String,
    pub kind: String,
    pub name: String,
    pub owner_uids: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct OwnerKind {
    group: &'static str,
    version: &'static str,
    kind: &'static str,
    plural: &'static str,
}

impl OwnerKind {
    fn api_resource(&self) -> ApiResource {
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(self.group, self.version, self.kind),
            self.plural,
        )
    }
}

const DAEMON_SET: OwnerKind = OwnerKind {
    group: "apps",
    version: "v1",
    kind: "DaemonSet",
    plural: "daemonsets",
};
const REPLICA_SET: OwnerKind = OwnerKind {
    group: "apps",
    version: "v1",
    kind: "ReplicaSet",
    plural: "replicasets",
};
const DEPLOYMENT: OwnerKind = OwnerKind {
    group: "apps",
    version: "v1",
    kind: "Deployment",
    plural: "deployments",
};
const STATEFUL_SET: OwnerKind = OwnerKind {
    group: "apps",
    version: "v1",
    kind: "StatefulSet",
    plural: "statefulsets",
};
const JOB: OwnerKind = OwnerKind {
    group: "batch",
    version: "v1",
    kind: "Job",
    plural: "jobs",
};
const CRON_JOB_V1: OwnerKind = OwnerKind {
    group: "batch",
    version: "v1",
    kind: "CronJob",
    plural: "cronjobs",
};
const CRON_JOB_V1BETA1: OwnerKind = OwnerKind {
    group: "batch",
    version: "v1beta1",
    kind: "CronJob",
    plural: "cronjobs",
};

/// Informers created by `new` and started by `start`.
enum PendingInformer {
    Namespaces(Box<dyn Informer<Namespace>>),
    Endpoints(Box<dyn Informer<Endpoints>>),
    EndpointSlices(Box<dyn Informer<EndpointSlice>>),
    Owners {
        kind: &'static str,
        informer: Box<dyn Informer<DynamicObject>>,
    },
}

#[derive(Debug)]
enum Eviction {
    Object { uid: String, kind: String },
    Namespace { name: String, uid: Option<String> },
    Services { service: String, pods: Vec<String> },
}

pub struct OwnerCache {
    /// UID -> owner node.
    object_owners: RwLock<HashMap<String, Arc<ObjectOwner>>>,
    /// Pod name -> sorted, deduplicated service names.
    pod_services: RwLock<HashMap<String, Vec<String>>>,
    /// Namespace name -> namespace.
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    delete_queue: Mutex<VecDeque<(Instant, Eviction)>>,
    informers: Mutex<Vec<PendingInformer>>,
    delete_interval: Duration,
    grace_period: Duration,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl OwnerCache {
    /// Creates an informer for every kind the extraction rules depend on.
    ///
    /// CronJobs are only watched when discovery reports a supported `batch`
    /// version serving them; a failed discovery call is an error.
    pub async fn new(
        factory: &dyn InformerFactory,
        rules: &ExtractionRules,
        namespace: &str,
        selectors: &Selectors,
        service_source: ServiceSource,
        delete_interval: Duration,
        grace_period: Duration,
    ) -> Result<Self> {
        let owners = |kind: &OwnerKind| {
            debug!("Watching {}/{} {}", kind.group, kind.version, kind.kind);
            PendingInformer::Owners {
                kind: kind.kind,
                informer: factory.owners(&kind.api_resource(), namespace, selectors),
            }
        };

        let mut informers = vec![PendingInformer::Namespaces(factory.namespaces())];
        if rules.daemon_set_name {
            informers.push(owners(&DAEMON_SET));
        }
        if rules.replica_set_name || rules.deployment_name {
            informers.push(owners(&REPLICA_SET));
        }
        if rules.deployment_name {
            informers.push(owners(&DEPLOYMENT));
        }
        if rules.stateful_set_name {
            informers.push(owners(&STATEFUL_SET));
        }
        if rules.service_name {
            informers.push(match service_source {
                ServiceSource::Endpoints => {
                    PendingInformer::Endpoints(factory.endpoints(namespace, selectors))
                }
                ServiceSource::EndpointSlices => {
                    PendingInformer::EndpointSlices(factory.endpoint_slices(namespace, selectors))
                }
            });
        }
        if rules.job_name || rules.cron_job_name {
            informers.push(owners(&JOB));
        }
        if rules.cron_job_name
            && let Some(kind) = discover_cron_job(factory).await?
        {
            informers.push(owners(&kind));
        }

        Ok(Self {
            object_owners: RwLock::new(HashMap::new()),
            pod_services: RwLock::new(HashMap::new()),
            namespaces: RwLock::new(HashMap::new()),
            delete_queue: Mutex::new(VecDeque::new()),
            informers: Mutex::new(informers),
            delete_interval,
            grace_period,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Runs all informers and the deferred-delete loop in the background.
    pub fn start(self: &Arc<Self>) {
        let pending: Vec<PendingInformer> = match self.informers.lock() {
            Ok(mut informers) => informers.drain(..).collect(),
            Err(_) => return,
        };
        if pending.is_empty() {
            warn!("Owner cache already started");
            return;
        }
        info!("Starting {} K8s owner informers", pending.len());

        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        for informer in pending {
            let shutdown = self.shutdown.child_token();
            let run = match informer {
                PendingInformer::Namespaces(informer) => informer.run(self.clone(), shutdown),
                PendingInformer::Endpoints(informer) => informer.run(self.clone(), shutdown),
                PendingInformer::EndpointSlices(informer) => informer.run(self.clone(), shutdown),
                PendingInformer::Owners { kind, informer } => informer.run(
                    Arc::new(OwnerEvents {
                        cache: Arc::clone(self),
                        kind,
                    }),
                    shutdown,
                ),
            };
            tasks.push(tokio::spawn(run));
        }
        tasks.push(tokio::spawn(
            Arc::clone(self).delete_loop(self.shutdown.child_token()),
        ));
    }

    /// Stops the informers and the delete loop and waits for them to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Owner cache task failed: {}", e);
            }
        }
    }

    /// Transitive owners of `pod`, nearest first.
    ///
    /// Each UID is visited at most once, so cyclic ownership data terminates.
    pub fn get_owners(&self, pod: &Pod) -> Vec<Arc<ObjectOwner>> {
        let mut result = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        for reference in pod.owner_references.iter() {
            if visited.insert(reference.uid.clone()) {
                queue.push_back(reference.uid.clone());
            }
        }

        let Ok(owners) = self.object_owners.read() else {
            return result;
        };
        while let Some(uid) = queue.pop_front() {
            let Some(owner) = owners.get(&uid) else {
                match pod.owner_references.iter().find(|r| r.uid == uid) {
                    Some(reference) => debug!(
                        "Missing owner data for pod {}/{}, cache may be out of sync: uid={} kind={} name={}",
                        pod.namespace, pod.name, uid, reference.kind, reference.name
                    ),
                    None => debug!(
                        "Missing owner data for pod {}/{}, cache may be out of sync: uid={}",
                        pod.namespace, pod.name, uid
                    ),
                }
                continue;
            };
            for parent in &owner.owner_uids {
                if visited.insert(parent.clone()) {
                    queue.push_back(parent.clone());
                }
            }
            result.push(Arc::clone(owner));
        }
        result
    }

    /// Services selecting the pod, sorted.
    pub fn get_services(&self, pod_name: &str) -> Vec<String> {
        self.pod_services
            .read()
            .ok()
            .and_then(|services| services.get(pod_name).cloned())
            .unwrap_or_default()
    }

    pub fn get_namespace(&self, pod: &api_v1::Pod) -> Option<Arc<Namespace>> {
        let name = pod.metadata.namespace.as_deref()?;
        self.namespaces.read().ok()?.get(name).cloned()
    }

    pub(super) fn cache_object(&self, kind: &str, meta: &ObjectMeta) {
        let owner = ObjectOwner {
            uid: meta.uid.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            kind: kind.to_string(),
            name: meta.name.clone().unwrap_or_default(),
            owner_uids: meta
                .owner_references
                .iter()
                .flatten()
                .map(|r| r.uid.clone())
                .collect(),
        };
        if owner.uid.is_empty() {
            warn!("Ignoring {} {}/{} without uid", kind, owner.namespace, owner.name);
            return;
        }
        if let Ok(mut owners) = self.object_owners.write() {
            owners.insert(owner.uid.clone(), Arc::new(owner));
            telemetry::record_owner_table_size(owners.len());
        }
    }

    fn cache_namespace(&self, namespace: Namespace) {
        let Some(name) = namespace.metadata.name.clone() else {
            return;
        };
        if let Ok(mut namespaces) = self.namespaces.write() {
            namespaces.insert(name, Arc::new(namespace));
        }
    }

    pub(super) fn add_service_to_pod(&self, pod_name: &str, service: &str) {
        if let Ok(mut pod_services) = self.pod_services.write() {
            let services = pod_services.entry(pod_name.to_string()).or_default();
            if let Err(pos) = services.binary_search_by(|s| s.as_str().cmp(service)) {
                services.insert(pos, service.to_string());
            }
            telemetry::record_service_table_size(pod_services.len());
        }
    }

    fn delete_service_from_pod(&self, pod_name: &str, service: &str) {
        if let Ok(mut pod_services) = self.pod_services.write() {
            if let Some(services) = pod_services.get_mut(pod_name) {
                services.retain(|s| s != service);
                if services.is_empty() {
                    pod_services.remove(pod_name);
                }
            }
            telemetry::record_service_table_size(pod_services.len());
        }
    }

    /// Applies a change in service membership: every pod in `new` gains the
    /// service, pods only in `old` lose it right away.
    fn update_service_pods(&self, service: &str, old: &[String], new: &[String]) {
        for pod in new {
            self.add_service_to_pod(pod, service);
        }
        for pod in old.iter().filter(|p| !new.contains(p)) {
            self.delete_service_from_pod(pod, service);
        }
    }

    fn defer(&self, eviction: Eviction) {
        if let Ok(mut queue) = self.delete_queue.lock() {
            queue.push_back((Instant::now(), eviction));
        }
    }

    async fn delete_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.delete_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.evict_expired(Instant::now()),
            }
        }
    }

    /// Applies every queued delete older than the grace period.
    fn evict_expired(&self, now: Instant) {
        let expired: Vec<Eviction> = {
            let Ok(mut queue) = self.delete_queue.lock() else {
                return;
            };
            let mut expired = Vec::new();
            while let Some((ts, _)) = queue.front() {
                if ts.checked_add(self.grace_period).is_none_or(|due| due > now) {
                    break;
                }
                if let Some((_, eviction)) = queue.pop_front() {
                    expired.push(eviction);
                }
            }
            expired
        };

        for eviction in expired {
            match eviction {
                Eviction::Object { uid, kind } => {
                    if let Ok(mut owners) = self.object_owners.write() {
                        owners.remove(&uid);
                        telemetry::record_owner_table_size(owners.len());
                    }
                    telemetry::record_other_deleted(&kind);
                }
                Eviction::Namespace { name, uid } => {
                    if let Ok(mut namespaces) = self.namespaces.write()
                        && namespaces
                            .get(&name)
                            .is_some_and(|ns| ns.metadata.uid == uid)
                    {
                        namespaces.remove(&name);
                    }
                    telemetry::record_other_deleted("Namespace");
                }
                Eviction::Services { service, pods } => {
                    for pod in &pods {
                        self.delete_service_from_pod(pod, &service);
                    }
                    telemetry::record_other_deleted("Endpoints");
                }
            }
        }
    }
}

/// Discovers which `batch` version serves CronJobs, if any.
async fn discover_cron_job(factory: &dyn InformerFactory) -> Result<Option<OwnerKind>> {
    let groups = factory
        .api_groups()
        .await
        .context("Failed to discover CronJob API version")?;
    let Some(preferred) = groups
        .groups
        .iter()
        .find(|g| g.name == "batch")
        .and_then(|g| g.preferred_version.as_ref())
        .map(|v| v.group_version.clone())
    else {
        info!("Server has no batch API group, CronJob names will not be extracted");
        return Ok(None);
    };

    let kind = match preferred.as_str() {
        "batch/v1" => CRON_JOB_V1,
        "batch/v1beta1" => CRON_JOB_V1BETA1,
        other => {
            info!("Unsupported batch version {}, CronJob names will not be extracted", other);
            return Ok(None);
        }
    };

    let resources = factory
        .api_group_resources(&preferred)
        .await
        .with_context(|| format!("Failed to list resources of {}", preferred))?;
    if resources
        .resources
        .iter()
        .any(|r| r.name == "cronjobs" && r.kind == "CronJob")
    {
        Ok(Some(kind))
    } else {
        info!("{} does not serve CronJobs, CronJob names will not be extracted", preferred);
        Ok(None)
    }
}

/// Names of the pods an Endpoints object routes to, ready or not.
fn endpoints_pods(endpoints: &Endpoints) -> Vec<String> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| {
            subset
                .addresses
                .iter()
                .flatten()
                .chain(subset.not_ready_addresses.iter().flatten())
        })
        .filter_map(|address| address.target_ref.as_ref())
        .filter(|target| target.kind.as_deref() == Some("Pod"))
        .filter_map(|target| target.name.clone())
        .collect()
}

fn endpoint_slice_pods(slice: &EndpointSlice) -> Vec<String> {
    slice
        .endpoints
        .iter()
        .filter_map(|endpoint| endpoint.target_ref.as_ref())
        .filter(|target| target.kind.as_deref() == Some("Pod"))
        .filter_map(|target| target.name.clone())
        .collect()
}

fn endpoint_slice_service(slice: &EndpointSlice) -> Option<String> {
    slice
        .metadata
        .labels
        .as_ref()?
        .get(ENDPOINT_SLICE_SERVICE_LABEL)
        .cloned()
}

fn pod_target(target: Option<api_v1::ObjectReference>) -> Option<api_v1::ObjectReference> {
    let target = target.filter(|t| t.kind.as_deref() == Some("Pod"))?;
    Some(api_v1::ObjectReference {
        kind: target.kind,
        name: target.name,
        ..api_v1::ObjectReference::default()
    })
}

fn identity(meta: ObjectMeta, labels: Option<BTreeMap<String, String>>) -> ObjectMeta {
    ObjectMeta {
        name: meta.name,
        namespace: meta.namespace,
        uid: meta.uid,
        labels,
        ..ObjectMeta::default()
    }
}

/// Keeps the service name and the pod references of each address.
pub(super) fn retain_endpoints_fields(endpoints: Endpoints) -> Endpoints {
    let addresses = |addresses: Option<Vec<api_v1::EndpointAddress>>| {
        let kept: Vec<api_v1::EndpointAddress> = addresses
            .into_iter()
            .flatten()
            .filter_map(|address| {
                Some(api_v1::EndpointAddress {
                    target_ref: Some(pod_target(address.target_ref)?),
                    ..api_v1::EndpointAddress::default()
                })
            })
            .collect();
        (!kept.is_empty()).then_some(kept)
    };
    Endpoints {
        metadata: identity(endpoints.metadata, None),
        subsets: endpoints.subsets.map(|subsets| {
            subsets
                .into_iter()
                .map(|subset| api_v1::EndpointSubset {
                    addresses: addresses(subset.addresses),
                    not_ready_addresses: addresses(subset.not_ready_addresses),
                    ports: None,
                })
                .collect()
        }),
    }
}

/// Keeps the service label and the pod references of each endpoint.
pub(super) fn retain_endpoint_slice_fields(slice: EndpointSlice) -> EndpointSlice {
    let labels = endpoint_slice_service(&slice)
        .map(|service| BTreeMap::from([(ENDPOINT_SLICE_SERVICE_LABEL.to_string(), service)]));
    EndpointSlice {
        metadata: identity(slice.metadata, labels),
        address_type: slice.address_type,
        endpoints: slice
            .endpoints
            .into_iter()
            .filter_map(|endpoint| {
                Some(discovery_v1::Endpoint {
                    target_ref: Some(pod_target(endpoint.target_ref)?),
                    ..discovery_v1::Endpoint::default()
                })
            })
            .collect(),
        ports: None,
    }
}

impl ResourceEventHandler<Namespace> for OwnerCache {
    fn on_add(&self, obj: InformerObject<Namespace>) {
        telemetry::record_other_added("Namespace");
        match obj.into_object() {
            Ok(namespace) => self.cache_namespace(namespace),
            Err(other) => error!("object received was not of type v1.Namespace: {:?}", other),
        }
    }

    fn on_update(&self, _old: InformerObject<Namespace>, new: InformerObject<Namespace>) {
        telemetry::record_other_updated("Namespace");
        match new.into_object() {
            Ok(namespace) => self.cache_namespace(namespace),
            Err(other) => error!("object received was not of type v1.Namespace: {:?}", other),
        }
    }

    fn on_delete(&self, obj: InformerObject<Namespace>) {
        match obj.into_last_known() {
            Ok(namespace) => self.defer(Eviction::Namespace {
                name: namespace.metadata.name.unwrap_or_default(),
                uid: namespace.metadata.uid,
            }),
            Err(other) => error!("object received was not of type v1.Namespace: {:?}", other),
        }
    }
}

impl ResourceEventHandler<Endpoints> for OwnerCache {
    fn on_add(&self, obj: InformerObject<Endpoints>) {
        telemetry::record_other_added("Endpoints");
        match obj.into_object() {
            Ok(endpoints) => {
                let service = endpoints.metadata.name.clone().unwrap_or_default();
                self.update_service_pods(&service, &[], &endpoints_pods(&endpoints));
            }
            Err(other) => error!("object received was not of type v1.Endpoints: {:?}", other),
        }
    }

    fn on_update(&self, old: InformerObject<Endpoints>, new: InformerObject<Endpoints>) {
        telemetry::record_other_updated("Endpoints");
        let new = match new.into_object() {
            Ok(new) => new,
            Err(other) => {
                error!("object received was not of type v1.Endpoints: {:?}", other);
                return;
            }
        };
        let old_pods = old
            .into_object()
            .map(|old| endpoints_pods(&old))
            .unwrap_or_default();
        let service = new.metadata.name.clone().unwrap_or_default();
        self.update_service_pods(&service, &old_pods, &endpoints_pods(&new));
    }

    fn on_delete(&self, obj: InformerObject<Endpoints>) {
        match obj.into_last_known() {
            Ok(endpoints) => self.defer(Eviction::Services {
                pods: endpoints_pods(&endpoints),
                service: endpoints.metadata.name.unwrap_or_default(),
            }),
            Err(other) => error!("object received was not of type v1.Endpoints: {:?}", other),
        }
    }
}

impl ResourceEventHandler<EndpointSlice> for OwnerCache {
    fn on_add(&self, obj: InformerObject<EndpointSlice>) {
        telemetry::record_other_added("EndpointSlice");
        match obj.into_object() {
            Ok(slice) => {
                if let Some(service) = endpoint_slice_service(&slice) {
                    self.update_service_pods(&service, &[], &endpoint_slice_pods(&slice));
                }
            }
            Err(other) => error!("object received was not of type EndpointSlice: {:?}", other),
        }
    }

    fn on_update(&self, old: InformerObject<EndpointSlice>, new: InformerObject<EndpointSlice>) {
        telemetry::record_other_updated("EndpointSlice");
        let new = match new.into_object() {
            Ok(new) => new,
            Err(other) => {
                error!("object received was not of type EndpointSlice: {:?}", other);
                return;
            }
        };
        let Some(service) = endpoint_slice_service(&new) else {
            return;
        };
        let old_pods = old
            .into_object()
            .map(|old| endpoint_slice_pods(&old))
            .unwrap_or_default();
        self.update_service_pods(&service, &old_pods, &endpoint_slice_pods(&new));
    }

    fn on_delete(&self, obj: InformerObject<EndpointSlice>) {
        match obj.into_last_known() {
            Ok(slice) => {
                if let Some(service) = endpoint_slice_service(&slice) {
                    self.defer(Eviction::Services {
                        service,
                        pods: endpoint_slice_pods(&slice),
                    });
                }
            }
            Err(other) => error!("object received was not of type EndpointSlice: {:?}", other),
        }
    }
}

/// Routes metadata-only owner events of one kind into the cache.
struct OwnerEvents {
    cache: Arc<OwnerCache>,
    kind: &'static str,
}

impl ResourceEventHandler<DynamicObject> for OwnerEvents {
    fn on_add(&self, obj: InformerObject<DynamicObject>) {
        telemetry::record_other_added(self.kind);
        match obj.into_object() {
            Ok(obj) => self.cache.cache_object(self.kind, &obj.metadata),
            Err(other) => error!("object received was not of type {}: {:?}", self.kind, other),
        }
    }

    fn on_update(&self, _old: InformerObject<DynamicObject>, new: InformerObject<DynamicObject>) {
        telemetry::record_other_updated(self.kind);
        match new.into_object() {
            Ok(obj) => self.cache.cache_object(self.kind, &obj.metadata),
            Err(other) => error!("object received was not of type {}: {:?}", self.kind, other),
        }
    }

    fn on_delete(&self, obj: InformerObject<DynamicObject>) {
        match obj.into_last_known() {
            Ok(obj) => {
                if let Some(uid) = obj.metadata.uid {
                    self.cache.defer(Eviction::Object {
                        uid,
                        kind: self.kind.to_string(),
                    });
                }
            }
            Err(other) => error!("object received was not of type {}: {:?}", self.kind, other),
        }
    }
}
