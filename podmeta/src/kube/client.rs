use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use k8s_openapi::api::core::v1 as api_v1;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    Association, Attributes, ClientConfig, Excludes, ExtractionRules, Filters,
    IGNORE_ANNOTATION, Pod, PodIdentifier,
    informer::{Informer, InformerFactory, InformerObject, ResourceEventHandler, Transform},
    owner::OwnerCache,
    pod_identifiers,
    selectors::selectors_from_filters,
};
use crate::telemetry;

/// A pod identifier waiting out the grace period before removal.
#[derive(Debug)]
struct DeleteRequest {
    id: PodIdentifier,
    /// Only the entry still holding this pod is removed.
    pod_name: String,
    pod_uid: String,
    ts: Instant,
}

/// Pod metadata cache fed by a pod informer.
///
/// Designed to be wrapped in `Arc`: the informer and the delete loop hold
/// clones, lookups can come from any thread.
pub struct WatchClient {
    /// Every identifier of a pod maps to the same `Arc<Pod>`.
    pods: RwLock<HashMap<PodIdentifier, Arc<Pod>>>,
    /// FIFO by enqueue time.
    delete_queue: Mutex<VecDeque<DeleteRequest>>,
    rules: ExtractionRules,
    filters: Filters,
    associations: Vec<Association>,
    excludes: Excludes,
    delimiter: String,
    delete_interval: Duration,
    grace_period: Duration,
    owners: Option<Arc<OwnerCache>>,
    informer: Mutex<Option<Box<dyn Informer<api_v1::Pod>>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WatchClient {
    /// Builds the pod informer and, with owner lookup enabled, the owner
    /// cache. Nothing runs until [`WatchClient::start`].
    pub async fn new(factory: Arc<dyn InformerFactory>, config: ClientConfig) -> Result<Self> {
        if config.delete_interval.is_zero() {
            bail!("delete interval must be positive");
        }

        let pod_selectors = selectors_from_filters(&config.filters, true)?;
        info!(
            "K8s filtering: labelSelector={:?} fieldSelector={:?}",
            pod_selectors.label, pod_selectors.field
        );

        let owners = if config.rules.owner_lookup_enabled {
            let owner_selectors = selectors_from_filters(&config.filters, false)?;
            let owners = OwnerCache::new(
                factory.as_ref(),
                &config.rules,
                &config.filters.namespace,
                &owner_selectors,
                config.service_source,
                config.delete_interval,
                config.grace_period,
            )
            .await?;
            Some(Arc::new(owners))
        } else {
            None
        };

        let rules = config.rules.clone();
        let transform: Transform<api_v1::Pod> = Arc::new(move |pod| rules.retain_pod_fields(pod));
        let informer = factory.pods(&config.filters.namespace, &pod_selectors, transform);

        Ok(Self {
            pods: RwLock::new(HashMap::new()),
            delete_queue: Mutex::new(VecDeque::new()),
            rules: config.rules,
            filters: config.filters,
            associations: config.associations,
            excludes: config.excludes,
            delimiter: config.delimiter,
            delete_interval: config.delete_interval,
            grace_period: config.grace_period,
            owners,
            informer: Mutex::new(Some(informer)),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the owner cache, the pod informer and the delete loop.
    pub fn start(self: &Arc<Self>) {
        let Some(informer) = self.informer.lock().ok().and_then(|mut i| i.take()) else {
            warn!("Pod cache already started");
            return;
        };
        if let Some(owners) = &self.owners {
            owners.start();
        }

        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        let handler: Arc<dyn ResourceEventHandler<api_v1::Pod>> = self.clone();
        tasks.push(tokio::spawn(
            informer.run(handler, self.shutdown.child_token()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(self).delete_loop(self.shutdown.child_token()),
        ));
        info!("Pod cache started (node filter: {:?})", self.filters.node);
    }

    /// Stops every background task and waits for them to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(owners) = &self.owners {
            owners.stop().await;
        }
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Pod cache task failed: {}", e);
            }
        }
    }

    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    /// The pod behind `identifier`, unless unknown or ignored.
    pub fn get_pod(&self, identifier: &PodIdentifier) -> Option<Arc<Pod>> {
        let pod = self.pods.read().ok()?.get(identifier).cloned();
        match pod {
            Some(pod) if pod.ignore => None,
            Some(pod) => Some(pod),
            None => {
                telemetry::record_ip_lookup_miss();
                None
            }
        }
    }

    /// Full attribute set for a pod: owner-derived attributes first, then the
    /// pod's own attributes, which win on conflicting keys.
    pub fn get_pod_attributes(&self, identifier: &PodIdentifier) -> Option<Attributes> {
        let pod = self.get_pod(identifier)?;
        let mut attributes = self.owner_attributes(&pod);
        attributes.extend(
            pod.attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        Some(attributes)
    }

    fn owner_attributes(&self, pod: &Pod) -> Attributes {
        let mut attributes = Attributes::new();
        let Some(owners) = self.owners.as_ref() else {
            return attributes;
        };
        let rules = &self.rules;

        // Nearest owner of each kind wins.
        for owner in owners.get_owners(pod) {
            let tag = match owner.kind.as_str() {
                "DaemonSet" if rules.daemon_set_name => &rules.tags.daemon_set_name,
                "ReplicaSet" if rules.replica_set_name => &rules.tags.replica_set_name,
                "Deployment" if rules.deployment_name => &rules.tags.deployment_name,
                "StatefulSet" if rules.stateful_set_name => &rules.tags.stateful_set_name,
                "Job" if rules.job_name => &rules.tags.job_name,
                "CronJob" if rules.cron_job_name => &rules.tags.cron_job_name,
                _ => continue,
            };
            attributes
                .entry(tag.clone())
                .or_insert_with(|| owner.name.clone());
        }

        if rules.service_name {
            let services = owners.get_services(&pod.name);
            if !services.is_empty() {
                attributes.insert(rules.tags.service_name.clone(), services.join(&self.delimiter));
            }
        }
        attributes
    }

    fn should_ignore_pod(&self, pod: &api_v1::Pod) -> bool {
        if pod
            .spec
            .as_ref()
            .and_then(|s| s.host_network)
            .unwrap_or(false)
        {
            return true;
        }

        if pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(IGNORE_ANNOTATION))
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
        {
            return true;
        }

        let name = pod.metadata.name.as_deref().unwrap_or_default();
        self.excludes.pods.iter().any(|p| p.name.is_match(name))
    }

    fn build_pod(&self, pod: &api_v1::Pod) -> Pod {
        let meta = &pod.metadata;
        let status = pod.status.as_ref();
        let mut new_pod = Pod {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            address: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
            pod_uid: meta.uid.clone().unwrap_or_default(),
            start_time: status.and_then(|s| s.start_time.as_ref()).map(|t| t.0),
            owner_references: meta
                .owner_references
                .as_deref()
                .unwrap_or_default()
                .into(),
            ..Pod::default()
        };

        if self.should_ignore_pod(pod) {
            new_pod.ignore = true;
        } else {
            let namespace = if self.rules.needs_namespace() {
                self.owners.as_ref().and_then(|o| o.get_namespace(pod))
            } else {
                None
            };
            new_pod.attributes = self.rules.extract_pod_attributes(pod, namespace.as_deref());
        }
        new_pod
    }

    fn add_or_update_pod(&self, pod: &api_v1::Pod) {
        let new_pod = Arc::new(self.build_pod(pod));
        let Ok(mut pods) = self.pods.write() else {
            return;
        };
        for id in new_pod.identifiers() {
            // A stored pod that started later is the newer one; the event is
            // out of order for this identifier.
            if let Some(existing) = pods.get(&id)
                && let (Some(stored), Some(incoming)) = (existing.start_time, new_pod.start_time)
                && incoming < stored
            {
                debug!(
                    "Ignoring out-of-order update of {} for {}/{}",
                    id, new_pod.namespace, new_pod.name
                );
                continue;
            }
            pods.insert(id, Arc::clone(&new_pod));
        }
        telemetry::record_pod_table_size(pods.len());
    }

    /// Queues removal of each identifier still owned by this pod.
    fn forget_pod(&self, pod: &api_v1::Pod) {
        let meta = &pod.metadata;
        let name = meta.name.as_deref().unwrap_or_default();
        let uid = meta.uid.as_deref().unwrap_or_default();
        let ids = pod_identifiers(
            uid,
            pod.status
                .as_ref()
                .and_then(|s| s.pod_ip.as_deref())
                .unwrap_or_default(),
            name,
            meta.namespace.as_deref().unwrap_or_default(),
        );

        let owned: Vec<PodIdentifier> = {
            let Ok(pods) = self.pods.read() else {
                return;
            };
            ids.into_iter()
                .filter(|id| pods.get(id).is_some_and(|p| is_same_pod(p, name, uid)))
                .collect()
        };
        if owned.is_empty() {
            return;
        }

        if let Ok(mut queue) = self.delete_queue.lock() {
            let ts = Instant::now();
            queue.extend(owned.into_iter().map(|id| DeleteRequest {
                id,
                pod_name: name.to_string(),
                pod_uid: uid.to_string(),
                ts,
            }));
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
        debug!("Pod delete loop stopped");
    }

    /// Removes the queued identifiers older than the grace period whose
    /// entry still belongs to the pod that was deleted.
    fn evict_expired(&self, now: Instant) {
        let expired: Vec<DeleteRequest> = {
            let Ok(mut queue) = self.delete_queue.lock() else {
                return;
            };
            let due = queue
                .iter()
                .take_while(|req| {
                    req.ts
                        .checked_add(self.grace_period)
                        .is_some_and(|due| due <= now)
                })
                .count();
            queue.drain(..due).collect()
        };
        if expired.is_empty() {
            return;
        }

        let Ok(mut pods) = self.pods.write() else {
            return;
        };
        for req in expired {
            if pods
                .get(&req.id)
                .is_some_and(|p| is_same_pod(p, &req.pod_name, &req.pod_uid))
            {
                pods.remove(&req.id);
            }
        }
        telemetry::record_pod_table_size(pods.len());
    }
}

/// A pod recreated under the same name gets a new UID; a missing UID on
/// either side falls back to the name.
fn is_same_pod(stored: &Pod, name: &str, uid: &str) -> bool {
    stored.name == name && (uid.is_empty() || stored.pod_uid.is_empty() || stored.pod_uid == uid)
}

impl ResourceEventHandler<api_v1::Pod> for WatchClient {
    fn on_add(&self, obj: InformerObject<api_v1::Pod>) {
        telemetry::record_pod_added();
        match obj.into_object() {
            Ok(pod) => self.add_or_update_pod(&pod),
            Err(other) => error!("object received was not of type v1.Pod: {:?}", other),
        }
    }

    fn on_update(&self, _old: InformerObject<api_v1::Pod>, new: InformerObject<api_v1::Pod>) {
        telemetry::record_pod_updated();
        match new.into_object() {
            Ok(pod) => self.add_or_update_pod(&pod),
            Err(other) => error!("object received was not of type v1.Pod: {:?}", other),
        }
    }

    fn on_delete(&self, obj: InformerObject<api_v1::Pod>) {
        telemetry::record_pod_deleted();
        match obj.into_last_known() {
            Ok(pod) => self.forget_pod(&pod),
            Err(other) => error!("object received was not of type v1.Pod: {:?}", other),
        }
    }
}
