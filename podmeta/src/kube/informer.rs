//! Adapter from a Kubernetes watch to add/update/delete callbacks.
//!
//! Each [`KubeInformer`] keeps a local store keyed `namespace/name` so it can:
//! 1. Tell adds from updates and hand handlers the previous object
//! 2. Turn objects missing from a relist into [`DeletedFinalStateUnknown`] deletes
//! 3. Re-deliver every stored object as an update on each resync tick

use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use futures::{StreamExt, future::BoxFuture};
use k8s_openapi::{
    NamespaceResourceScope,
    api::{
        core::v1::{Endpoints, Namespace, Pod},
        discovery::v1::EndpointSlice,
    },
    apimachinery::pkg::apis::meta::v1::{APIGroupList, APIResourceList},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{ApiResource, DynamicObject},
    config::KubeConfigOptions,
    runtime::{WatchStreamExt, watcher},
};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::{
    AuthType, WATCH_SYNC_PERIOD,
    owner::{retain_endpoint_slice_fields, retain_endpoints_fields},
    selectors::Selectors,
};

const LIST_PAGE_SIZE: u32 = 200;

/// Last known state of an object whose delete event was missed, typically
/// because the watch was down when it happened.
#[derive(Debug, Clone)]
pub struct DeletedFinalStateUnknown<K> {
    pub key: String,
    pub obj: K,
}

/// Payload of an informer callback.
#[derive(Debug, Clone)]
pub enum InformerObject<K> {
    Object(K),
    DeletedFinalStateUnknown(DeletedFinalStateUnknown<K>),
    /// A payload of some other type. Handlers log and drop it.
    Unexpected(String),
}

impl<K> InformerObject<K> {
    pub fn into_object(self) -> Result<K, Self> {
        match self {
            InformerObject::Object(obj) => Ok(obj),
            other => Err(other),
        }
    }

    /// The object itself, looking through a tombstone.
    pub fn into_last_known(self) -> Result<K, Self> {
        match self {
            InformerObject::Object(obj) => Ok(obj),
            InformerObject::DeletedFinalStateUnknown(tombstone) => Ok(tombstone.obj),
            other => Err(other),
        }
    }
}

/// Receives informer callbacks. Calls for one informer are sequential;
/// calls from different informers may run concurrently.
pub trait ResourceEventHandler<K>: Send + Sync {
    fn on_add(&self, obj: InformerObject<K>);
    fn on_update(&self, old: InformerObject<K>, new: InformerObject<K>);
    fn on_delete(&self, obj: InformerObject<K>);
}

/// Applied to every object before it is stored or delivered.
pub type Transform<K> = Arc<dyn Fn(K) -> K + Send + Sync>;

/// A watch that delivers events to `handler` until `shutdown` fires.
pub trait Informer<K>: Send {
    fn run(
        self: Box<Self>,
        handler: Arc<dyn ResourceEventHandler<K>>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}

/// Creates the informers the caches run on, plus the discovery calls owner
/// setup needs.
pub trait InformerFactory: Send + Sync {
    /// Pods in `namespace` (all namespaces when empty).
    fn pods(
        &self,
        namespace: &str,
        selectors: &Selectors,
        transform: Transform<Pod>,
    ) -> Box<dyn Informer<Pod>>;

    /// All namespaces, unfiltered.
    fn namespaces(&self) -> Box<dyn Informer<Namespace>>;

    fn endpoints(&self, namespace: &str, selectors: &Selectors) -> Box<dyn Informer<Endpoints>>;

    fn endpoint_slices(
        &self,
        namespace: &str,
        selectors: &Selectors,
    ) -> Box<dyn Informer<EndpointSlice>>;

    /// Metadata-only watch of an owning workload kind.
    fn owners(
        &self,
        resource: &ApiResource,
        namespace: &str,
        selectors: &Selectors,
    ) -> Box<dyn Informer<DynamicObject>>;

    fn api_groups(&self) -> BoxFuture<'_, Result<APIGroupList>>;

    fn api_group_resources<'a>(
        &'a self,
        group_version: &'a str,
    ) -> BoxFuture<'a, Result<APIResourceList>>;
}

/// `namespace/name`, or `name` for cluster-scoped objects.
pub(crate) fn object_key<K: Resource>(obj: &K) -> String {
    let name = obj.name_any();
    match obj.namespace() {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns, name),
        _ => name,
    }
}

/// [`Informer`] backed by a `kube` watcher.
pub struct KubeInformer<K: Resource> {
    api: Api<K>,
    config: watcher::Config,
    transform: Option<Transform<K>>,
    resync_period: Duration,
}

impl<K> KubeInformer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    pub fn new(api: Api<K>, selectors: &Selectors) -> Self {
        let mut config = watcher::Config::default().page_size(LIST_PAGE_SIZE);
        if !selectors.label.is_empty() {
            config = config.labels(&selectors.label);
        }
        if !selectors.field.is_empty() {
            config = config.fields(&selectors.field);
        }
        Self {
            api,
            config,
            transform: None,
            resync_period: WATCH_SYNC_PERIOD,
        }
    }

    pub fn with_transform(mut self, transform: Transform<K>) -> Self {
        self.transform = Some(transform);
        self
    }

    async fn watch(self, handler: Arc<dyn ResourceEventHandler<K>>, shutdown: CancellationToken) {
        let Self {
            api,
            config,
            transform,
            resync_period,
        } = self;

        let stream = watcher(api, config).default_backoff();
        tokio::pin!(stream);

        let mut store = LocalStore::new(handler, transform);
        let mut resync =
            tokio::time::interval_at(tokio::time::Instant::now() + resync_period, resync_period);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = resync.tick() => store.resync(),
                event = stream.next() => match event {
                    Some(Ok(event)) => store.apply(event),
                    Some(Err(e)) => warn!("K8s watcher error: {}. Will retry.", e),
                    None => {
                        warn!("K8s watcher stream ended");
                        break;
                    }
                },
            }
        }
        debug!("Informer stopped with {} objects in store", store.objects.len());
    }
}

impl<K> Informer<K> for KubeInformer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn run(
        self: Box<Self>,
        handler: Arc<dyn ResourceEventHandler<K>>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin((*self).watch(handler, shutdown))
    }
}

/// Objects as last delivered, plus the keys seen by an in-progress relist.
struct LocalStore<K> {
    objects: HashMap<String, K>,
    relisted: Option<HashSet<String>>,
    handler: Arc<dyn ResourceEventHandler<K>>,
    transform: Option<Transform<K>>,
}

impl<K: Resource + Clone> LocalStore<K> {
    fn new(handler: Arc<dyn ResourceEventHandler<K>>, transform: Option<Transform<K>>) -> Self {
        Self {
            objects: HashMap::new(),
            relisted: None,
            handler,
            transform,
        }
    }

    fn transform(&self, obj: K) -> K {
        match &self.transform {
            Some(transform) => transform(obj),
            None => obj,
        }
    }

    fn apply(&mut self, event: watcher::Event<K>) {
        match event {
            watcher::Event::Apply(obj) => {
                self.upsert(obj);
            }
            watcher::Event::InitApply(obj) => {
                let key = self.upsert(obj);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key);
                }
            }
            watcher::Event::Delete(obj) => {
                let obj = self.transform(obj);
                self.objects.remove(&object_key(&obj));
                self.handler.on_delete(InformerObject::Object(obj));
            }
            watcher::Event::Init => self.relisted = Some(HashSet::new()),
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return;
                };
                let gone: Vec<String> = self
                    .objects
                    .keys()
                    .filter(|key| !relisted.contains(*key))
                    .cloned()
                    .collect();
                for key in gone {
                    if let Some(obj) = self.objects.remove(&key) {
                        self.handler.on_delete(InformerObject::DeletedFinalStateUnknown(
                            DeletedFinalStateUnknown { key, obj },
                        ));
                    }
                }
            }
        }
    }

    fn upsert(&mut self, obj: K) -> String {
        let obj = self.transform(obj);
        let key = object_key(&obj);
        match self.objects.insert(key.clone(), obj.clone()) {
            Some(old) => self
                .handler
                .on_update(InformerObject::Object(old), InformerObject::Object(obj)),
            None => self.handler.on_add(InformerObject::Object(obj)),
        }
        key
    }

    fn resync(&self) {
        for obj in self.objects.values() {
            self.handler.on_update(
                InformerObject::Object(obj.clone()),
                InformerObject::Object(obj.clone()),
            );
        }
    }
}

/// Builds a client for the configured authentication mode.
pub async fn make_client(auth: AuthType) -> Result<Client> {
    let config = match auth {
        AuthType::ServiceAccount => kube::Config::incluster()
            .context("Failed to load in-cluster config (not running in cluster?)")?,
        AuthType::KubeConfig => kube::Config::from_kubeconfig(&KubeConfigOptions::default())
            .await
            .context("Failed to load kubeconfig")?,
        AuthType::Infer => kube::Config::infer()
            .await
            .context("Failed to infer K8s config")?,
    };
    info!("Connecting to K8s API server at {}", config.cluster_url);
    Client::try_from(config).context("Failed to create K8s client")
}

/// [`InformerFactory`] talking to a live API server.
#[derive(Clone)]
pub struct KubeInformerFactory {
    client: Client,
}

impl KubeInformerFactory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

/// Owners are only read for identity and ownership edges.
fn strip_to_metadata(mut obj: DynamicObject) -> DynamicObject {
    obj.data = serde_json::Value::Null;
    obj.metadata.managed_fields = None;
    obj.metadata.annotations = None;
    obj.metadata.labels = None;
    obj
}

impl InformerFactory for KubeInformerFactory {
    fn pods(
        &self,
        namespace: &str,
        selectors: &Selectors,
        transform: Transform<Pod>,
    ) -> Box<dyn Informer<Pod>> {
        Box::new(KubeInformer::new(self.namespaced(namespace), selectors).with_transform(transform))
    }

    fn namespaces(&self) -> Box<dyn Informer<Namespace>> {
        Box::new(KubeInformer::new(
            Api::all(self.client.clone()),
            &Selectors::default(),
        ))
    }

    fn endpoints(&self, namespace: &str, selectors: &Selectors) -> Box<dyn Informer<Endpoints>> {
        Box::new(
            KubeInformer::new(self.namespaced(namespace), selectors)
                .with_transform(Arc::new(retain_endpoints_fields)),
        )
    }

    fn endpoint_slices(
        &self,
        namespace: &str,
        selectors: &Selectors,
    ) -> Box<dyn Informer<EndpointSlice>> {
        Box::new(
            KubeInformer::new(self.namespaced(namespace), selectors)
                .with_transform(Arc::new(retain_endpoint_slice_fields)),
        )
    }

    fn owners(
        &self,
        resource: &ApiResource,
        namespace: &str,
        selectors: &Selectors,
    ) -> Box<dyn Informer<DynamicObject>> {
        let api = if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        };
        Box::new(KubeInformer::new(api, selectors).with_transform(Arc::new(strip_to_metadata)))
    }

    fn api_groups(&self) -> BoxFuture<'_, Result<APIGroupList>> {
        Box::pin(async move {
            self.client
                .list_api_groups()
                .await
                .context("Failed to list API groups")
        })
    }

    fn api_group_resources<'a>(
        &'a self,
        group_version: &'a str,
    ) -> BoxFuture<'a, Result<APIResourceList>> {
        Box::pin(async move {
            self.client
                .list_api_group_resources(group_version)
                .await
                .with_context(|| format!("Failed to list resources of {}", group_version))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::ConfigMap;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }

        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn describe(obj: &InformerObject<ConfigMap>) -> String {
        match obj {
            InformerObject::Object(cm) => object_key(cm),
            InformerObject::DeletedFinalStateUnknown(t) => format!("tombstone:{}", t.key),
            InformerObject::Unexpected(s) => format!("unexpected:{}", s),
        }
    }

    impl ResourceEventHandler<ConfigMap> for Recorder {
        fn on_add(&self, obj: InformerObject<ConfigMap>) {
            self.push(format!("add {}", describe(&obj)));
        }

        fn on_update(&self, old: InformerObject<ConfigMap>, new: InformerObject<ConfigMap>) {
            self.push(format!("update {} -> {}", describe(&old), describe(&new)));
        }

        fn on_delete(&self, obj: InformerObject<ConfigMap>) {
            self.push(format!("delete {}", describe(&obj)));
        }
    }

    fn config_map(namespace: &str, name: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.to_string());
        cm.metadata.namespace = Some(namespace.to_string());
        cm
    }

    fn store(recorder: &Arc<Recorder>) -> LocalStore<ConfigMap> {
        LocalStore::new(recorder.clone(), None)
    }

    #[test]
    fn test_apply_distinguishes_add_and_update() {
        let recorder = Arc::new(Recorder::default());
        let mut store = store(&recorder);

        store.apply(watcher::Event::Apply(config_map("ns", "a")));
        store.apply(watcher::Event::Apply(config_map("ns", "a")));
        store.apply(watcher::Event::Delete(config_map("ns", "a")));

        assert_eq!(
            recorder.take(),
            vec!["add ns/a", "update ns/a -> ns/a", "delete ns/a"]
        );
        assert!(store.objects.is_empty());
    }

    #[test]
    fn test_relist_emits_tombstones_for_missed_deletes() {
        let recorder = Arc::new(Recorder::default());
        let mut store = store(&recorder);
        store.apply(watcher::Event::Apply(config_map("ns", "a")));
        store.apply(watcher::Event::Apply(config_map("ns", "b")));
        recorder.take();

        store.apply(watcher::Event::Init);
        store.apply(watcher::Event::InitApply(config_map("ns", "a")));
        store.apply(watcher::Event::InitApply(config_map("ns", "c")));
        store.apply(watcher::Event::InitDone);

        assert_eq!(
            recorder.take(),
            vec!["update ns/a -> ns/a", "add ns/c", "delete tombstone:ns/b"]
        );
        assert_eq!(store.objects.len(), 2);
    }

    #[test]
    fn test_resync_redelivers_stored_objects() {
        let recorder = Arc::new(Recorder::default());
        let mut store = store(&recorder);
        store.apply(watcher::Event::Apply(config_map("ns", "a")));
        recorder.take();

        store.resync();
        assert_eq!(recorder.take(), vec!["update ns/a -> ns/a"]);
    }

    #[test]
    fn test_transform_applies_before_delivery() {
        let recorder = Arc::new(Recorder::default());
        let transform: Transform<ConfigMap> = Arc::new(|mut cm: ConfigMap| {
            cm.metadata.namespace = Some("rewritten".to_string());
            cm
        });
        let mut store = LocalStore::new(recorder.clone(), Some(transform));

        store.apply(watcher::Event::Apply(config_map("ns", "a")));
        assert_eq!(recorder.take(), vec!["add rewritten/a"]);
    }

    #[test]
    fn test_into_last_known() {
        let tombstone = InformerObject::DeletedFinalStateUnknown(DeletedFinalStateUnknown {
            key: "ns/a".to_string(),
            obj: config_map("ns", "a"),
        });
        assert!(tombstone.clone().into_object().is_err());
        assert_eq!(
            tombstone.into_last_known().ok().map(|cm| object_key(&cm)),
            Some("ns/a".to_string())
        );

        let unexpected = InformerObject::<ConfigMap>::Unexpected("42".to_string());
        assert!(unexpected.into_last_known().is_err());
    }

    #[test]
    fn test_strip_to_metadata() {
        let mut obj = DynamicObject::new(
            "rs",
            &ApiResource::from_gvk_with_plural(
                &kube::api::GroupVersionKind::gvk("apps", "v1", "ReplicaSet"),
                "replicasets",
            ),
        )
        .within("ns");
        obj.metadata.uid = Some("uid-1".to_string());
        obj.data = serde_json::json!({"spec": {"replicas": 3}});

        let obj = strip_to_metadata(obj);
        assert_eq!(obj.data, serde_json::Value::Null);
        assert_eq!(obj.metadata.uid.as_deref(), Some("uid-1"));
        assert_eq!(object_key(&obj), "ns/rs");
    }
}
