//! In-memory [`InformerFactory`] for tests.

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, Mutex},
};

use anyhow::{Result, anyhow};
use futures::future::BoxFuture;
use k8s_openapi::{
    api::{
        core::v1::{Endpoints, Namespace, Pod, PodStatus},
        discovery::v1::EndpointSlice,
    },
    apimachinery::pkg::apis::meta::v1::{
        APIGroup, APIGroupList, APIResource, APIResourceList, GroupVersionForDiscovery,
        OwnerReference,
    },
};
use kube::api::{ApiResource, DynamicObject};
use tokio_util::sync::CancellationToken;

use super::{
    informer::{Informer, InformerFactory, ResourceEventHandler, Transform},
    selectors::Selectors,
};

/// Delivers nothing and returns once shut down.
pub struct IdleInformer<K>(PhantomData<fn() -> K>);

impl<K> IdleInformer<K> {
    pub fn boxed() -> Box<Self> {
        Box::new(Self(PhantomData))
    }
}

impl<K: 'static> Informer<K> for IdleInformer<K> {
    fn run(
        self: Box<Self>,
        _handler: Arc<dyn ResourceEventHandler<K>>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move { shutdown.cancelled().await })
    }
}

/// Records every informer it hands out as `(kind, namespace, selectors)`.
#[derive(Default)]
pub struct FakeInformerFactory {
    pub created: Mutex<Vec<(String, String, Selectors)>>,
    /// Preferred `batch` version reported by discovery, if any.
    pub batch_version: Option<String>,
    /// Resources reported per group version.
    pub resources: HashMap<String, Vec<(String, String)>>,
    pub fail_discovery: bool,
}

impl FakeInformerFactory {
    pub fn with_batch(version: &str, resources: &[(&str, &str)]) -> Self {
        Self {
            batch_version: Some(version.to_string()),
            resources: HashMap::from([(
                version.to_string(),
                resources
                    .iter()
                    .map(|(name, kind)| (name.to_string(), kind.to_string()))
                    .collect(),
            )]),
            ..Self::default()
        }
    }

    pub fn kinds(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, _, _)| kind.clone())
            .collect()
    }

    pub fn selectors_for(&self, kind: &str) -> Option<Selectors> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|(k, _, _)| k == kind)
            .map(|(_, _, s)| s.clone())
    }

    fn record(&self, kind: &str, namespace: &str, selectors: &Selectors) {
        self.created.lock().unwrap().push((
            kind.to_string(),
            namespace.to_string(),
            selectors.clone(),
        ));
    }
}

impl InformerFactory for FakeInformerFactory {
    fn pods(
        &self,
        namespace: &str,
        selectors: &Selectors,
        _transform: Transform<Pod>,
    ) -> Box<dyn Informer<Pod>> {
        self.record("Pod", namespace, selectors);
        IdleInformer::<Pod>::boxed()
    }

    fn namespaces(&self) -> Box<dyn Informer<Namespace>> {
        self.record("Namespace", "", &Selectors::default());
        IdleInformer::<Namespace>::boxed()
    }

    fn endpoints(&self, namespace: &str, selectors: &Selectors) -> Box<dyn Informer<Endpoints>> {
        self.record("Endpoints", namespace, selectors);
        IdleInformer::<Endpoints>::boxed()
    }

    fn endpoint_slices(
        &self,
        namespace: &str,
        selectors: &Selectors,
    ) -> Box<dyn Informer<EndpointSlice>> {
        self.record("EndpointSlice", namespace, selectors);
        IdleInformer::<EndpointSlice>::boxed()
    }

    fn owners(
        &self,
        resource: &ApiResource,
        namespace: &str,
        selectors: &Selectors,
    ) -> Box<dyn Informer<DynamicObject>> {
        self.record(
            &format!("{}@{}", resource.kind, resource.api_version),
            namespace,
            selectors,
        );
        IdleInformer::<DynamicObject>::boxed()
    }

    fn api_groups(&self) -> BoxFuture<'_, Result<APIGroupList>> {
        Box::pin(async move {
            if self.fail_discovery {
                return Err(anyhow!("discovery unavailable"));
            }
            let groups = self
                .batch_version
                .iter()
                .map(|version| {
                    let preferred = GroupVersionForDiscovery {
                        group_version: version.clone(),
                        version: version.trim_start_matches("batch/").to_string(),
                    };
                    APIGroup {
                        name: "batch".to_string(),
                        preferred_version: Some(preferred.clone()),
                        versions: vec![preferred],
                        server_address_by_client_cidrs: None,
                    }
                })
                .collect();
            Ok(APIGroupList { groups })
        })
    }

    fn api_group_resources<'a>(
        &'a self,
        group_version: &'a str,
    ) -> BoxFuture<'a, Result<APIResourceList>> {
        Box::pin(async move {
            let resources = self
                .resources
                .get(group_version)
                .ok_or_else(|| anyhow!("unknown group version {}", group_version))?
                .iter()
                .map(|(name, kind)| APIResource {
                    name: name.clone(),
                    kind: kind.clone(),
                    namespaced: true,
                    singular_name: String::new(),
                    verbs: vec!["list".to_string(), "watch".to_string()],
                    ..APIResource::default()
                })
                .collect();
            Ok(APIResourceList {
                group_version: group_version.to_string(),
                resources,
            })
        })
    }
}

/// A running pod with the given identity; empty strings leave fields unset.
pub fn pod(name: &str, namespace: &str, ip: &str, uid: &str) -> Pod {
    let mut pod = Pod::default();
    let set = |s: &str| (!s.is_empty()).then(|| s.to_string());
    pod.metadata.name = set(name);
    pod.metadata.namespace = set(namespace);
    pod.metadata.uid = set(uid);
    pod.status = Some(PodStatus {
        pod_ip: set(ip),
        ..PodStatus::default()
    });
    pod
}

pub fn owner_ref(kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        ..OwnerReference::default()
    }
}
