pub mod association;
pub mod kube;
pub mod options;
pub mod settings;
pub mod telemetry;

use std::{collections::BTreeMap, net::IpAddr, sync::Arc};

use anyhow::Result;
use log::{info, warn};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    signal,
};

use crate::kube::{
    Attributes, ClientConfig, InformerFactory, KubeInformerFactory, PodIdentifier, WatchClient,
    make_client,
};
use crate::settings::Settings;

/// One lookup read from stdin: `key=value` attributes, an optional
/// connection address and an optional bare pod identifier.
#[derive(Debug, Default, PartialEq)]
pub struct Query {
    pub attributes: Attributes,
    pub connection: Option<IpAddr>,
    pub identifier: Option<PodIdentifier>,
}

impl Query {
    pub fn parse(line: &str) -> Self {
        let mut query = Query::default();
        for token in line.split_whitespace() {
            if let Some((key, value)) = token.split_once('=') {
                query.attributes.insert(key.to_string(), value.to_string());
            } else if query.connection.is_none()
                && let Some(ip) = association::connection_ip(token)
            {
                query.connection = Some(ip);
            } else {
                query.identifier = Some(PodIdentifier::from(token));
            }
        }
        query
    }
}

pub struct PodMetaEngine {
    pub settings: Settings,
    client: Arc<WatchClient>,
}

impl PodMetaEngine {
    pub async fn new(settings: Settings) -> Result<Self> {
        let config = options::client_config(&settings)?;
        let factory = Arc::new(KubeInformerFactory::new(
            make_client(settings.auth_type).await?,
        ));
        Self::with_factory(settings, factory, config).await
    }

    pub async fn with_factory(
        settings: Settings,
        factory: Arc<dyn InformerFactory>,
        config: ClientConfig,
    ) -> Result<Self> {
        let client = WatchClient::new(factory, config).await?;
        Ok(Self {
            settings,
            client: Arc::new(client),
        })
    }

    /// Answers stdin queries with one JSON line each until EOF or Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.client.start();
        info!("Pod cache running. Reading queries from stdin, Ctrl-C to exit.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        let result = loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Exiting...");
                    break Ok(());
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let mut out = self.lookup(&line).to_string();
                        out.push('\n');
                        if let Err(e) = stdout.write_all(out.as_bytes()).await {
                            break Err(e.into());
                        }
                        if let Err(e) = stdout.flush().await {
                            break Err(e.into());
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => {
                        warn!("Failed to read query: {}", e);
                        break Err(e.into());
                    }
                },
            }
        };

        self.client.stop().await;
        result
    }

    /// Resolves a query line to `{"identifier": .., "attributes": ..}`.
    pub fn lookup(&self, line: &str) -> Value {
        let query = Query::parse(line);
        let identifier = query.identifier.or_else(|| {
            association::extract_pod_id(
                &query.attributes,
                query.connection,
                self.client.associations(),
            )
            .map(|(_, id)| id)
        });

        let Some(identifier) = identifier else {
            return json!({ "identifier": null, "attributes": null });
        };
        let attributes = self
            .client
            .get_pod_attributes(&identifier)
            .map(|attrs| attrs.into_iter().collect::<BTreeMap<_, _>>());
        json!({ "identifier": identifier.as_str(), "attributes": attributes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::{InformerObject, ResourceEventHandler, fake};

    async fn engine() -> PodMetaEngine {
        let settings = Settings::default();
        let config = options::client_config(&settings).unwrap();
        let engine = PodMetaEngine::with_factory(
            settings,
            Arc::new(fake::FakeInformerFactory::default()),
            config,
        )
        .await
        .unwrap();
        engine
            .client
            .on_add(InformerObject::Object(fake::pod("podA", "ns1", "1.1.1.1", "u1")));
        engine
    }

    #[test]
    fn test_parse_query() {
        let query = Query::parse("k8s.pod.uid=u1 10.0.0.1:4317  podA.ns1");
        assert_eq!(query.attributes.get("k8s.pod.uid").map(String::as_str), Some("u1"));
        assert_eq!(query.connection, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(query.identifier, Some(PodIdentifier::new("podA.ns1")));

        assert_eq!(Query::parse("   "), Query::default());
    }

    #[tokio::test]
    async fn test_lookup_by_connection_and_identifier() {
        let engine = engine().await;

        let found = engine.lookup("1.1.1.1");
        assert_eq!(found["identifier"], "1.1.1.1");
        assert_eq!(found["attributes"]["k8s.pod.name"], "podA");
        assert_eq!(found["attributes"]["k8s.namespace.name"], "ns1");

        let found = engine.lookup("podA.ns1");
        assert_eq!(found["attributes"]["k8s.pod.uid"], "u1");

        let found = engine.lookup("k8s.pod.ip=1.1.1.1");
        assert_eq!(found["attributes"]["k8s.pod.name"], "podA");
    }

    #[tokio::test]
    async fn test_lookup_misses() {
        let engine = engine().await;

        let found = engine.lookup("2.2.2.2");
        assert_eq!(found["identifier"], "2.2.2.2");
        assert!(found["attributes"].is_null());

        let found = engine.lookup("service.name=checkout");
        assert!(found["identifier"].is_null());
    }
}
