use std::{collections::HashMap, path::Path};

use config::{
    Config, ConfigBuilder, ConfigError, Environment, File, FileFormat, builder::DefaultState,
};
use serde::Deserialize;

use crate::kube::AuthType;

pub const ENV_PREFIX: &str = "PODMETA";
pub const DEFAULT_DELIMITER: &str = ", ";

/// Copies a label or annotation into an attribute.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct FieldExtractSettings {
    /// Attribute name; defaults to `k8s.<kind>.<key>`.
    #[serde(default)]
    pub tag_name: String,
    /// Label/annotation key, or `*` for all of them.
    pub key: String,
    /// Must contain exactly one named group, `value`.
    #[serde(default)]
    pub regex: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ExtractSettings {
    #[serde(default)]
    pub metadata: Vec<String>,
    /// Metadata field name -> attribute name overrides.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub annotations: Vec<FieldExtractSettings>,
    #[serde(default)]
    pub labels: Vec<FieldExtractSettings>,
    #[serde(default)]
    pub namespace_annotations: Vec<FieldExtractSettings>,
    #[serde(default)]
    pub namespace_labels: Vec<FieldExtractSettings>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

impl Default for ExtractSettings {
    fn default() -> Self {
        Self {
            metadata: Vec::new(),
            tags: HashMap::new(),
            annotations: Vec::new(),
            labels: Vec::new(),
            namespace_annotations: Vec::new(),
            namespace_labels: Vec::new(),
            delimiter: default_delimiter(),
        }
    }
}

fn default_delimiter() -> String {
    DEFAULT_DELIMITER.to_string()
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct FieldFilterSettings {
    pub key: String,
    #[serde(default)]
    pub value: String,
    /// `equals` (default), `not-equals`, `exists` or `does-not-exist`.
    #[serde(default)]
    pub op: String,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct FilterSettings {
    #[serde(default)]
    pub node: String,
    /// Environment variable holding the node name; overrides `node`.
    #[serde(default)]
    pub node_from_env_var: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub fields: Vec<FieldFilterSettings>,
    #[serde(default)]
    pub labels: Vec<FieldFilterSettings>,
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PodAssociationSettings {
    pub from: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ExcludePodSettings {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ExcludeSettings {
    #[serde(default = "default_excluded_pods")]
    pub pods: Vec<ExcludePodSettings>,
}

impl Default for ExcludeSettings {
    fn default() -> Self {
        Self {
            pods: default_excluded_pods(),
        }
    }
}

fn default_excluded_pods() -> Vec<ExcludePodSettings> {
    ["jaeger-agent", "jaeger-collector"]
        .into_iter()
        .map(|name| ExcludePodSettings {
            name: name.to_string(),
        })
        .collect()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub auth_type: AuthType,
    #[serde(default)]
    pub owner_lookup_enabled: bool,
    #[serde(default)]
    pub extract: ExtractSettings,
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub pod_association: Vec<PodAssociationSettings>,
    #[serde(default)]
    pub exclude: ExcludeSettings,
    pub pod_delete_grace_period_secs: Option<u64>,
    pub delete_interval_secs: Option<u64>,
    /// `endpoints` (default) or `endpoint_slices`.
    pub service_source: Option<String>,
}

impl Settings {
    /// Loads `.env`, then the optional YAML file, then `PODMETA_*` variables
    /// (nested keys joined with `__`), later sources winning.
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml));
        }
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("extract.metadata")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}
