use anyhow::{Result, bail};
use once_cell::sync::Lazy;
use regex::Regex;

use super::{FieldFilter, FilterOp, Filters, POD_NODE_FIELD};

static QUALIFIED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9]$").unwrap());
static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

/// Label and field selector strings for a list/watch request. Empty means
/// no selection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selectors {
    pub label: String,
    pub field: String,
}

/// Renders `filters` as selectors.
///
/// The node term is only added with `include_node`; it names a pod field
/// and would match nothing on other kinds.
pub fn selectors_from_filters(filters: &Filters, include_node: bool) -> Result<Selectors> {
    let label = filters
        .labels
        .iter()
        .map(label_requirement)
        .collect::<Result<Vec<_>>>()?
        .join(",");

    let mut fields = filters
        .fields
        .iter()
        .map(field_requirement)
        .collect::<Result<Vec<_>>>()?;
    if include_node && !filters.node.is_empty() {
        fields.push(format!(
            "{}={}",
            POD_NODE_FIELD,
            escape_field_value(&filters.node)
        ));
    }

    Ok(Selectors {
        label,
        field: fields.join(","),
    })
}

fn label_requirement(filter: &FieldFilter) -> Result<String> {
    validate_label_key(&filter.key)?;
    Ok(match filter.op {
        FilterOp::Equals => {
            validate_label_value(&filter.value)?;
            format!("{}={}", filter.key, filter.value)
        }
        FilterOp::NotEquals => {
            validate_label_value(&filter.value)?;
            format!("{}!={}", filter.key, filter.value)
        }
        FilterOp::Exists => filter.key.clone(),
        FilterOp::DoesNotExist => format!("!{}", filter.key),
    })
}

fn field_requirement(filter: &FieldFilter) -> Result<String> {
    let op = match filter.op {
        FilterOp::Equals => "=",
        FilterOp::NotEquals => "!=",
        op => bail!("field filters don't support operator: '{}'", op),
    };
    Ok(format!(
        "{}{}{}",
        filter.key,
        op,
        escape_field_value(&filter.value)
    ))
}

fn escape_field_value(value: &str) -> String {
    value
        .replace('\\', r"\\")
        .replace(',', r"\,")
        .replace('=', r"\=")
}

fn validate_label_key(key: &str) -> Result<()> {
    let name = match key.split_once('/') {
        Some((prefix, name)) => {
            if prefix.is_empty()
                || prefix.len() > MAX_PREFIX_LEN
                || !DNS_SUBDOMAIN.is_match(prefix)
            {
                bail!("invalid label key {:?}: bad prefix {:?}", key, prefix);
            }
            name
        }
        None => key,
    };
    if name.is_empty() || name.len() > MAX_NAME_LEN || !QUALIFIED_NAME.is_match(name) {
        bail!("invalid label key {:?}", key);
    }
    Ok(())
}

fn validate_label_value(value: &str) -> Result<()> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > MAX_NAME_LEN || !QUALIFIED_NAME.is_match(value) {
        bail!("invalid label value {:?}", value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(key: &str, value: &str, op: FilterOp) -> FieldFilter {
        FieldFilter {
            key: key.to_string(),
            value: value.to_string(),
            op,
        }
    }

    #[test]
    fn test_empty_filters_select_everything() {
        let selectors = selectors_from_filters(&Filters::default(), true).unwrap();
        assert_eq!(selectors, Selectors::default());
    }

    #[test]
    fn test_label_operators() {
        let filters = Filters {
            labels: vec![
                filter("app", "auth", FilterOp::Equals),
                filter("tier", "db", FilterOp::NotEquals),
                filter("example.com/canary", "", FilterOp::Exists),
                filter("legacy", "", FilterOp::DoesNotExist),
            ],
            ..Filters::default()
        };
        let selectors = selectors_from_filters(&filters, true).unwrap();
        assert_eq!(
            selectors.label,
            "app=auth,tier!=db,example.com/canary,!legacy"
        );
        assert!(selectors.field.is_empty());
    }

    #[test]
    fn test_field_filters_and_node() {
        let filters = Filters {
            node: "node-1".to_string(),
            fields: vec![
                filter("status.phase", "Running", FilterOp::Equals),
                filter("metadata.name", "a,b", FilterOp::NotEquals),
            ],
            ..Filters::default()
        };
        let selectors = selectors_from_filters(&filters, true).unwrap();
        assert_eq!(
            selectors.field,
            r"status.phase=Running,metadata.name!=a\,b,spec.nodeName=node-1"
        );
    }

    #[test]
    fn test_node_filter_is_pod_only() {
        let filters = Filters {
            node: "node-1".to_string(),
            labels: vec![filter("app", "auth", FilterOp::Equals)],
            ..Filters::default()
        };
        let selectors = selectors_from_filters(&filters, false).unwrap();
        assert_eq!(selectors.label, "app=auth");
        assert!(selectors.field.is_empty());
    }

    #[test]
    fn test_bad_filters() {
        for op in [FilterOp::Exists, FilterOp::DoesNotExist] {
            let filters = Filters {
                fields: vec![filter("status.phase", "", op)],
                ..Filters::default()
            };
            assert!(selectors_from_filters(&filters, true).is_err());
        }

        let filters = Filters {
            labels: vec![filter("bad key!", "v", FilterOp::Equals)],
            ..Filters::default()
        };
        assert!(selectors_from_filters(&filters, true).is_err());

        let filters = Filters {
            labels: vec![filter("app", "not a value", FilterOp::Equals)],
            ..Filters::default()
        };
        assert!(selectors_from_filters(&filters, true).is_err());

        let filters = Filters {
            labels: vec![filter("/app", "v", FilterOp::Equals)],
            ..Filters::default()
        };
        assert!(selectors_from_filters(&filters, true).is_err());
    }
}
