use std::collections::BTreeMap;

pub type Map = BTreeMap<String, String>;

/// Marks an object as managed by this controller.
pub const OWNER_LABEL: &str = "rbac.operator.io/owned-by";

/// Names the `NamespaceRBACConfig` an object was generated from.
pub const CONFIG_LABEL: &str = "rbac.operator.io/config";

/// Names the namespace a namespace-scoped object was generated for.
pub const NAMESPACE_LABEL: &str = "rbac.operator.io/namespace";

pub const OWNER_VALUE: &str = "namespace-rbac-operator";

/// Returns the labels that select every object generated from `config`.
pub fn config_selector(config: &str) -> Map {
    [
        (OWNER_LABEL.to_string(), OWNER_VALUE.to_string()),
        (CONFIG_LABEL.to_string(), config.to_string()),
    ]
    .into_iter()
    .collect()
}

/// Merges template-provided labels with the operator-managed labels.
///
/// The operator-managed labels are inserted last so that a template can never
/// override them. The namespace label is only set for namespace-scoped objects.
pub fn merge_managed(template: Option<Map>, config: &str, namespace: Option<&str>) -> Map {
    let mut labels = template.unwrap_or_default();
    labels.extend(config_selector(config));
    if let Some(ns) = namespace {
        labels.insert(NAMESPACE_LABEL.to_string(), ns.to_string());
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, convert_args};

    #[test]
    fn managed_labels_win() {
        let template = convert_args!(btreemap!(
            OWNER_LABEL => "someone-else",
            CONFIG_LABEL => "other-config",
            NAMESPACE_LABEL => "other-ns",
            "team" => "platform",
        ));
        let labels = merge_managed(Some(template), "cfg", Some("ns-0"));
        assert_eq!(
            labels,
            convert_args!(btreemap!(
                OWNER_LABEL => OWNER_VALUE,
                CONFIG_LABEL => "cfg",
                NAMESPACE_LABEL => "ns-0",
                "team" => "platform",
            ))
        );
    }

    #[test]
    fn cluster_scoped_objects_omit_namespace() {
        let labels = merge_managed(None, "cfg", None);
        assert_eq!(labels, config_selector("cfg"));
        assert!(!labels.contains_key(NAMESPACE_LABEL));
    }
}
