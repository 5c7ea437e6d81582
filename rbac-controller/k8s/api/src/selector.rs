use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Selects the namespaces a `NamespaceRBACConfig` applies to.
///
/// Every criterion that is set must hold, except that `excludeNamespaces`
/// always takes precedence over the others.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSelector {
    /// Regular expression matched against the namespace name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_regex: Option<String>,

    /// Annotations the namespace must carry with exactly these values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Labels the namespace must carry with exactly these values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// When non-empty, only these namespaces may match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_namespaces: Vec<String>,

    /// Namespaces that never match.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_namespaces: Vec<String>,
}

impl NamespaceSelector {
    /// Returns the name regex, treating an empty pattern as unset.
    pub fn name_regex(&self) -> Option<&str> {
        self.name_regex.as_deref().filter(|re| !re.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case() {
        let selector: NamespaceSelector = serde_json::from_value(serde_json::json!({
            "nameRegex": "^team-",
            "annotations": { "team": "platform" },
            "includeNamespaces": ["team-a"],
            "excludeNamespaces": ["team-system"],
        }))
        .unwrap();
        assert_eq!(selector.name_regex(), Some("^team-"));
        assert_eq!(
            selector.annotations,
            Some(maplit::btreemap! { "team".to_string() => "platform".to_string() })
        );
        assert_eq!(selector.include_namespaces, vec!["team-a"]);
        assert_eq!(selector.exclude_namespaces, vec!["team-system"]);
        assert_eq!(selector.labels, None);
    }

    #[test]
    fn empty_regex_is_unset() {
        let selector = NamespaceSelector {
            name_regex: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(selector.name_regex(), None);
    }
}
