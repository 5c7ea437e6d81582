use rbac_controller_k8s_api::{Namespace, NamespaceSelector, ResourceExt};
use regex::Regex;
use std::collections::BTreeMap;

/// A [`NamespaceSelector`] with its name pattern compiled.
#[derive(Clone, Debug)]
pub struct NamespaceMatcher<'s> {
    selector: &'s NamespaceSelector,
    name_regex: Option<Regex>,
}

/// Evaluates `selector` against `ns`.
///
/// Fails only when the selector's name regex does not compile and the
/// namespace passes the exclusion and inclusion lists.
pub fn matches(ns: &Namespace, selector: &NamespaceSelector) -> Result<bool, regex::Error> {
    if !listed(selector, &ns.name_any()) {
        return Ok(false);
    }
    Ok(NamespaceMatcher::compile(selector)?.matches(ns))
}

// === impl NamespaceMatcher ===

impl<'s> NamespaceMatcher<'s> {
    pub fn compile(selector: &'s NamespaceSelector) -> Result<Self, regex::Error> {
        let name_regex = selector.name_regex().map(Regex::new).transpose()?;
        Ok(Self {
            selector,
            name_regex,
        })
    }

    pub fn matches(&self, ns: &Namespace) -> bool {
        let name = ns.name_any();
        if !listed(self.selector, &name) {
            return false;
        }

        if let Some(re) = &self.name_regex {
            if !re.is_match(&name) {
                return false;
            }
        }

        contains_all(ns.metadata.annotations.as_ref(), self.selector.annotations.as_ref())
            && contains_all(ns.metadata.labels.as_ref(), self.selector.labels.as_ref())
    }
}

/// Applies the exclusion list, then the inclusion list. Exclusions take
/// precedence over every other criterion.
fn listed(selector: &NamespaceSelector, name: &str) -> bool {
    if selector.exclude_namespaces.iter().any(|n| n == name) {
        return false;
    }
    selector.include_namespaces.is_empty() || selector.include_namespaces.iter().any(|n| n == name)
}

fn contains_all(
    actual: Option<&BTreeMap<String, String>>,
    required: Option<&BTreeMap<String, String>>,
) -> bool {
    let required = match required {
        Some(required) if !required.is_empty() => required,
        _ => return true,
    };
    let actual = match actual {
        Some(actual) => actual,
        None => return false,
    };
    required.iter().all(|(k, v)| actual.get(k) == Some(v))
}
