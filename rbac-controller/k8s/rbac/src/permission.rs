use crate::{
    k8s::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, Subject},
    store::Object,
};
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Role,
    ClusterRole,
    RoleBinding,
    ClusterRoleBinding,
}

/// An RBAC object the manager generates from a template.
pub trait Permission: Object {
    const KIND: ResourceKind;

    /// Folds the payload of an `existing` object into this one so that
    /// writing `self` preserves what was already granted.
    fn merge_from(&mut self, existing: &Self);
}

/// Appends `new` rules after the `existing` ones, dropping exact duplicates.
pub fn merge_rules(existing: &[PolicyRule], new: &[PolicyRule]) -> Vec<PolicyRule> {
    let mut rules = Vec::with_capacity(existing.len() + new.len());
    for rule in existing.iter().chain(new) {
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
    }
    rules
}

/// Unions subjects by kind, API group, name and namespace.
///
/// Order is preserved; a later subject with the same key replaces the earlier
/// one in place.
pub fn merge_subjects(existing: &[Subject], new: &[Subject]) -> Vec<Subject> {
    let mut subjects: Vec<Subject> = Vec::with_capacity(existing.len() + new.len());
    for subject in existing.iter().chain(new) {
        match subjects.iter_mut().find(|s| same_subject(s, subject)) {
            Some(s) => *s = subject.clone(),
            None => subjects.push(subject.clone()),
        }
    }
    subjects
}

fn same_subject(a: &Subject, b: &Subject) -> bool {
    a.kind == b.kind
        && a.api_group.as_deref().unwrap_or_default() == b.api_group.as_deref().unwrap_or_default()
        && a.name == b.name
        && a.namespace.as_deref().unwrap_or_default() == b.namespace.as_deref().unwrap_or_default()
}

fn merged_rules(existing: &Option<Vec<PolicyRule>>, new: &Option<Vec<PolicyRule>>) -> Option<Vec<PolicyRule>> {
    Some(merge_rules(
        existing.as_deref().unwrap_or_default(),
        new.as_deref().unwrap_or_default(),
    ))
}

fn merged_subjects(existing: &Option<Vec<Subject>>, new: &Option<Vec<Subject>>) -> Option<Vec<Subject>> {
    Some(merge_subjects(
        existing.as_deref().unwrap_or_default(),
        new.as_deref().unwrap_or_default(),
    ))
}

// === impl ResourceKind ===

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::ClusterRole => "clusterrole",
            Self::RoleBinding => "rolebinding",
            Self::ClusterRoleBinding => "clusterrolebinding",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl Permission ===

impl Permission for Role {
    const KIND: ResourceKind = ResourceKind::Role;

    fn merge_from(&mut self, existing: &Self) {
        self.rules = merged_rules(&existing.rules, &self.rules);
    }
}

impl Permission for ClusterRole {
    const KIND: ResourceKind = ResourceKind::ClusterRole;

    fn merge_from(&mut self, existing: &Self) {
        self.rules = merged_rules(&existing.rules, &self.rules);
        if self.aggregation_rule.is_none() {
            self.aggregation_rule = existing.aggregation_rule.clone();
        }
    }
}

impl Permission for RoleBinding {
    const KIND: ResourceKind = ResourceKind::RoleBinding;

    fn merge_from(&mut self, existing: &Self) {
        self.subjects = merged_subjects(&existing.subjects, &self.subjects);
    }
}

impl Permission for ClusterRoleBinding {
    const KIND: ResourceKind = ResourceKind::ClusterRoleBinding;

    fn merge_from(&mut self, existing: &Self) {
        self.subjects = merged_subjects(&existing.subjects, &self.subjects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn rule(resource: &str, verbs: &[&str]) -> PolicyRule {
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec![resource.to_string()]),
            verbs: verbs.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }
    }

    fn subject(kind: &str, name: &str, namespace: Option<&str>) -> Subject {
        Subject {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(Into::into),
            api_group: None,
        }
    }

    #[test]
    fn rules_are_appended_after_existing() {
        let existing = vec![rule("pods", &["get"])];
        let new = vec![rule("configmaps", &["list"])];
        assert_eq!(
            merge_rules(&existing, &new),
            vec![rule("pods", &["get"]), rule("configmaps", &["list"])]
        );
    }

    #[test]
    fn rule_merge_is_idempotent() {
        let existing = vec![rule("pods", &["get"])];
        let new = vec![rule("configmaps", &["list"])];
        let once = merge_rules(&existing, &new);
        let twice = merge_rules(&once, &new);
        assert_eq!(once, twice);
    }

    #[test]
    fn subjects_are_unioned_by_key() {
        let existing = vec![
            subject("User", "alice", None),
            subject("ServiceAccount", "default", Some("ns")),
        ];
        let new = vec![
            subject("User", "bob", None),
            subject("ServiceAccount", "default", Some("ns")),
            subject("ServiceAccount", "default", Some("other")),
        ];
        assert_eq!(
            merge_subjects(&existing, &new),
            vec![
                subject("User", "alice", None),
                subject("ServiceAccount", "default", Some("ns")),
                subject("User", "bob", None),
                subject("ServiceAccount", "default", Some("other")),
            ]
        );
    }

    #[test]
    fn later_subject_replaces_in_place() {
        let mut replacement = subject("User", "alice", None);
        replacement.api_group = Some(String::new());
        let merged = merge_subjects(
            &[subject("User", "alice", None), subject("User", "bob", None)],
            &[replacement.clone()],
        );
        assert_eq!(merged, vec![replacement, subject("User", "bob", None)]);
    }

    #[test]
    fn binding_merge_preserves_existing_subjects() {
        let existing = RoleBinding {
            subjects: Some(vec![subject("User", "alice", None)]),
            ..Default::default()
        };
        let mut desired = RoleBinding {
            subjects: Some(vec![subject("User", "bob", None)]),
            ..Default::default()
        };
        desired.merge_from(&existing);
        assert_eq!(
            desired.subjects,
            Some(vec![subject("User", "alice", None), subject("User", "bob", None)])
        );
    }

    #[test]
    fn role_merge_handles_missing_rules() {
        let existing = Role::default();
        let mut desired = Role {
            rules: Some(vec![rule("pods", &["get"])]),
            ..Default::default()
        };
        desired.merge_from(&existing);
        assert_eq!(desired.rules, Some(vec![rule("pods", &["get"])]));
    }

    #[test]
    fn kind_labels() {
        assert_eq!(ResourceKind::ClusterRoleBinding.to_string(), "clusterrolebinding");
        assert_eq!(<Role as Permission>::KIND, ResourceKind::Role);
    }
}
