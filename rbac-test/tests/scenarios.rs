use maplit::{btreemap, convert_args};
use pretty_assertions::assert_eq;
use rbac_controller_k8s_api::{
    config::CONDITION_READY, labels, NamespaceSelector, NamingConfig, RbacTemplates, Role,
    RoleBinding,
};
use rbac_test::{
    binding_template, group, mk_config, mk_namespace, role_template, rule, Harness,
};

#[tokio::test]
async fn selects_by_regex_annotation_and_exclusion() {
    let h = Harness::new();
    for name in ["e2e-staging-app", "e2e-dev-system", "e2e-other-app"] {
        let mut ns = mk_namespace(name, []);
        ns.metadata.annotations = Some(convert_args!(btreemap!("team" => "platform")));
        h.store.insert(ns);
    }

    let config = mk_config(
        "e2e-selector",
        NamespaceSelector {
            name_regex: Some("^e2e-(dev|staging)-.*".to_string()),
            annotations: Some(convert_args!(btreemap!("team" => "platform"))),
            exclude_namespaces: vec!["e2e-dev-system".to_string()],
            ..Default::default()
        },
        RbacTemplates {
            roles: vec![role_template(
                "test-role-{{.Namespace.Name}}",
                vec![rule(&["get", "list"], &["pods"])],
            )],
            ..Default::default()
        },
    );
    h.store.insert(config);
    h.converge_config("e2e-selector").await.unwrap();

    let role = h
        .store
        .fetch::<Role>(Some("e2e-staging-app"), "test-role-e2e-staging-app")
        .expect("role must be created in the selected namespace");
    assert_eq!(
        role.metadata.owner_references.unwrap()[0].name,
        "e2e-staging-app"
    );
    assert!(h
        .store
        .fetch::<Role>(Some("e2e-dev-system"), "test-role-e2e-dev-system")
        .is_none());
    assert!(h
        .store
        .fetch::<Role>(Some("e2e-other-app"), "test-role-e2e-other-app")
        .is_none());

    let status = h.config("e2e-selector").status.unwrap();
    assert_eq!(status.applied_namespaces, vec!["e2e-staging-app".to_string()]);
    assert_eq!(status.observed_generation, 1);
    assert_eq!(status.condition(CONDITION_READY).unwrap().status, "True");
    let created = status.created_resources.unwrap();
    assert_eq!(created.roles.len(), 1);
    assert_eq!(created.roles[0].name, "test-role-e2e-staging-app");
    assert_eq!(created.roles[0].namespace, "e2e-staging-app");
}

#[tokio::test]
async fn renders_naming_and_custom_variables() {
    let h = Harness::new();
    h.store.insert(mk_namespace("e2e-dev-template", [("tenant", "true")]));

    let mut tpl = role_template(
        "{{.Config.Naming.Prefix}}role-{{.Namespace.Name}}{{.Config.Naming.Suffix}}",
        vec![rule(&["get"], &["configmaps"])],
    );
    tpl.labels = Some(convert_args!(btreemap!("test-label" => "{{.CustomVars.testVar}}")));
    let mut config = mk_config(
        "e2e-template",
        NamespaceSelector {
            include_namespaces: vec!["e2e-dev-template".to_string()],
            ..Default::default()
        },
        RbacTemplates {
            roles: vec![tpl],
            ..Default::default()
        },
    );
    let options = config.spec.config.get_or_insert_with(Default::default);
    options.naming = Some(NamingConfig {
        prefix: "custom-".to_string(),
        suffix: "-v1".to_string(),
        separator: String::new(),
    });
    options.template_variables = Some(convert_args!(btreemap!("testVar" => "test-value")));
    h.store.insert(config);
    h.converge_config("e2e-template").await.unwrap();

    let role = h
        .store
        .fetch::<Role>(Some("e2e-dev-template"), "custom-role-e2e-dev-template-v1")
        .expect("role must use the configured naming");
    let labels = role.metadata.labels.unwrap();
    assert_eq!(labels["test-label"], "test-value");
    assert_eq!(labels[labels::OWNER_LABEL], labels::OWNER_VALUE);
    assert_eq!(labels[labels::CONFIG_LABEL], "e2e-template");
    assert_eq!(labels[labels::NAMESPACE_LABEL], "e2e-dev-template");
}

#[tokio::test]
async fn merges_rules_with_an_existing_role() {
    let h = Harness::new();
    h.store.insert(mk_namespace("team-a", [("tenant", "true")]));
    h.store.insert(Role {
        metadata: rbac_controller_k8s_api::ObjectMeta {
            name: Some("app-role".to_string()),
            namespace: Some("team-a".to_string()),
            ..Default::default()
        },
        rules: Some(vec![rule(&["get"], &["pods"])]),
    });

    let config = mk_config(
        "merge-rules",
        rbac_test::select_labels(rbac_test::tenant_labels()),
        RbacTemplates {
            roles: vec![role_template(
                "app-role",
                vec![rule(&["create"], &["deployments"])],
            )],
            ..Default::default()
        },
    );
    h.store.insert(config);
    h.converge_config("merge-rules").await.unwrap();

    let role = h.store.fetch::<Role>(Some("team-a"), "app-role").unwrap();
    assert_eq!(
        role.rules.unwrap(),
        vec![
            rule(&["get"], &["pods"]),
            rule(&["create"], &["deployments"]),
        ]
    );
}

#[tokio::test]
async fn merges_subjects_with_an_existing_binding() {
    let h = Harness::new();
    h.store.insert(mk_namespace("team-a", [("tenant", "true")]));
    let existing = binding_template("app-binding", "Role", "app-role", vec![]);
    h.store.insert(RoleBinding {
        metadata: rbac_controller_k8s_api::ObjectMeta {
            name: Some("app-binding".to_string()),
            namespace: Some("team-a".to_string()),
            ..Default::default()
        },
        role_ref: existing.role_ref,
        subjects: Some(vec![group("developers")]),
    });

    let config = mk_config(
        "merge-subjects",
        rbac_test::select_labels(rbac_test::tenant_labels()),
        RbacTemplates {
            role_bindings: vec![binding_template(
                "app-binding",
                "Role",
                "app-role",
                vec![group("admins"), group("developers")],
            )],
            ..Default::default()
        },
    );
    h.store.insert(config);
    h.converge_config("merge-subjects").await.unwrap();

    let binding = h
        .store
        .fetch::<RoleBinding>(Some("team-a"), "app-binding")
        .unwrap();
    assert_eq!(
        binding.subjects.unwrap(),
        vec![group("developers"), group("admins")]
    );
}
