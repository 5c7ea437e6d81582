use maplit::{btreemap, convert_args};
use pretty_assertions::assert_eq;
use rbac_controller_k8s_api::{
    labels, ClusterRole, MergeStrategy, Namespace, NamespaceRbacConfig, ObjectMeta, RbacTemplates,
    Role, RoleBinding,
};
use rbac_controller_k8s_rbac::{Error, ResourceKind};
use rbac_test::{
    binding_template, group, mk_config, mk_namespace, role_template, rule, select_labels,
    service_account, tenant_labels, with_merge_strategy, Harness,
};

fn app_config(strategy: MergeStrategy) -> NamespaceRbacConfig {
    with_merge_strategy(
        mk_config(
            "app",
            select_labels(tenant_labels()),
            RbacTemplates {
                roles: vec![role_template(
                    "app-role",
                    vec![rule(&["create"], &["deployments"])],
                )],
                role_bindings: vec![binding_template(
                    "app-binding",
                    "Role",
                    "app-role",
                    vec![service_account("deployer", "{{.Namespace.Name}}")],
                )],
                ..Default::default()
            },
        ),
        strategy,
    )
}

fn existing_role() -> Role {
    Role {
        metadata: ObjectMeta {
            name: Some("app-role".to_string()),
            namespace: Some("team-a".to_string()),
            labels: Some(convert_args!(btreemap!("origin" => "manual"))),
            ..Default::default()
        },
        rules: Some(vec![rule(&["get"], &["pods"])]),
    }
}

fn setup(h: &Harness) -> Namespace {
    h.store.insert(mk_namespace("team-a", [("tenant", "true")]))
}

#[tokio::test]
async fn merge_is_idempotent() {
    let h = Harness::new();
    let ns = setup(&h);
    h.store.insert(existing_role());
    let config = app_config(MergeStrategy::Merge);

    h.manager.apply_for_namespace(&ns, &config).await.unwrap();
    let once = h.store.fetch::<Role>(Some("team-a"), "app-role").unwrap();
    h.manager.apply_for_namespace(&ns, &config).await.unwrap();
    let twice = h.store.fetch::<Role>(Some("team-a"), "app-role").unwrap();

    assert_eq!(once.rules, twice.rules);
    assert_eq!(once.rules.unwrap().len(), 2);

    let binding = h
        .store
        .fetch::<RoleBinding>(Some("team-a"), "app-binding")
        .unwrap();
    assert_eq!(
        binding.subjects.unwrap(),
        vec![service_account("deployer", "team-a")]
    );
}

#[tokio::test]
async fn ignore_leaves_existing_objects_untouched() {
    let h = Harness::new();
    let ns = setup(&h);
    let before = h.store.insert(existing_role());
    let config = app_config(MergeStrategy::Ignore);

    h.manager.apply_for_namespace(&ns, &config).await.unwrap();

    let after = h.store.fetch::<Role>(Some("team-a"), "app-role").unwrap();
    assert_eq!(after, before);
    assert_eq!(h.store.writes::<Role>(Some("team-a"), "app-role"), 0);
    // Objects that do not exist yet are still created.
    assert!(h
        .store
        .fetch::<RoleBinding>(Some("team-a"), "app-binding")
        .is_some());
}

#[tokio::test]
async fn replace_discards_the_existing_payload() {
    let h = Harness::new();
    let ns = setup(&h);
    h.store.insert(existing_role());
    let config = app_config(MergeStrategy::Replace);

    h.manager.apply_for_namespace(&ns, &config).await.unwrap();

    let role = h.store.fetch::<Role>(Some("team-a"), "app-role").unwrap();
    assert_eq!(role.rules.unwrap(), vec![rule(&["create"], &["deployments"])]);
    let labels = role.metadata.labels.unwrap();
    assert!(!labels.contains_key("origin"));
    assert_eq!(labels[labels::CONFIG_LABEL], "app");
}

#[tokio::test]
async fn operator_labels_override_template_labels() {
    let h = Harness::new();
    let ns = setup(&h);
    let mut tpl = role_template("app-role", vec![rule(&["get"], &["pods"])]);
    tpl.labels = Some(convert_args!(btreemap!(
        labels::OWNER_LABEL => "someone-else",
        labels::CONFIG_LABEL => "{{.Namespace.Name}}",
        "team" => "platform",
    )));
    let config = mk_config(
        "app",
        select_labels(tenant_labels()),
        RbacTemplates {
            roles: vec![tpl],
            ..Default::default()
        },
    );

    h.manager.apply_for_namespace(&ns, &config).await.unwrap();

    let role = h.store.fetch::<Role>(Some("team-a"), "app-role").unwrap();
    assert_eq!(
        role.metadata.labels.unwrap(),
        convert_args!(btreemap!(
            labels::OWNER_LABEL => labels::OWNER_VALUE,
            labels::CONFIG_LABEL => "app",
            labels::NAMESPACE_LABEL => "team-a",
            "team" => "platform",
        ))
    );
}

#[tokio::test]
async fn namespaced_conflicts_are_retried() {
    let h = Harness::new();
    let ns = setup(&h);
    h.store.insert(existing_role());
    h.store
        .inject_conflicts::<Role>(Some("team-a"), "app-role", 2);

    h.manager
        .apply_for_namespace(&ns, &app_config(MergeStrategy::Merge))
        .await
        .unwrap();

    assert_eq!(h.store.writes::<Role>(Some("team-a"), "app-role"), 3);
    let role = h.store.fetch::<Role>(Some("team-a"), "app-role").unwrap();
    assert_eq!(role.rules.unwrap().len(), 2);
}

#[tokio::test]
async fn namespaced_conflicts_are_bounded() {
    let h = Harness::new();
    let ns = setup(&h);
    h.store
        .inject_conflicts::<Role>(Some("team-a"), "app-role", 3);

    let error = h
        .manager
        .apply_for_namespace(&ns, &app_config(MergeStrategy::Merge))
        .await
        .unwrap_err();

    assert!(
        matches!(
            error,
            Error::Conflict {
                kind: ResourceKind::Role,
                attempts: 3,
                ..
            }
        ),
        "{error:?}"
    );
    assert_eq!(error.error_type(), "conflict");
    // The pass stops at the first failure.
    assert!(h
        .store
        .fetch::<RoleBinding>(Some("team-a"), "app-binding")
        .is_none());
}

#[tokio::test]
async fn cluster_scoped_conflicts_are_not_retried() {
    let h = Harness::new();
    let ns = setup(&h);
    let config = mk_config(
        "app",
        select_labels(tenant_labels()),
        RbacTemplates {
            cluster_roles: vec![role_template(
                "{{.Namespace.Name}}-reader",
                vec![rule(&["get"], &["namespaces"])],
            )],
            ..Default::default()
        },
    );
    h.store.inject_conflicts::<ClusterRole>(None, "team-a-reader", 1);

    let error = h
        .manager
        .apply_for_namespace(&ns, &config)
        .await
        .unwrap_err();

    assert!(matches!(error, Error::Conflict { attempts: 1, .. }), "{error:?}");
    assert_eq!(h.store.writes::<ClusterRole>(None, "team-a-reader"), 1);
}

#[tokio::test]
async fn template_errors_name_the_template() {
    let h = Harness::new();
    let ns = setup(&h);
    let config = mk_config(
        "app",
        select_labels(tenant_labels()),
        RbacTemplates {
            role_bindings: vec![binding_template(
                "app-binding",
                "Role",
                "{{.CustomVars.role}}",
                vec![group("developers")],
            )],
            ..Default::default()
        },
    );

    let error = h
        .manager
        .apply_for_namespace(&ns, &config)
        .await
        .unwrap_err();

    assert!(error.is_template(), "{error:?}");
    assert_eq!(error.error_type(), "template");
    assert!(h.metrics().contains(
        "rbac_operator_template_processing_errors_total{config=\"app\",template_type=\"rolebinding_roleref\"} 1"
    ));
}
