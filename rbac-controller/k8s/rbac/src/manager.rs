use crate::{
    core::{template, Context, Engine, NamespaceMatcher},
    k8s::{
        labels, BindingTemplate, ClusterRole, ClusterRoleBinding, CreatedResources, MergeStrategy,
        Namespace, NamespaceRbacConfig, ObjectMeta, OwnerReference, Resource, ResourceExt,
        ResourceReference, Role, RoleBinding, RoleRef, RoleTemplate, Subject,
    },
    metrics::ManagerMetrics,
    permission::{Permission, ResourceKind},
    store::{self, Store},
};
use ahash::AHashSet;
use std::collections::BTreeMap;
use tokio::time;

/// Namespaced objects may race other writers in the namespace; cluster-scoped
/// objects are shared across namespaces and fail on the first conflict.
const NAMESPACED_ATTEMPTS: usize = 3;
const CLUSTER_ATTEMPTS: usize = 1;

/// Turns a config's templates into RBAC objects and writes them.
#[derive(Clone)]
pub struct Manager<S> {
    store: S,
    engine: Engine,
    metrics: ManagerMetrics,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Ignore,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to process {kind} template {template:?} ({field}): {source}")]
    Template {
        kind: ResourceKind,
        template: String,
        field: &'static str,
        #[source]
        source: template::Error,
    },

    #[error("invalid namespace selector: {0}")]
    Selector(#[from] regex::Error),

    #[error("namespace {0} has no uid")]
    OwnerReference(String),

    #[error("failed to write {kind} {name}: {source}")]
    Store {
        kind: &'static str,
        name: String,
        #[source]
        source: store::Error,
    },

    #[error("failed to write {kind} {name} after {attempts} attempts due to conflicts")]
    Conflict {
        kind: ResourceKind,
        name: String,
        attempts: usize,
    },
}

/// Names of cluster-scoped objects that some namespace still renders.
#[derive(Debug, Default)]
struct Referenced {
    cluster_roles: AHashSet<String>,
    cluster_role_bindings: AHashSet<String>,
}

/// Labels, annotations and name rendered for a single object.
struct Meta {
    name: String,
    labels: Option<BTreeMap<String, String>>,
    annotations: Option<BTreeMap<String, String>>,
}

// === impl Manager ===

impl<S: Store> Manager<S> {
    pub fn new(store: S, metrics: ManagerMetrics) -> Self {
        Self {
            store,
            engine: Engine::default(),
            metrics,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Applies every template of `config` to `ns`.
    ///
    /// Roles are written first, then cluster roles, role bindings and cluster
    /// role bindings, each in declaration order. The first failure aborts the
    /// pass; objects already written are left in place.
    #[tracing::instrument(skip_all, fields(namespace = %ns.name_any(), config = %config.name_any()))]
    pub async fn apply_for_namespace(
        &self,
        ns: &Namespace,
        config: &NamespaceRbacConfig,
    ) -> Result<CreatedResources, Error> {
        let ctx = self.engine.build_context(ns, config);
        let config_name = config.name_any();
        let ns_name = ns.name_any();
        let owner = ns
            .controller_owner_ref(&())
            .filter(|o| !o.uid.is_empty())
            .ok_or_else(|| Error::OwnerReference(ns_name.clone()))?;
        let templates = &config.spec.rbac_templates;
        let mut created = CreatedResources::default();

        for tpl in &templates.roles {
            let role = self.role::<Role>(&config_name, tpl, &ctx, Some((&ns_name, &owner)))?;
            created.roles.push(reference(&role));
            self.upsert(config, role).await?;
        }

        for tpl in &templates.cluster_roles {
            let role = self.role::<ClusterRole>(&config_name, tpl, &ctx, None)?;
            created.cluster_roles.push(role.name_any());
            self.upsert(config, role).await?;
        }

        for tpl in &templates.role_bindings {
            let binding =
                self.binding::<RoleBinding>(&config_name, tpl, &ctx, Some((&ns_name, &owner)))?;
            created.role_bindings.push(reference(&binding));
            self.upsert(config, binding).await?;
        }

        for tpl in &templates.cluster_role_bindings {
            let binding = self.binding::<ClusterRoleBinding>(&config_name, tpl, &ctx, None)?;
            created.cluster_role_bindings.push(binding.name_any());
            self.upsert(config, binding).await?;
        }

        tracing::debug!(?created, "Applied templates");
        Ok(created)
    }

    /// Removes what `config` generated for `namespace` that nothing else needs.
    ///
    /// Namespace-scoped objects are owned by their namespace and are garbage
    /// collected with it. Cluster-scoped objects are deleted only when the
    /// config enables orphan cleanup and no other matching namespace renders
    /// the same name.
    #[tracing::instrument(skip_all, fields(%namespace, config = %config.name_any()))]
    pub async fn cleanup_for_namespace(
        &self,
        namespace: &str,
        config: &NamespaceRbacConfig,
    ) -> Result<(), Error> {
        self.cleanup_cluster_resources(Some(namespace), config).await
    }

    /// Deletes every cluster-scoped object labelled for `config` that no
    /// selected namespace renders, whichever namespaces the config's status
    /// lists. A deleting config references nothing.
    #[tracing::instrument(skip_all, fields(config = %config.name_any()))]
    pub async fn cleanup_orphans(&self, config: &NamespaceRbacConfig) -> Result<(), Error> {
        self.cleanup_cluster_resources(None, config).await
    }

    async fn cleanup_cluster_resources(
        &self,
        excluded: Option<&str>,
        config: &NamespaceRbacConfig,
    ) -> Result<(), Error> {
        if !config.deletes_orphaned_cluster_resources() {
            tracing::trace!("Orphaned cluster resource cleanup disabled");
            return Ok(());
        }

        // Labelled objects must be listed before namespaces: an object written
        // for a namespace that appears after the namespace list is not an
        // orphan.
        let roles = self.list_owned::<ClusterRole>(config).await?;
        let bindings = self.list_owned::<ClusterRoleBinding>(config).await?;
        let referenced = self.referenced(excluded, config).await?;

        let roles = self
            .delete_orphans(config, roles, &referenced.cluster_roles)
            .await;
        let bindings = self
            .delete_orphans(config, bindings, &referenced.cluster_role_bindings)
            .await;
        roles.and(bindings)
    }

    /// Creates or updates `desired` according to the config's merge strategy,
    /// retrying from a fresh read when the write loses a race.
    async fn upsert<K: Permission>(
        &self,
        config: &NamespaceRbacConfig,
        desired: K,
    ) -> Result<Operation, Error> {
        let config_name = config.name_any();
        let strategy = config.merge_strategy();
        let name = desired.name_any();
        let namespace = desired.namespace();
        let max_attempts = if K::NAMESPACED {
            NAMESPACED_ATTEMPTS
        } else {
            CLUSTER_ATTEMPTS
        };

        let mut attempts = 0;
        loop {
            attempts += 1;

            let existing = self
                .store
                .get::<K>(namespace.as_deref(), &name)
                .await
                .map_err(|source| Error::store::<K>(&name, source))?;

            let (operation, res) = match existing {
                None => (Operation::Create, self.store.create(&desired).await),
                Some(existing) => {
                    self.metrics
                        .record_conflict_resolution(&config_name, strategy, K::KIND);
                    let mut obj = desired.clone();
                    match strategy {
                        MergeStrategy::Ignore => {
                            tracing::debug!(kind = %K::KIND, %name, "Leaving existing object untouched");
                            self.metrics
                                .record_operation(&config_name, K::KIND, Operation::Ignore, true);
                            self.metrics
                                .set_managed(&config_name, K::KIND, namespace.as_deref());
                            return Ok(Operation::Ignore);
                        }
                        MergeStrategy::Replace => {}
                        MergeStrategy::Merge => obj.merge_from(&existing),
                    }
                    obj.meta_mut().resource_version = existing.meta().resource_version.clone();
                    (Operation::Update, self.store.replace(&obj).await)
                }
            };

            match res {
                Ok(_) => {
                    tracing::debug!(kind = %K::KIND, %name, ?operation, "Wrote object");
                    self.metrics
                        .record_operation(&config_name, K::KIND, operation, true);
                    self.metrics
                        .set_managed(&config_name, K::KIND, namespace.as_deref());
                    return Ok(operation);
                }
                Err(error) if error.is_conflict() && attempts < max_attempts => {
                    tracing::debug!(kind = %K::KIND, %name, %error, attempts, "Retrying after conflict");
                }
                Err(error) => {
                    self.metrics
                        .record_operation(&config_name, K::KIND, operation, false);
                    if error.is_conflict() {
                        return Err(Error::Conflict {
                            kind: K::KIND,
                            name,
                            attempts,
                        });
                    }
                    return Err(Error::store::<K>(&name, error));
                }
            }
        }
    }

    fn role<K>(
        &self,
        config: &str,
        tpl: &RoleTemplate,
        ctx: &Context,
        namespace: Option<(&str, &OwnerReference)>,
    ) -> Result<K, Error>
    where
        K: RoleLike,
    {
        let meta = self.meta(config, K::KIND, &tpl.name, &tpl.labels, &tpl.annotations, ctx)?;
        Ok(K::build(object_meta(config, meta, namespace), tpl.rules.clone()))
    }

    fn binding<K>(
        &self,
        config: &str,
        tpl: &BindingTemplate,
        ctx: &Context,
        namespace: Option<(&str, &OwnerReference)>,
    ) -> Result<K, Error>
    where
        K: BindingLike,
    {
        let kind = K::KIND;
        let meta = self.meta(config, kind, &tpl.name, &tpl.labels, &tpl.annotations, ctx)?;

        let role_ref = RoleRef {
            name: self.render(config, kind, "roleref", &tpl.role_ref.name, |e| {
                e.process_template(&tpl.role_ref.name, ctx)
            })?,
            ..tpl.role_ref.clone()
        };

        let subjects = tpl
            .subjects
            .iter()
            .map(|s| self.subject(config, kind, s, ctx))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(K::build(
            object_meta(config, meta, namespace),
            role_ref,
            subjects,
        ))
    }

    fn subject(
        &self,
        config: &str,
        kind: ResourceKind,
        subject: &Subject,
        ctx: &Context,
    ) -> Result<Subject, Error> {
        let name = self.render(config, kind, "subjects", &subject.name, |e| {
            e.process_template(&subject.name, ctx)
        })?;
        let namespace = match subject.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => Some(
                self.render(config, kind, "subjects", ns, |e| e.process_template(ns, ctx))?,
            ),
            ns => ns.map(Into::into),
        };
        Ok(Subject {
            name,
            namespace,
            ..subject.clone()
        })
    }

    fn meta(
        &self,
        config: &str,
        kind: ResourceKind,
        name: &str,
        labels: &Option<BTreeMap<String, String>>,
        annotations: &Option<BTreeMap<String, String>>,
        ctx: &Context,
    ) -> Result<Meta, Error> {
        let rendered = self.render(config, kind, "name", name, |e| e.process_template(name, ctx))?;
        let labels = self.render(config, kind, "labels", name, |e| {
            e.process_map(labels.as_ref(), ctx)
        })?;
        let annotations = self.render(config, kind, "annotations", name, |e| {
            e.process_map(annotations.as_ref(), ctx)
        })?;
        Ok(Meta {
            name: rendered,
            labels,
            annotations,
        })
    }

    /// Runs a template operation, recording its duration and outcome.
    fn render<T>(
        &self,
        config: &str,
        kind: ResourceKind,
        field: &'static str,
        template: &str,
        process: impl FnOnce(&Engine) -> Result<T, template::Error>,
    ) -> Result<T, Error> {
        let start = time::Instant::now();
        let res = process(&self.engine);
        self.metrics.record_template(
            config,
            format!("{kind}_{field}"),
            start.elapsed(),
            res.is_ok(),
        );
        res.map_err(|source| Error::Template {
            kind,
            template: template.to_string(),
            field,
            source,
        })
    }

    async fn referenced(
        &self,
        excluded: Option<&str>,
        config: &NamespaceRbacConfig,
    ) -> Result<Referenced, Error> {
        let mut referenced = Referenced::default();
        if config.is_deleting() {
            return Ok(referenced);
        }

        let matcher = NamespaceMatcher::compile(&config.spec.namespace_selector)?;
        let namespaces = self
            .store
            .list::<Namespace>(&Default::default())
            .await
            .map_err(|source| Error::Store {
                kind: "namespace",
                name: String::new(),
                source,
            })?;

        let templates = &config.spec.rbac_templates;
        for ns in namespaces.iter().filter(|ns| {
            excluded != Some(ns.name_any().as_str())
                && ns.metadata.deletion_timestamp.is_none()
                && matcher.matches(ns)
        }) {
            let ctx = self.engine.build_context(ns, config);
            let render = |tpl: &str| match self.engine.process_template(tpl, &ctx) {
                Ok(name) => Some(name),
                Err(error) => {
                    tracing::debug!(namespace = %ns.name_any(), %error, "Skipping unrenderable template");
                    None
                }
            };
            referenced
                .cluster_roles
                .extend(templates.cluster_roles.iter().filter_map(|t| render(&t.name)));
            referenced.cluster_role_bindings.extend(
                templates
                    .cluster_role_bindings
                    .iter()
                    .filter_map(|t| render(&t.name)),
            );
        }

        Ok(referenced)
    }

    async fn list_owned<K: Permission>(
        &self,
        config: &NamespaceRbacConfig,
    ) -> Result<Vec<K>, Error> {
        let selector = labels::config_selector(&config.name_any());
        self.store
            .list::<K>(&selector)
            .await
            .map_err(|source| Error::store::<K>("", source))
    }

    async fn delete_orphans<K: Permission>(
        &self,
        config: &NamespaceRbacConfig,
        objects: Vec<K>,
        referenced: &AHashSet<String>,
    ) -> Result<(), Error> {
        let mut res = Ok(());
        for name in objects.iter().map(ResourceExt::name_any) {
            if referenced.contains(&name) {
                continue;
            }
            match self
                .store
                .delete::<K>(None, &name, config.grace_period_seconds())
                .await
            {
                Ok(()) | Err(store::Error::NotFound) => {
                    tracing::info!(kind = %K::KIND, %name, "Deleted orphaned object");
                    self.metrics.record_cleanup(K::KIND, true);
                }
                Err(error) => {
                    tracing::warn!(kind = %K::KIND, %name, %error, "Failed to delete orphaned object");
                    self.metrics.record_cleanup(K::KIND, false);
                    if res.is_ok() {
                        res = Err(Error::store::<K>(&name, error));
                    }
                }
            }
        }
        res
    }
}

fn object_meta(
    config: &str,
    Meta {
        name,
        labels,
        annotations,
    }: Meta,
    namespace: Option<(&str, &OwnerReference)>,
) -> ObjectMeta {
    let ns = namespace.map(|(ns, _)| ns);
    ObjectMeta {
        name: Some(name),
        namespace: ns.map(Into::into),
        labels: Some(labels::merge_managed(labels, config, ns)),
        annotations,
        owner_references: namespace.map(|(_, owner)| vec![owner.clone()]),
        ..Default::default()
    }
}

fn reference<K: Resource>(obj: &K) -> ResourceReference {
    ResourceReference {
        name: obj.name_any(),
        namespace: obj.namespace().unwrap_or_default(),
    }
}

/// Builds a role-shaped object from rendered metadata and rules.
trait RoleLike: Permission {
    fn build(metadata: ObjectMeta, rules: Vec<crate::k8s::PolicyRule>) -> Self;
}

/// Builds a binding-shaped object from rendered metadata, role ref and subjects.
trait BindingLike: Permission {
    fn build(metadata: ObjectMeta, role_ref: RoleRef, subjects: Vec<Subject>) -> Self;
}

impl RoleLike for Role {
    fn build(metadata: ObjectMeta, rules: Vec<crate::k8s::PolicyRule>) -> Self {
        Self {
            metadata,
            rules: Some(rules),
        }
    }
}

impl RoleLike for ClusterRole {
    fn build(metadata: ObjectMeta, rules: Vec<crate::k8s::PolicyRule>) -> Self {
        Self {
            metadata,
            rules: Some(rules),
            aggregation_rule: None,
        }
    }
}

impl BindingLike for RoleBinding {
    fn build(metadata: ObjectMeta, role_ref: RoleRef, subjects: Vec<Subject>) -> Self {
        Self {
            metadata,
            role_ref,
            subjects: Some(subjects),
        }
    }
}

impl BindingLike for ClusterRoleBinding {
    fn build(metadata: ObjectMeta, role_ref: RoleRef, subjects: Vec<Subject>) -> Self {
        Self {
            metadata,
            role_ref,
            subjects: Some(subjects),
        }
    }
}

// === impl Operation ===

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Ignore => "ignore",
        }
    }
}

// === impl Error ===

impl Error {
    fn store<K: Permission>(name: &str, source: store::Error) -> Self {
        Self::Store {
            kind: K::KIND.as_str(),
            name: name.to_string(),
            source,
        }
    }

    /// Template failures are not retried until the config or namespace changes.
    pub fn is_template(&self) -> bool {
        matches!(self, Self::Template { .. })
    }

    /// Classifies the error for the `error_type` metric label.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Template { .. } => "template",
            Self::Selector(_) => "regex",
            Self::Conflict { .. } => "conflict",
            Self::OwnerReference(_) => "unknown",
            Self::Store { source, .. } => source.error_type(),
        }
    }
}
