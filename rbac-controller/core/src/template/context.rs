use rbac_controller_k8s_api::{Namespace, NamespaceRbacConfig, ResourceExt};
use std::{borrow::Cow, collections::BTreeMap, fmt};

type Map = BTreeMap<String, String>;

/// The data a template is evaluated against.
///
/// Field names are exposed to templates in their capitalized form, e.g.
/// `.Namespace.Name` or `.Config.Naming.Prefix`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Context {
    pub namespace: NamespaceContext,
    pub crd: CrdContext,
    pub config: ConfigContext,
    pub custom_vars: Map,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceContext {
    pub name: String,
    pub labels: Map,
    pub annotations: Map,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrdContext {
    pub name: String,
    /// Always empty for the cluster-scoped config resource.
    pub namespace: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigContext {
    pub naming: NamingContext,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamingContext {
    pub prefix: String,
    pub suffix: String,
    pub separator: String,
}

/// A value produced while evaluating a template.
#[derive(Clone, Debug, PartialEq)]
pub(super) enum Value<'a> {
    Nil,
    Bool(bool),
    Str(Cow<'a, str>),
    Map(&'a Map),
    Context(&'a Context),
    Namespace(&'a NamespaceContext),
    Crd(&'a CrdContext),
    Config(&'a ConfigContext),
    Naming(&'a NamingContext),
}

// === impl Context ===

impl Context {
    pub fn build(ns: &Namespace, config: &NamespaceRbacConfig) -> Self {
        let mut naming = NamingContext::default();
        if let Some(n) = config.naming() {
            if !n.prefix.is_empty() {
                naming.prefix = n.prefix.clone();
            }
            if !n.suffix.is_empty() {
                naming.suffix = n.suffix.clone();
            }
            if !n.separator.is_empty() {
                naming.separator = n.separator.clone();
            }
        }

        Self {
            namespace: NamespaceContext {
                name: ns.name_any(),
                labels: ns.labels().clone(),
                annotations: ns.annotations().clone(),
            },
            crd: CrdContext {
                name: config.name_any(),
                namespace: config.namespace().unwrap_or_default(),
            },
            config: ConfigContext { naming },
            custom_vars: config.template_variables().cloned().unwrap_or_default(),
        }
    }
}

// === impl NamingContext ===

impl Default for NamingContext {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            suffix: String::new(),
            separator: "-".to_string(),
        }
    }
}

// === impl Value ===

impl<'a> Value<'a> {
    pub(super) fn field(&self, name: &str) -> Result<Value<'a>, String> {
        let value = match (self, name) {
            (Self::Context(c), "Namespace") => Self::Namespace(&c.namespace),
            (Self::Context(c), "CRD") => Self::Crd(&c.crd),
            (Self::Context(c), "Config") => Self::Config(&c.config),
            (Self::Context(c), "CustomVars") => Self::Map(&c.custom_vars),
            (Self::Namespace(n), "Name") => Self::Str(Cow::Borrowed(&n.name)),
            (Self::Namespace(n), "Labels") => Self::Map(&n.labels),
            (Self::Namespace(n), "Annotations") => Self::Map(&n.annotations),
            (Self::Crd(c), "Name") => Self::Str(Cow::Borrowed(&c.name)),
            (Self::Crd(c), "Namespace") => Self::Str(Cow::Borrowed(&c.namespace)),
            (Self::Config(c), "Naming") => Self::Naming(&c.naming),
            (Self::Naming(n), "Prefix") => Self::Str(Cow::Borrowed(&n.prefix)),
            (Self::Naming(n), "Suffix") => Self::Str(Cow::Borrowed(&n.suffix)),
            (Self::Naming(n), "Separator") => Self::Str(Cow::Borrowed(&n.separator)),
            (Self::Map(m), key) => {
                return m
                    .get(key)
                    .map(|v| Self::Str(Cow::Borrowed(v.as_str())))
                    .ok_or_else(|| format!("map has no entry for key {key:?}"));
            }
            (Self::Nil, _) => return Err(format!("nil pointer evaluating <no value>.{name}")),
            (v, _) => {
                return Err(format!(
                    "can't evaluate field {name} in type {}",
                    v.type_name()
                ))
            }
        };
        Ok(value)
    }

    /// Follows Go's notion of truth: empty strings, empty maps, `false` and
    /// `nil` are false.
    pub(super) fn is_truthy(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Bool(b) => *b,
            Self::Str(s) => !s.is_empty(),
            Self::Map(m) => !m.is_empty(),
            _ => true,
        }
    }

    pub(super) fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Bool(_) => "bool",
            Self::Str(_) => "string",
            Self::Map(_) => "map[string]string",
            Self::Context(_) => "Context",
            Self::Namespace(_) => "NamespaceContext",
            Self::Crd(_) => "CRDContext",
            Self::Config(_) => "ConfigContext",
            Self::Naming(_) => "NamingContext",
        }
    }
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => f.write_str("<no value>"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Str(s) => f.write_str(s),
            Self::Map(m) => {
                f.write_str("map[")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{k}:{v}")?;
                }
                f.write_str("]")
            }
            Self::Context(c) => write!(
                f,
                "{{{} {} {} {}}}",
                Self::Namespace(&c.namespace),
                Self::Crd(&c.crd),
                Self::Config(&c.config),
                Self::Map(&c.custom_vars),
            ),
            Self::Namespace(n) => write!(
                f,
                "{{{} {} {}}}",
                n.name,
                Self::Map(&n.labels),
                Self::Map(&n.annotations)
            ),
            Self::Crd(c) => write!(f, "{{{} {}}}", c.name, c.namespace),
            Self::Config(c) => write!(f, "{{{}}}", Self::Naming(&c.naming)),
            Self::Naming(n) => write!(f, "{{{} {} {}}}", n.prefix, n.suffix, n.separator),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, convert_args};
    use rbac_controller_k8s_api::{
        ConfigOptions, NamespaceRbacConfigSpec, NamingConfig, ObjectMeta,
    };

    fn mk_config(config: Option<ConfigOptions>) -> NamespaceRbacConfig {
        NamespaceRbacConfig::new(
            "cfg",
            NamespaceRbacConfigSpec {
                config,
                ..Default::default()
            },
        )
    }

    fn mk_ns(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn defaults() {
        let ctx = Context::build(&mk_ns("ns"), &mk_config(None));
        assert_eq!(ctx.namespace.name, "ns");
        assert!(ctx.namespace.labels.is_empty());
        assert!(ctx.namespace.annotations.is_empty());
        assert_eq!(ctx.crd.name, "cfg");
        assert_eq!(ctx.crd.namespace, "");
        assert_eq!(ctx.config.naming, NamingContext::default());
        assert_eq!(ctx.config.naming.separator, "-");
        assert!(ctx.custom_vars.is_empty());
    }

    #[test]
    fn naming_overrides_only_non_empty_values() {
        let config = mk_config(Some(ConfigOptions {
            naming: Some(NamingConfig {
                prefix: "custom".to_string(),
                suffix: String::new(),
                separator: String::new(),
            }),
            template_variables: Some(convert_args!(btreemap!("testVar" => "test-value"))),
            ..Default::default()
        }));
        let ctx = Context::build(&mk_ns("ns"), &config);
        assert_eq!(ctx.config.naming.prefix, "custom");
        assert_eq!(ctx.config.naming.suffix, "");
        assert_eq!(ctx.config.naming.separator, "-");
        assert_eq!(
            ctx.custom_vars,
            convert_args!(btreemap!("testVar" => "test-value"))
        );
    }

    #[test]
    fn field_access() {
        let mut ctx = Context::default();
        ctx.namespace.labels = convert_args!(btreemap!("team" => "a"));
        let root = Value::Context(&ctx);

        let labels = root.field("Namespace").unwrap().field("Labels").unwrap();
        assert_eq!(labels.field("team").unwrap(), Value::Str("a".into()));
        assert!(labels.field("missing").is_err());
        assert!(root.field("Nope").is_err());
        assert!(Value::Nil.field("Name").is_err());
        assert!(Value::Str("s".into()).field("Name").is_err());
    }

    #[test]
    fn display() {
        let map = convert_args!(btreemap!("b" => "2", "a" => "1"));
        assert_eq!(Value::Map(&map).to_string(), "map[a:1 b:2]");
        assert_eq!(Value::Nil.to_string(), "<no value>");
        assert_eq!(Value::Bool(true).to_string(), "true");
    }
}
