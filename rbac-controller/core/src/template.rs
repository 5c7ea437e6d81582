//! Substitutes `{{ ... }}` expressions in RBAC templates.
//!
//! The syntax is a subset of Go's `text/template`: field chains rooted at the
//! [`Context`], string/boolean/`nil` literals, parenthesized sub-expressions,
//! `|` pipelines, `if`/`else`/`end`, trim markers and comments. Evaluation is
//! strict: a reference to an unknown field or a missing map key fails rather
//! than rendering an empty string.

mod context;
mod funcs;
mod parse;

pub use self::context::{ConfigContext, Context, CrdContext, NamespaceContext, NamingContext};
use self::{
    context::Value,
    parse::{Command, Node, Operand, Pipeline},
};
use std::{borrow::Cow, collections::BTreeMap, fmt::Write};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to parse template: {0}")]
    Parse(String),

    #[error("failed to execute template: {0}")]
    Exec(String),

    #[error("failed to process template for key {key}: {source}")]
    Key {
        key: String,
        #[source]
        source: Box<Error>,
    },
}

/// A parsed template that may be rendered against any number of contexts.
#[derive(Clone, Debug, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Engine(());

// === impl Engine ===

impl Engine {
    pub fn build_context(
        &self,
        ns: &rbac_controller_k8s_api::Namespace,
        config: &rbac_controller_k8s_api::NamespaceRbacConfig,
    ) -> Context {
        Context::build(ns, config)
    }

    pub fn process_template(&self, text: &str, ctx: &Context) -> Result<String, Error> {
        Template::parse(text)?.render(ctx)
    }

    /// Processes every value of `map`, preserving its keys.
    pub fn process_map(
        &self,
        map: Option<&BTreeMap<String, String>>,
        ctx: &Context,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let map = match map {
            Some(map) => map,
            None => return Ok(None),
        };
        map.iter()
            .map(|(key, value)| {
                let value = self.process_template(value, ctx).map_err(|e| Error::Key {
                    key: key.clone(),
                    source: Box::new(e),
                })?;
                Ok::<_, Error>((key.clone(), value))
            })
            .collect::<Result<_, _>>()
            .map(Some)
    }

    /// Checks syntax only. References to fields that don't exist are not
    /// detected until the template is rendered.
    pub fn validate_template(&self, text: &str) -> Result<(), Error> {
        Template::parse(text).map(|_| ())
    }
}

// === impl Template ===

impl Template {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let nodes = parse::parse(text)?;
        Ok(Self { nodes })
    }

    pub fn render(&self, ctx: &Context) -> Result<String, Error> {
        let mut out = String::new();
        render_nodes(&self.nodes, ctx, &mut out)?;
        Ok(out)
    }
}

fn render_nodes(nodes: &[Node], ctx: &Context, out: &mut String) -> Result<(), Error> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Action(pipeline) => {
                let value = eval_pipeline(pipeline, ctx)?;
                write!(out, "{value}").map_err(|e| Error::Exec(e.to_string()))?;
            }
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if eval_pipeline(cond, ctx)?.is_truthy() {
                    then
                } else {
                    otherwise
                };
                render_nodes(branch, ctx, out)?;
            }
        }
    }
    Ok(())
}

fn eval_pipeline<'a>(pipeline: &'a Pipeline, ctx: &'a Context) -> Result<Value<'a>, Error> {
    let mut prior = None;
    for command in &pipeline.0 {
        let value = match command {
            Command::Call(func, operands) => {
                let mut args = operands
                    .iter()
                    .map(|op| eval_operand(op, ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                args.extend(prior.take());
                func.call(args).map_err(Error::Exec)?
            }
            Command::Operand(operand) => {
                if prior.is_some() {
                    return Err(Error::Exec(
                        "can't give argument to non-function".to_string(),
                    ));
                }
                eval_operand(operand, ctx)?
            }
        };
        prior = Some(value);
    }
    Ok(prior.unwrap_or(Value::Nil))
}

fn eval_operand<'a>(operand: &'a Operand, ctx: &'a Context) -> Result<Value<'a>, Error> {
    match operand {
        Operand::Field(chain) => chain
            .iter()
            .try_fold(Value::Context(ctx), |value, name| value.field(name))
            .map_err(Error::Exec),
        Operand::Str(s) => Ok(Value::Str(Cow::Borrowed(s))),
        Operand::Bool(b) => Ok(Value::Bool(*b)),
        Operand::Nil => Ok(Value::Nil),
        Operand::Pipeline(pipeline) => eval_pipeline(pipeline, ctx),
    }
}

// === impl Error ===

impl Error {
    fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}
