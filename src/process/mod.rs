//! Executable process graphs.
//!
//! Processes are trees of tagged nodes bound to one entity. Expressions are
//! opaque here: they are evaluated by an external [`Evaluator`] and only
//! inspected for lag accesses and direct procedure calls.

mod build;
mod exec;

pub use build::ProcessDef;
pub use exec::Executor;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::context::EvalContext;
use crate::error::{SchemaError, SimResult};
use crate::schema::{EntitySchema, LinkKind};
use crate::value::Binding;

/// One access to a previous period found in an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LagAccess {
    /// A plain variable read one period back.
    Variable(String),
    /// A link traversal read one period back, with the variables of the
    /// target expression.
    Link {
        link: String,
        target_variables: Vec<String>,
    },
}

/// What the core needs to know about an expression tree.
pub trait Expression: fmt::Debug {
    /// Every lag access anywhere in the tree.
    fn lag_accesses(&self) -> Vec<LagAccess>;

    /// `Some((name, args))` when the whole expression is a call.
    fn as_call(&self) -> Option<(&str, &[Self])>
    where
        Self: Sized,
    {
        None
    }
}

/// Evaluates expressions against a context.
pub trait Evaluator<E> {
    /// Evaluates `expr` in `ctx`. Names resolve through the context.
    fn evaluate(&self, expr: &E, ctx: &dyn EvalContext) -> SimResult<Binding>;
}

/// An ordered list of processes run in one period.
#[derive(Debug, Clone)]
pub struct ProcessGroup<E> {
    /// Name of the group (empty for loop bodies).
    pub name: String,
    /// Processes run in order.
    pub nodes: Vec<Process<E>>,
    /// Evict local transients once the group has run.
    pub purge: bool,
}

/// A parameterized sub-procedure.
#[derive(Debug, Clone)]
pub struct Function<E> {
    /// Argument names, bound in the function's frame.
    pub args: Vec<String>,
    /// Statements run on each call.
    pub body: ProcessGroup<E>,
    /// Expression evaluated after the body, the call's value.
    pub result: Option<E>,
}

/// A compiled process node.
#[derive(Debug, Clone)]
pub enum Node<E> {
    /// Evaluates `expr` and stores it under `name`.
    Assignment { name: String, expr: E },
    /// Evaluates `expr` for its side effects.
    Compute { expr: E },
    /// Runs a nested list of processes.
    Group(ProcessGroup<E>),
    /// Runs `body` while `cond` holds.
    While { cond: E, body: ProcessGroup<E> },
    /// A function, run only when called.
    Function(Function<E>),
}

/// A node attached to its owning entity under a (possibly empty) name.
#[derive(Debug, Clone)]
pub struct Process<E> {
    /// Owning entity.
    pub entity: String,
    /// Process name, empty for anonymous items.
    pub name: String,
    /// What the process does.
    pub node: Node<E>,
}

impl<E> Process<E> {
    /// Label used in diagnostics.
    #[must_use]
    pub fn label(&self) -> String {
        if self.name.is_empty() {
            format!("{}.<anonymous>", self.entity)
        } else {
            format!("{}.{}", self.entity, self.name)
        }
    }

    fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a E>) {
        match &self.node {
            Node::Assignment { expr, .. } | Node::Compute { expr } => out.push(expr),
            Node::Group(group) => group.collect_expressions(out),
            Node::While { cond, body } => {
                out.push(cond);
                body.collect_expressions(out);
            }
            Node::Function(function) => {
                function.body.collect_expressions(out);
                if let Some(result) = &function.result {
                    out.push(result);
                }
            }
        }
    }
}

impl<E> ProcessGroup<E> {
    fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a E>) {
        for process in &self.nodes {
            process.collect_expressions(out);
        }
    }
}

/// The compiled processes of one entity.
#[derive(Debug, Clone)]
pub struct ProcessGraph<E> {
    entity: String,
    processes: Vec<Process<E>>,
    by_name: BTreeMap<String, usize>,
    predictors: BTreeSet<String>,
    links: BTreeSet<String>,
}

impl<E> ProcessGraph<E> {
    /// Entity owning the graph.
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Top-level process named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Process<E>> {
        self.by_name.get(name).map(|i| &self.processes[*i])
    }

    /// Top-level processes in declaration order.
    pub fn processes(&self) -> impl Iterator<Item = &Process<E>> {
        self.processes.iter()
    }

    /// Names assigned at the top level, visible outside their process.
    #[must_use]
    pub const fn predictors(&self) -> &BTreeSet<String> {
        &self.predictors
    }

    /// Stored fields, predictors and links: the names a purge never evicts.
    #[must_use]
    pub fn variables(&self, schema: &EntitySchema) -> BTreeSet<String> {
        schema
            .field_names()
            .map(String::from)
            .chain(self.predictors.iter().cloned())
            .chain(self.links.iter().cloned())
            .collect()
    }

    /// Every expression of every process.
    #[must_use]
    pub fn expressions(&self) -> Vec<&E> {
        let mut out = Vec::new();
        for process in &self.processes {
            process.collect_expressions(&mut out);
        }
        out
    }
}

impl<E: Expression> ProcessGraph<E> {
    /// Fields read one period back anywhere in the graph, `id` first.
    ///
    /// Link traversals add their join field, and the target variables when
    /// the link points back to this entity. Empty when nothing is lagged.
    pub fn lag_fields(&self, schema: &EntitySchema) -> Result<Vec<String>, SchemaError> {
        let mut lagged = BTreeSet::new();
        for expr in self.expressions() {
            for access in expr.lag_accesses() {
                match access {
                    LagAccess::Variable(name) => {
                        lagged.insert(name);
                    }
                    LagAccess::Link {
                        link,
                        target_variables,
                    } => {
                        let declared =
                            schema.link(&link).ok_or_else(|| SchemaError::UnknownLink {
                                entity: schema.name().to_string(),
                                link: link.clone(),
                            })?;
                        let to_self = declared.target == schema.name();
                        if declared.kind == LinkKind::ManyToOne || to_self {
                            lagged.insert(declared.link_field().to_string());
                        }
                        if to_self {
                            lagged.extend(target_variables);
                        }
                    }
                }
            }
        }
        if lagged.is_empty() {
            return Ok(Vec::new());
        }

        lagged.remove("id");
        let fields: Vec<String> = std::iter::once("id".to_string()).chain(lagged).collect();
        if let Some(unknown) = fields.iter().find(|f| !schema.is_stored(f)) {
            return Err(SchemaError::UnknownLagField {
                entity: schema.name().to_string(),
                field: unknown.clone(),
            });
        }
        Ok(fields)
    }
}
