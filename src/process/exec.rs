//! Sequential execution of process graphs against an entity snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::{Evaluator, Expression, Function, Node, Process, ProcessGraph, ProcessGroup};
use crate::context::{Bindings, TemporalContext};
use crate::error::{ExecutionError, SimError, SimResult};
use crate::globals::Globals;
use crate::snapshot::EntitySnapshot;
use crate::value::Binding;

/// Locals visible to the expressions of one process invocation.
///
/// The top-level frame is not scoped: assignments to unknown names become
/// entity transients. Function frames are scoped and own their locals.
#[derive(Debug, Default)]
struct Frame {
    bindings: Bindings,
    scoped: bool,
}

/// Runs the processes of one entity, in declaration order, one node at a
/// time.
pub struct Executor<'a, E> {
    graph: &'a ProcessGraph<E>,
    evaluator: &'a dyn Evaluator<E>,
    globals: Arc<Globals>,
    keep: BTreeSet<String>,
}

impl<'a, E: Expression> Executor<'a, E> {
    /// An executor bound to `graph`, keeping the graph's variables on purge.
    #[must_use]
    pub fn new(
        graph: &'a ProcessGraph<E>,
        evaluator: &'a dyn Evaluator<E>,
        globals: Arc<Globals>,
        entity: &EntitySnapshot,
    ) -> Self {
        Self {
            graph,
            evaluator,
            globals,
            keep: graph.variables(entity.schema()),
        }
    }

    /// Runs the top-level process `name` at the entity's live period.
    pub fn run(&self, entity: &mut EntitySnapshot, name: &str) -> SimResult<()> {
        let process = self.graph.get(name).ok_or_else(|| ExecutionError::UnknownProcess {
            entity: self.graph.entity().to_string(),
            name: name.to_string(),
        })?;
        if let Node::Function(function) = &process.node {
            self.invoke(entity, process, function, Vec::new())?;
            return Ok(());
        }
        self.execute(entity, process, &mut Frame::default())
    }

    /// Runs every top-level process except functions, in declaration order.
    pub fn run_all(&self, entity: &mut EntitySnapshot) -> SimResult<()> {
        let mut frame = Frame::default();
        for process in self.graph.processes() {
            if !matches!(process.node, Node::Function(_)) {
                self.execute(entity, process, &mut frame)?;
            }
        }
        Ok(())
    }

    /// Calls the function `name` with already evaluated arguments.
    pub fn call(
        &self,
        entity: &mut EntitySnapshot,
        name: &str,
        args: Vec<Binding>,
    ) -> SimResult<Option<Binding>> {
        let process = self.graph.get(name).ok_or_else(|| ExecutionError::UnknownProcess {
            entity: self.graph.entity().to_string(),
            name: name.to_string(),
        })?;
        let Node::Function(function) = &process.node else {
            return Err(ExecutionError::Evaluation {
                message: format!("'{}' is not a function", process.label()),
            }
            .into());
        };
        self.invoke(entity, process, function, args)
    }

    fn execute(
        &self,
        entity: &mut EntitySnapshot,
        process: &Process<E>,
        frame: &mut Frame,
    ) -> SimResult<()> {
        match &process.node {
            Node::Assignment { name, expr } => {
                let value = self.eval(entity, frame, expr)?;
                if entity.schema().is_stored(name) || !frame.scoped {
                    entity.assign(name, value)?;
                } else {
                    frame.bindings.insert(name.clone(), value);
                }
            }
            Node::Compute { expr } => {
                if self.dispatch(entity, frame, expr)?.is_none() {
                    self.eval(entity, frame, expr)?;
                }
            }
            Node::Group(group) => self.run_group(entity, group, frame)?,
            Node::While { cond, body } => loop {
                let condition = self.eval(entity, frame, cond)?;
                if !condition.is_truthy()? {
                    break;
                }
                self.run_group(entity, body, frame)?;
            },
            // a function only runs when called
            Node::Function(_) => {}
        }
        Ok(())
    }

    fn run_group(
        &self,
        entity: &mut EntitySnapshot,
        group: &ProcessGroup<E>,
        frame: &mut Frame,
    ) -> SimResult<()> {
        for process in &group.nodes {
            self.execute(entity, process, frame)?;
        }
        if group.purge {
            entity.purge_locals(&self.keep);
        }
        Ok(())
    }

    /// Runs a direct call of a graph function, `None` when `expr` is not
    /// one. The inner option is the function's result.
    fn dispatch(
        &self,
        entity: &mut EntitySnapshot,
        frame: &mut Frame,
        expr: &E,
    ) -> SimResult<Option<Option<Binding>>> {
        let Some((name, args)) = expr.as_call() else {
            return Ok(None);
        };
        let Some(process) = self.graph.get(name) else {
            return Ok(None);
        };
        let Node::Function(function) = &process.node else {
            return Ok(None);
        };
        let args = args
            .iter()
            .map(|arg| self.eval(entity, frame, arg))
            .collect::<SimResult<Vec<_>>>()?;
        self.invoke(entity, process, function, args).map(Some)
    }

    fn invoke(
        &self,
        entity: &mut EntitySnapshot,
        process: &Process<E>,
        function: &Function<E>,
        args: Vec<Binding>,
    ) -> SimResult<Option<Binding>> {
        if args.len() != function.args.len() {
            return Err(ExecutionError::ArgumentCount {
                function: process.label(),
                expected: function.args.len(),
                actual: args.len(),
            }
            .into());
        }
        let mut frame = Frame {
            bindings: function.args.iter().cloned().zip(args).collect(),
            scoped: true,
        };
        self.run_group(entity, &function.body, &mut frame)?;
        function
            .result
            .as_ref()
            .map(|expr| self.eval(entity, &mut frame, expr))
            .transpose()
    }

    /// Evaluates `expr` at the live period with the frame's locals visible.
    fn eval(&self, entity: &mut EntitySnapshot, frame: &mut Frame, expr: &E) -> SimResult<Binding> {
        if let Some(result) = self.dispatch(entity, frame, expr)? {
            return result.ok_or_else(|| {
                SimError::from(ExecutionError::Evaluation {
                    message: format!("{expr:?} does not return a value"),
                })
            });
        }

        let period = entity.live_period().ok_or_else(|| {
            ExecutionError::precondition(format!("entity '{}' has no live period", entity.name()))
        })?;
        let ctx = TemporalContext::with_extra(
            entity,
            period,
            Arc::clone(&self.globals),
            std::mem::take(&mut frame.bindings),
        );
        let result = self.evaluator.evaluate(expr, &ctx);
        frame.bindings = ctx.into_extra();
        result
    }
}
