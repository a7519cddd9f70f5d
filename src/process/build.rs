//! Compilation of typed process definitions into a [`ProcessGraph`].

use std::collections::{BTreeMap, BTreeSet};

use super::{Function, Node, Process, ProcessGraph, ProcessGroup};
use crate::error::SchemaError;
use crate::schema::EntitySchema;

/// An already parsed process definition.
#[derive(Debug, Clone)]
pub enum ProcessDef<E> {
    /// `name: expr`
    Assign(E),
    /// An expression run for its side effects.
    Compute(E),
    /// An ordered list of (optionally named) items.
    Procedure(Vec<(Option<String>, ProcessDef<E>)>),
    /// A loop running `code` while `cond` holds.
    While {
        cond: E,
        code: Vec<(Option<String>, ProcessDef<E>)>,
    },
    /// A callable sub-procedure with its own local scope.
    Function {
        args: Vec<String>,
        code: Vec<(Option<String>, ProcessDef<E>)>,
        result: Option<E>,
    },
}

struct Compiler<'s> {
    schema: &'s EntitySchema,
    top: String,
}

impl Compiler<'_> {
    fn invalid(&self, reason: impl Into<String>) -> SchemaError {
        SchemaError::InvalidProcess {
            entity: self.schema.name().to_string(),
            process: self.top.clone(),
            reason: reason.into(),
        }
    }

    fn group<E>(
        &self,
        name: String,
        items: Vec<(Option<String>, ProcessDef<E>)>,
        purge: bool,
    ) -> Result<ProcessGroup<E>, SchemaError> {
        let nodes = items
            .into_iter()
            .map(|(name, def)| self.process(name, def, false))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProcessGroup { name, nodes, purge })
    }

    /// `purge` applies to a group built at this level only. Nodes inside a
    /// group never purge, so locals stay visible until the top-level
    /// procedure ends.
    fn process<E>(
        &self,
        name: Option<String>,
        def: ProcessDef<E>,
        purge: bool,
    ) -> Result<Process<E>, SchemaError> {
        let node = match def {
            ProcessDef::Assign(expr) => {
                let Some(target) = name.clone().filter(|n| !n.is_empty()) else {
                    return Err(self.invalid("an assignment needs a target name"));
                };
                Node::Assignment { name: target, expr }
            }
            ProcessDef::Compute(expr) => Node::Compute { expr },
            ProcessDef::Procedure(items) => {
                Node::Group(self.group(name.clone().unwrap_or_default(), items, purge)?)
            }
            ProcessDef::While { cond, code } => Node::While {
                cond,
                body: self.group(String::new(), code, false)?,
            },
            ProcessDef::Function { args, code, result } => {
                let mut seen = BTreeSet::new();
                if let Some(dup) = args.iter().find(|a| !seen.insert(a.as_str())) {
                    return Err(self.invalid(format!("duplicate argument '{dup}'")));
                }
                Node::Function(Function {
                    args,
                    body: self.group(name.clone().unwrap_or_default(), code, false)?,
                    result,
                })
            }
        };
        Ok(Process {
            entity: self.schema.name().to_string(),
            name: name.unwrap_or_default(),
            node,
        })
    }
}

impl<E> ProcessGraph<E> {
    /// Compiles the declaration-ordered definitions of one entity.
    ///
    /// Top-level procedures purge their locals; top-level assignment
    /// targets become the entity's predictors.
    pub fn build(
        schema: &EntitySchema,
        defs: Vec<(Option<String>, ProcessDef<E>)>,
    ) -> Result<Self, SchemaError> {
        let mut processes = Vec::with_capacity(defs.len());
        let mut by_name = BTreeMap::new();
        let mut predictors = BTreeSet::new();

        for (index, (name, def)) in defs.into_iter().enumerate() {
            let compiler = Compiler {
                schema,
                top: name.clone().unwrap_or_default(),
            };
            if let Some(name) = name.as_deref().filter(|n| !n.is_empty()) {
                if by_name.insert(name.to_string(), index).is_some() {
                    return Err(compiler.invalid("process defined twice"));
                }
                if matches!(def, ProcessDef::Assign(_)) {
                    predictors.insert(name.to_string());
                }
            }
            processes.push(compiler.process(name, def, true)?);
        }

        tracing::debug!(
            entity = %schema.name(),
            processes = processes.len(),
            predictors = predictors.len(),
            "built process graph"
        );

        Ok(Self {
            entity: schema.name().to_string(),
            processes,
            by_name,
            predictors,
            links: schema.links().keys().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{Expression, LagAccess};
    use crate::schema::{FieldDef, Link};
    use crate::value::FieldType;

    #[derive(Debug, Clone)]
    enum Expr {
        Var(&'static str),
        Lag(&'static str),
        LinkLag(&'static str, Vec<String>),
    }

    impl Expression for Expr {
        fn lag_accesses(&self) -> Vec<LagAccess> {
            match self {
                Self::Var(_) => Vec::new(),
                Self::Lag(name) => vec![LagAccess::Variable((*name).to_string())],
                Self::LinkLag(link, vars) => vec![LagAccess::Link {
                    link: (*link).to_string(),
                    target_variables: vars.clone(),
                }],
            }
        }
    }

    fn schema() -> EntitySchema {
        EntitySchema::new(
            "person",
            vec![
                FieldDef::new("age", FieldType::Int),
                FieldDef::new("mother_id", FieldType::Int),
                FieldDef::new("hh_id", FieldType::Int),
                FieldDef::new("income", FieldType::Float),
            ],
            Vec::new(),
            vec![
                Link::many_to_one("mother", "mother_id", "person"),
                Link::many_to_one("household", "hh_id", "household"),
            ],
        )
        .unwrap()
    }

    fn named(name: &str, def: ProcessDef<Expr>) -> (Option<String>, ProcessDef<Expr>) {
        (Some(name.to_string()), def)
    }

    #[test]
    fn test_build_groups_and_predictors() {
        let graph = ProcessGraph::build(
            &schema(),
            vec![
                named("agegroup", ProcessDef::Assign(Expr::Var("age"))),
                named(
                    "ageing",
                    ProcessDef::Procedure(vec![
                        named("tmp", ProcessDef::Assign(Expr::Var("age"))),
                        (
                            None,
                            ProcessDef::While {
                                cond: Expr::Var("tmp"),
                                code: vec![(None, ProcessDef::Compute(Expr::Var("x")))],
                            },
                        ),
                    ]),
                ),
            ],
        )
        .unwrap();

        assert!(graph.predictors().contains("agegroup"));
        assert!(!graph.predictors().contains("tmp"));
        let Node::Group(group) = &graph.get("ageing").unwrap().node else {
            panic!("expected a group");
        };
        assert!(group.purge);
        let Node::While { body, .. } = &group.nodes[1].node else {
            panic!("expected a while loop");
        };
        assert!(!body.purge);
        assert_eq!(graph.expressions().len(), 4);
        assert!(graph.variables(&schema()).contains("household"));
    }

    #[test]
    fn test_nested_procedure_does_not_purge() {
        let graph = ProcessGraph::build(
            &schema(),
            vec![named(
                "ageing",
                ProcessDef::Procedure(vec![
                    named("older", ProcessDef::Assign(Expr::Var("age"))),
                    named(
                        "inner",
                        ProcessDef::Procedure(vec![named(
                            "noise",
                            ProcessDef::Assign(Expr::Var("older")),
                        )]),
                    ),
                ]),
            )],
        )
        .unwrap();

        let Node::Group(outer) = &graph.get("ageing").unwrap().node else {
            panic!("expected a group");
        };
        assert!(outer.purge);
        let Node::Group(inner) = &outer.nodes[1].node else {
            panic!("expected a nested group");
        };
        assert!(!inner.purge);
    }

    #[test]
    fn test_unnamed_assignment_is_rejected() {
        let err = ProcessGraph::build(&schema(), vec![(None, ProcessDef::Assign(Expr::Var("age")))])
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidProcess { .. }));
    }

    #[test]
    fn test_duplicate_process_is_rejected() {
        let err = ProcessGraph::build(
            &schema(),
            vec![
                named("a", ProcessDef::Compute(Expr::Var("age"))),
                named("a", ProcessDef::Compute(Expr::Var("age"))),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("defined twice"));
    }

    #[test]
    fn test_lag_fields_follow_links() {
        let graph = ProcessGraph::build(
            &schema(),
            vec![
                named("a", ProcessDef::Assign(Expr::Lag("income"))),
                named(
                    "b",
                    ProcessDef::Assign(Expr::LinkLag("mother", vec!["age".to_string()])),
                ),
                named(
                    "c",
                    ProcessDef::Assign(Expr::LinkLag("household", vec!["size".to_string()])),
                ),
            ],
        )
        .unwrap();
        assert_eq!(
            graph.lag_fields(&schema()).unwrap(),
            vec!["id", "age", "hh_id", "income", "mother_id"]
        );
    }

    #[test]
    fn test_lag_fields_empty_without_lag() {
        let graph =
            ProcessGraph::build(&schema(), vec![named("a", ProcessDef::Assign(Expr::Var("age")))])
                .unwrap();
        assert!(graph.lag_fields(&schema()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_lag_target_is_rejected() {
        let graph = ProcessGraph::build(
            &schema(),
            vec![named("a", ProcessDef::Assign(Expr::LinkLag("spouse", Vec::new())))],
        )
        .unwrap();
        assert!(matches!(
            graph.lag_fields(&schema()).unwrap_err(),
            SchemaError::UnknownLink { .. }
        ));
    }
}
