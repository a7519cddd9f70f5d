//! Shared fixtures: a tiny integer expression language and a person entity.

#![allow(dead_code)]

use std::sync::Arc;

use microsim::{
    Binding, Column, ColumnTable, EntitySchema, EntitySnapshot, EvalContext, Evaluator,
    ExecutionError, Expression, FieldDef, FieldType, Fill, InMemoryPeriodStore, LagAccess,
    PeriodValue, ProcessDef, SchemaSource, SimError, SimResult, Value,
};

#[derive(Debug, Clone)]
pub enum Expr {
    Int(i64),
    Var(String),
    Add(Box<Expr>, Box<Expr>),
    Gt(Box<Expr>, Box<Expr>),
    /// The inner expression one period back, expanded to the current
    /// population.
    Lag(Box<Expr>),
    Call(String, Vec<Expr>),
}

pub fn int(value: i64) -> Expr {
    Expr::Int(value)
}

pub fn var(name: &str) -> Expr {
    Expr::Var(name.to_string())
}

pub fn add(a: Expr, b: Expr) -> Expr {
    Expr::Add(Box::new(a), Box::new(b))
}

pub fn gt(a: Expr, b: Expr) -> Expr {
    Expr::Gt(Box::new(a), Box::new(b))
}

pub fn lag(inner: Expr) -> Expr {
    Expr::Lag(Box::new(inner))
}

pub fn call(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Call(name.to_string(), args)
}

impl Expr {
    fn collect_lags(&self, lagged: bool, out: &mut Vec<LagAccess>) {
        match self {
            Self::Int(_) => {}
            Self::Var(name) => {
                if lagged {
                    out.push(LagAccess::Variable(name.clone()));
                }
            }
            Self::Add(a, b) | Self::Gt(a, b) => {
                a.collect_lags(lagged, out);
                b.collect_lags(lagged, out);
            }
            Self::Lag(inner) => inner.collect_lags(true, out),
            Self::Call(_, args) => {
                for arg in args {
                    arg.collect_lags(lagged, out);
                }
            }
        }
    }
}

impl Expression for Expr {
    fn lag_accesses(&self) -> Vec<LagAccess> {
        let mut out = Vec::new();
        self.collect_lags(false, &mut out);
        out
    }

    fn as_call(&self) -> Option<(&str, &[Self])> {
        match self {
            Self::Call(name, args) => Some((name.as_str(), args.as_slice())),
            _ => None,
        }
    }
}

/// Integer arithmetic with scalar broadcasting.
#[derive(Debug, Default, Clone, Copy)]
pub struct Calc;

fn as_ints(value: &Binding, len: usize) -> SimResult<Vec<i64>> {
    match value {
        Binding::Scalar(v) => {
            let v = v.cast(FieldType::Int).as_int().unwrap_or(-1);
            Ok(vec![v; len])
        }
        Binding::Column(column) => Ok(column
            .cast(FieldType::Int)
            .as_ints()
            .map(<[i64]>::to_vec)
            .unwrap_or_default()),
        Binding::Globals(_) => Err(ExecutionError::Evaluation {
            message: "arithmetic on the global state".to_string(),
        }
        .into()),
    }
}

fn binary(
    a: &Binding,
    b: &Binding,
    result_type: FieldType,
    op: impl Fn(i64, i64) -> Value,
) -> SimResult<Binding> {
    if let (Binding::Scalar(x), Binding::Scalar(y)) = (a, b) {
        let x = x.cast(FieldType::Int).as_int().unwrap_or(-1);
        let y = y.cast(FieldType::Int).as_int().unwrap_or(-1);
        return Ok(Binding::Scalar(op(x, y)));
    }
    let len = a.len().or_else(|| b.len()).unwrap_or(0);
    let xs = as_ints(a, len)?;
    let ys = as_ints(b, len)?;
    let mut column = Column::empty(result_type);
    for (x, y) in xs.iter().zip(&ys) {
        column.push(op(*x, *y));
    }
    Ok(Binding::column(column))
}

impl Evaluator<Expr> for Calc {
    fn evaluate(&self, expr: &Expr, ctx: &dyn EvalContext) -> SimResult<Binding> {
        match expr {
            Expr::Int(v) => Ok(Binding::Scalar(Value::Int(*v))),
            Expr::Var(name) => ctx.resolve(name),
            Expr::Add(a, b) => binary(
                &self.evaluate(a, ctx)?,
                &self.evaluate(b, ctx)?,
                FieldType::Int,
                |x, y| Value::Int(x + y),
            ),
            Expr::Gt(a, b) => binary(
                &self.evaluate(a, ctx)?,
                &self.evaluate(b, ctx)?,
                FieldType::Bool,
                |x, y| Value::Bool(x > y),
            ),
            Expr::Lag(inner) => {
                let entity = ctx
                    .entity()
                    .ok_or_else(|| SimError::internal("lag outside of an entity"))?;
                let value =
                    entity.value_for_period(self, inner, ctx.period().prev(), ctx, Fill::Auto)?;
                match value {
                    PeriodValue::Scalar(v) => Ok(Binding::Scalar(v)),
                    PeriodValue::Expanded(column) | PeriodValue::Raw { values: column, .. } => {
                        Ok(Binding::column(column))
                    }
                }
            }
            Expr::Call(name, _) if name == "count" => Ok(Binding::Scalar(Value::Int(
                i64::try_from(ctx.length()).unwrap_or(i64::MAX),
            ))),
            Expr::Call(name, _) => Err(ExecutionError::Evaluation {
                message: format!("unknown function '{name}'"),
            }
            .into()),
        }
    }
}

pub fn named(name: &str, def: ProcessDef<Expr>) -> (Option<String>, ProcessDef<Expr>) {
    (Some(name.to_string()), def)
}

pub fn person_schema() -> Arc<EntitySchema> {
    Arc::new(
        EntitySchema::new(
            "person",
            vec![FieldDef::new("age", FieldType::Int)],
            Vec::new(),
            Vec::new(),
        )
        .unwrap(),
    )
}

/// `(period, id, age)` rows.
pub fn person_rows(rows: &[(i64, i64, i64)]) -> ColumnTable {
    ColumnTable::from_columns([
        ("period", Column::Int(rows.iter().map(|r| r.0).collect())),
        ("id", Column::Int(rows.iter().map(|r| r.1).collect())),
        ("age", Column::Int(rows.iter().map(|r| r.2).collect())),
    ])
    .unwrap()
}

/// A person snapshot over an in-memory output, with `rows` as input.
pub fn person_snapshot(rows: &[(i64, i64, i64)]) -> EntitySnapshot {
    let schema = person_schema();
    let output = InMemoryPeriodStore::new("person", schema.fields().to_vec());
    let mut snapshot = EntitySnapshot::new(SchemaSource::Schema(schema), Box::new(output)).unwrap();
    let input = InMemoryPeriodStore::from_table("person", &person_rows(rows)).unwrap();
    snapshot.attach_input(Box::new(input)).unwrap();
    snapshot
}

pub fn ints(binding: &Binding) -> Vec<i64> {
    binding.as_column().and_then(Column::as_ints).unwrap().to_vec()
}
