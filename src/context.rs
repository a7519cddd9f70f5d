//! Variable resolution.
//!
//! A [`TemporalContext`] answers "what is `name` for this entity at period
//! P". The lookup sources are tried in a fixed order:
//!
//! 1. extra bindings (locals, the period, the global state handle)
//! 2. live period: transients, then the live array
//! 3. previous period: the lag cache, for declared lag fields
//! 4. any other period: the stored rows of that period (empty when the
//!    period was never stored)
//!
//! Contexts derived with [`subset`] and [`delete`] are detached
//! [`LocalContext`]s owning fresh bindings.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{ExecutionError, SimError, SimResult};
use crate::globals::{Globals, GLOBALS_KEY, LENGTH_KEY, NAN_KEY, PERIOD_KEY};
use crate::period::Period;
use crate::snapshot::EntitySnapshot;
use crate::storage::{RowWindow, StorageError};
use crate::table::RowIndex;
use crate::value::{Binding, Column, Value};

/// Name -> value bindings of a context.
pub type Bindings = BTreeMap<String, Binding>;

/// Read access to named values, implemented by every context kind.
pub trait EvalContext {
    /// Period the context resolves names at.
    fn period(&self) -> Period;

    /// Resolves `name`, failing with a lookup failure when it is unknown.
    fn resolve(&self, name: &str) -> SimResult<Binding>;

    /// Whether `name` resolves, without reading it.
    fn has(&self, name: &str) -> bool;

    /// Number of individuals (rows) in the context.
    fn length(&self) -> usize;

    /// Visible names, extra bindings included when `extra` is set.
    fn keys(&self, extra: bool) -> Vec<String>;

    /// The entity this context reads from, if any.
    fn entity(&self) -> Option<&EntitySnapshot>;

    /// The id -> row-number index of the individuals of this context.
    fn id_to_rownum(&self) -> SimResult<Arc<RowIndex>>;

    /// The process-global state.
    fn globals(&self) -> SimResult<Arc<Globals>> {
        self.resolve(GLOBALS_KEY)?
            .as_globals()
            .cloned()
            .ok_or_else(|| SimError::internal("global state binding has the wrong kind"))
    }

    /// Resolves `name`, `None` when it is not visible.
    fn get(&self, name: &str) -> Option<Binding> {
        if self.has(name) {
            self.resolve(name).ok()
        } else {
            None
        }
    }
}

/// The lookup source a name resolves from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    /// A binding set on the context itself, such as a function argument.
    Extra,
    /// A transient variable of the live period.
    Transient,
    /// A column of the live array.
    LiveArray,
    /// A lagged field of the previous period.
    LagArray,
    /// A field read from the output store.
    History,
}

/// A view over an entity snapshot at a target period.
#[derive(Debug)]
pub struct TemporalContext<'a> {
    entity: &'a EntitySnapshot,
    period: Period,
    extra: Bindings,
}

impl<'a> TemporalContext<'a> {
    /// A context at `period` with only the reserved names set.
    #[must_use]
    pub fn new(entity: &'a EntitySnapshot, period: Period, globals: Arc<Globals>) -> Self {
        Self::with_extra(entity, period, globals, Bindings::new())
    }

    /// A context over `extra`, which gains the period and global bindings
    /// unless it already holds them.
    #[must_use]
    pub fn with_extra(
        entity: &'a EntitySnapshot,
        period: Period,
        globals: Arc<Globals>,
        mut extra: Bindings,
    ) -> Self {
        extra
            .entry(PERIOD_KEY.to_string())
            .or_insert(Binding::Scalar(Value::Int(period.get())));
        extra
            .entry(GLOBALS_KEY.to_string())
            .or_insert(Binding::Globals(globals));
        Self {
            entity,
            period,
            extra,
        }
    }

    /// A context with the same bindings aliasing the same data.
    #[must_use]
    pub fn copy(&self) -> Self {
        Self {
            entity: self.entity,
            period: self.period,
            extra: self.extra.clone(),
        }
    }

    /// Binds `name` on this context, shadowing the entity.
    pub fn set(&mut self, name: impl Into<String>, value: Binding) {
        self.extra.insert(name.into(), value);
    }

    /// Removes a binding set on this context.
    pub fn remove(&mut self, name: &str) -> Option<Binding> {
        self.extra.remove(name)
    }

    /// The bindings set on this context.
    #[must_use]
    pub fn into_extra(self) -> Bindings {
        self.extra
    }

    /// True when `period` is the entity's live period.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.entity.live_period() == Some(self.period)
    }

    /// Periods with a known output index.
    #[must_use]
    pub fn list_periods(&self) -> Vec<Period> {
        self.entity.output_index().keys().copied().collect()
    }

    fn uses_lag(&self, name: &str) -> bool {
        self.entity
            .live_period()
            .is_some_and(|live| self.period == live.prev())
            && self.entity.lag_array().is_some_and(|lag| lag.has_field(name))
    }

    fn history_window(&self) -> RowWindow {
        self.entity
            .output_rows()
            .get(&self.period)
            .copied()
            .unwrap_or(RowWindow::EMPTY)
    }

    /// The source `name` resolves from, `None` when it is unknown.
    #[must_use]
    pub fn locate(&self, name: &str) -> Option<LookupSource> {
        if self.extra.contains_key(name) {
            return Some(LookupSource::Extra);
        }
        if self.is_live() {
            if self.entity.transients().contains_key(name) {
                return Some(LookupSource::Transient);
            }
            if self.entity.array().has_field(name) {
                return Some(LookupSource::LiveArray);
            }
            return None;
        }
        if self.uses_lag(name) {
            return Some(LookupSource::LagArray);
        }
        if self.entity.output().has_field(name) {
            return Some(LookupSource::History);
        }
        None
    }
}

impl EvalContext for TemporalContext<'_> {
    fn period(&self) -> Period {
        self.period
    }

    fn resolve(&self, name: &str) -> SimResult<Binding> {
        let not_found = || SimError::from(ExecutionError::lookup(name, self.period));
        match self.locate(name).ok_or_else(not_found)? {
            LookupSource::Extra => self.extra.get(name).cloned().ok_or_else(not_found),
            LookupSource::Transient => self
                .entity
                .transients()
                .get(name)
                .cloned()
                .ok_or_else(not_found),
            LookupSource::LiveArray => self
                .entity
                .array()
                .column(name)
                .map(|c| Binding::Column(Arc::clone(c)))
                .ok_or_else(not_found),
            LookupSource::LagArray => self
                .entity
                .lag_array()
                .and_then(|lag| lag.column(name))
                .map(|c| Binding::Column(Arc::clone(c)))
                .ok_or_else(not_found),
            LookupSource::History => {
                match self.entity.output().read_field(self.history_window(), name) {
                    Ok(column) => Ok(Binding::column(column)),
                    Err(StorageError::UnknownField { .. }) => Err(not_found()),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    fn has(&self, name: &str) -> bool {
        self.locate(name).is_some()
    }

    fn length(&self) -> usize {
        if self.is_live() {
            self.entity.array().len()
        } else {
            usize::try_from(self.history_window().len()).unwrap_or(usize::MAX)
        }
    }

    fn keys(&self, extra: bool) -> Vec<String> {
        let mut keys: Vec<String> = self.entity.schema().field_names().map(String::from).collect();
        keys.extend(self.entity.transients().keys().cloned());
        if extra {
            keys.extend(self.extra.keys().cloned());
        }
        keys
    }

    fn entity(&self) -> Option<&EntitySnapshot> {
        Some(self.entity)
    }

    /// Live map in the live case, then the output index of the period, then
    /// its input index. Periods seeded from the input have no output index;
    /// their input index stands in for it.
    fn id_to_rownum(&self) -> SimResult<Arc<RowIndex>> {
        if self.is_live() {
            return Ok(Arc::clone(self.entity.id_to_rownum()));
        }
        if let Some(slot) = self.entity.output_index().get(&self.period) {
            return Ok(slot.materialize()?);
        }
        if let Some(slot) = self.entity.input_index().get(&self.period) {
            return Ok(slot.materialize()?);
        }
        Err(ExecutionError::NoRowIndex {
            entity: self.entity.name().to_string(),
            period: self.period,
        }
        .into())
    }
}

/// A detached context owning its bindings.
///
/// Holds the row count under [`LENGTH_KEY`]; every array binding has that
/// many rows.
#[derive(Debug, Clone)]
pub struct LocalContext<'a> {
    entity: Option<&'a EntitySnapshot>,
    period: Period,
    bindings: Bindings,
}

impl<'a> LocalContext<'a> {
    /// Builds a context from bindings, checking that arrays agree on length.
    ///
    /// An explicit [`LENGTH_KEY`] binding takes precedence over the array
    /// lengths; without arrays or one, the context is empty.
    pub fn from_bindings(
        entity: Option<&'a EntitySnapshot>,
        period: Period,
        mut bindings: Bindings,
    ) -> SimResult<Self> {
        let mut usual: Option<(String, usize)> = None;
        for (name, value) in &bindings {
            let Some(len) = value.len() else { continue };
            match &usual {
                Some((_, expected)) if *expected != len => {
                    return Err(ExecutionError::precondition(format!(
                        "incoherent array lengths: {name}'s is {len} while the len of others is {expected}"
                    ))
                    .into());
                }
                Some(_) => {}
                None => usual = Some((name.clone(), len)),
            }
        }
        if !bindings.contains_key(LENGTH_KEY) {
            let len = usual.map_or(0, |(_, len)| len);
            bindings.insert(LENGTH_KEY.to_string(), length_binding(len));
        }
        bindings
            .entry(PERIOD_KEY.to_string())
            .or_insert(Binding::Scalar(Value::Int(period.get())));
        Ok(Self {
            entity,
            period,
            bindings,
        })
    }

    /// An empty context shaped like `ctx`, with `length` rows.
    fn like(ctx: &'a dyn EvalContext, length: usize) -> Self {
        let mut bindings = Bindings::new();
        bindings.insert(
            PERIOD_KEY.to_string(),
            Binding::Scalar(Value::Int(ctx.period().get())),
        );
        bindings.insert(LENGTH_KEY.to_string(), length_binding(length));
        if let Some(globals) = ctx.get(GLOBALS_KEY) {
            bindings.insert(GLOBALS_KEY.to_string(), globals);
        }
        bindings.insert(NAN_KEY.to_string(), Binding::Scalar(Value::Float(f64::NAN)));
        Self {
            entity: ctx.entity(),
            period: ctx.period(),
            bindings,
        }
    }

    /// Binds `name`.
    pub fn set(&mut self, name: impl Into<String>, value: Binding) {
        self.bindings.insert(name.into(), value);
    }

    /// Every binding of the context.
    #[must_use]
    pub const fn bindings(&self) -> &Bindings {
        &self.bindings
    }
}

fn length_binding(len: usize) -> Binding {
    Binding::Scalar(Value::Int(i64::try_from(len).unwrap_or(i64::MAX)))
}

impl EvalContext for LocalContext<'_> {
    fn period(&self) -> Period {
        self.period
    }

    fn resolve(&self, name: &str) -> SimResult<Binding> {
        self.bindings
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutionError::lookup(name, self.period).into())
    }

    fn has(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    fn length(&self) -> usize {
        self.bindings
            .get(LENGTH_KEY)
            .and_then(Binding::as_scalar)
            .and_then(|v| v.as_int())
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0)
    }

    fn keys(&self, _extra: bool) -> Vec<String> {
        self.bindings.keys().cloned().collect()
    }

    fn entity(&self) -> Option<&EntitySnapshot> {
        self.entity
    }

    /// Built from the context's own `id` column.
    fn id_to_rownum(&self) -> SimResult<Arc<RowIndex>> {
        let ids = self.resolve("id")?;
        let ids = ids
            .as_column()
            .and_then(Column::as_ints)
            .ok_or_else(|| ExecutionError::precondition("context has no integer id column"))?;
        Ok(Arc::new(RowIndex::from_ids(ids)?))
    }
}

/// Row selection applied by [`subset`].
#[derive(Debug, Clone, Copy)]
pub enum RowSelection<'s> {
    /// Row numbers, in output order.
    Rows(&'s [usize]),
    /// One flag per row of the source context.
    Mask(&'s [bool]),
}

/// A context of the same period holding only `keys` (every visible name
/// when `None`), with array values restricted to `index`.
///
/// A mask must have exactly one flag per row of `ctx`.
pub fn subset<'a>(
    ctx: &'a dyn EvalContext,
    index: Option<RowSelection<'_>>,
    keys: Option<&[String]>,
) -> SimResult<LocalContext<'a>> {
    let length = match index {
        None => ctx.length(),
        Some(RowSelection::Rows(rows)) => rows.len(),
        Some(RowSelection::Mask(mask)) => {
            if mask.len() != ctx.length() {
                return Err(ExecutionError::precondition(format!(
                    "boolean index has length {} instead of {}",
                    mask.len(),
                    ctx.length()
                ))
                .into());
            }
            mask.iter().filter(|m| **m).count()
        }
    };

    let keys = keys.map_or_else(
        || ctx.keys(true).into_iter().filter(|k| ctx.has(k)).collect(),
        <[String]>::to_vec,
    );

    let mut result = LocalContext::like(ctx, length);
    for key in keys {
        if key == LENGTH_KEY {
            continue;
        }
        let value = match (index, ctx.resolve(&key)?) {
            (Some(RowSelection::Rows(rows)), Binding::Column(column)) => {
                Binding::column(column.take(rows)?)
            }
            (Some(RowSelection::Mask(mask)), Binding::Column(column)) => {
                Binding::column(column.filter(mask)?)
            }
            (_, value) => value,
        };
        result.set(key, value);
    }
    Ok(result)
}

/// A copy of `ctx` without row `rownum` in any array value. The global
/// state handle is left untouched.
pub fn delete<'a>(ctx: &'a dyn EvalContext, rownum: usize) -> SimResult<LocalContext<'a>> {
    let length = ctx.length();
    if rownum >= length {
        return Err(ExecutionError::precondition(format!(
            "cannot delete row {rownum} from a context of length {length}"
        ))
        .into());
    }

    let mut result = LocalContext::like(ctx, length - 1);
    for key in ctx.keys(true) {
        if key == LENGTH_KEY || !ctx.has(&key) {
            continue;
        }
        let value = match ctx.resolve(&key)? {
            Binding::Column(column) if key != GLOBALS_KEY => {
                Binding::column(column.without_row(rownum)?)
            }
            value => value,
        };
        result.set(key, value);
    }
    Ok(result)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, FieldDef};
    use crate::snapshot::SchemaSource;
    use crate::storage::InMemoryPeriodStore;
    use crate::table::ColumnTable;
    use crate::value::FieldType;

    fn live_snapshot() -> EntitySnapshot {
        let schema = Arc::new(
            EntitySchema::new(
                "person",
                vec![FieldDef::new("age", FieldType::Int)],
                Vec::new(),
                Vec::new(),
            )
            .unwrap(),
        );
        let output = InMemoryPeriodStore::new("person", schema.fields().to_vec());
        let mut s = EntitySnapshot::new(SchemaSource::Schema(schema), Box::new(output)).unwrap();
        let input = ColumnTable::from_columns([
            ("period", Column::Int(vec![2000, 2000, 2000])),
            ("id", Column::Int(vec![0, 1, 2])),
            ("age", Column::Int(vec![10, 20, 30])),
        ])
        .unwrap();
        s.attach_input(Box::new(InMemoryPeriodStore::from_table("person", &input).unwrap()))
            .unwrap();
        s.seed_history(Period::new(2001)).unwrap();
        s.set_lag_fields(vec!["id".to_string(), "age".to_string()]).unwrap();
        s.load_period_data(Period::new(2001)).unwrap();
        s.set_live_period(Period::new(2001)).unwrap();
        s.assign("score", Binding::column(Column::Float(vec![0.5, 1.5, 2.5])))
            .unwrap();
        s
    }

    fn globals() -> Arc<Globals> {
        Arc::new(Globals::new())
    }

    #[test]
    fn test_precedence_chain() {
        let s = live_snapshot();
        let mut ctx = s.context(Period::new(2001), globals());
        assert_eq!(ctx.locate("score"), Some(LookupSource::Transient));
        assert_eq!(ctx.locate("age"), Some(LookupSource::LiveArray));
        assert_eq!(ctx.locate("agee"), None);

        ctx.set("age", Binding::Scalar(Value::Int(1)));
        assert_eq!(ctx.locate("age"), Some(LookupSource::Extra));

        let past = s.context(Period::new(2000), globals());
        assert_eq!(past.locate("age"), Some(LookupSource::LagArray));
        assert_eq!(past.locate("period"), Some(LookupSource::Extra));

        let older = s.context(Period::new(1999), globals());
        assert_eq!(older.locate("age"), Some(LookupSource::History));
        assert_eq!(older.length(), 0);
        assert!(older.resolve("age").unwrap().as_column().unwrap().is_empty());
    }

    #[test]
    fn test_lookup_failure_is_fatal() {
        let s = live_snapshot();
        let err = s.context(Period::new(2001), globals()).resolve("agee").unwrap_err();
        assert!(err.is_lookup_failure());
        let err = s.context(Period::new(1999), globals()).resolve("agee").unwrap_err();
        assert!(err.is_lookup_failure());
    }

    #[test]
    fn test_seeded_period_uses_input_index() {
        let s = live_snapshot();
        let ctx = s.context(Period::new(2000), globals());
        assert_eq!(ctx.length(), 3);
        assert_eq!(ctx.id_to_rownum().unwrap().row_of(2), Some(2));
        assert!(ctx.list_periods().is_empty());

        let err = s.context(Period::new(1980), globals()).id_to_rownum().unwrap_err();
        assert!(matches!(err, SimError::Execution(ExecutionError::NoRowIndex { .. })));
    }

    #[test]
    fn test_subset_with_mask() {
        let s = live_snapshot();
        let ctx = s.context(Period::new(2001), globals());

        let err = subset(&ctx, Some(RowSelection::Mask(&[true, false])), None).unwrap_err();
        assert!(err.is_precondition());

        let sub = subset(&ctx, Some(RowSelection::Mask(&[true, false, true])), None).unwrap();
        assert_eq!(sub.length(), 2);
        let ages = sub.resolve("age").unwrap();
        assert_eq!(ages.as_column().unwrap().as_ints().unwrap(), &[10, 30]);
        assert!(sub.resolve(GLOBALS_KEY).unwrap().as_globals().is_some());
        assert_eq!(sub.id_to_rownum().unwrap().row_of(2), Some(1));
    }

    #[test]
    fn test_subset_with_rows_and_keys() {
        let s = live_snapshot();
        let ctx = s.context(Period::new(2001), globals());
        let keys = vec!["score".to_string()];
        let sub = subset(&ctx, Some(RowSelection::Rows(&[2, 0])), Some(&keys)).unwrap();
        assert_eq!(sub.length(), 2);
        assert!(!sub.has("age"));
        let score = sub.resolve("score").unwrap();
        assert_eq!(score.as_column().unwrap().as_floats().unwrap(), &[2.5, 0.5]);
    }

    #[test]
    fn test_delete_removes_one_row_everywhere() {
        let s = live_snapshot();
        let ctx = s.context(Period::new(2001), globals());
        let reduced = delete(&ctx, 1).unwrap();

        assert_eq!(reduced.length(), 2);
        let ids = reduced.resolve("id").unwrap();
        assert_eq!(ids.as_column().unwrap().as_ints().unwrap(), &[0, 2]);
        let score = reduced.resolve("score").unwrap();
        assert_eq!(score.as_column().unwrap().as_floats().unwrap(), &[0.5, 2.5]);
        assert!(reduced.resolve(GLOBALS_KEY).unwrap().as_globals().is_some());

        // derived contexts never touch the snapshot
        assert_eq!(ctx.length(), 3);
        assert!(delete(&ctx, 3).unwrap_err().is_precondition());
    }

    #[test]
    fn test_copy_aliases_data_but_not_bindings() {
        let s = live_snapshot();
        let mut ctx = s.context(Period::new(2001), globals());
        ctx.set("x", Binding::column(Column::Int(vec![1, 2, 3])));
        let mut copy = ctx.copy();
        copy.remove("x");
        assert!(ctx.has("x"));
        assert!(!copy.has("x"));

        let a = ctx.resolve("age").unwrap();
        let b = copy.resolve("age").unwrap();
        match (a, b) {
            (Binding::Column(a), Binding::Column(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => panic!("expected columns"),
        }
    }

    #[test]
    fn test_keys_order() {
        let s = live_snapshot();
        let ctx = s.context(Period::new(2001), globals());
        let keys = ctx.keys(false);
        assert_eq!(keys, vec!["period", "id", "age", "score"]);
        assert!(ctx.keys(true).contains(&GLOBALS_KEY.to_string()));
    }

    #[test]
    fn test_local_context_checks_coherence() {
        let mut bindings = Bindings::new();
        bindings.insert("a".to_string(), Binding::column(Column::Int(vec![1, 2])));
        bindings.insert("b".to_string(), Binding::column(Column::Int(vec![1])));
        let err = LocalContext::from_bindings(None, Period::new(1), bindings).unwrap_err();
        assert!(err.to_string().contains("incoherent array lengths"));

        let mut bindings = Bindings::new();
        bindings.insert("a".to_string(), Binding::column(Column::Int(vec![1, 2])));
        let ctx = LocalContext::from_bindings(None, Period::new(1), bindings).unwrap();
        assert_eq!(ctx.length(), 2);
        assert!(ctx.entity().is_none());
    }
}
