//! Per-entity simulation state.
//!
//! An [`EntitySnapshot`] holds the live array of one entity for the period
//! being simulated, the lag cache of the previous period, the transient
//! variables computed during the current period and the row windows and
//! id indices of every period materialized in the input and output stores.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::context::{EvalContext, TemporalContext};
use crate::error::{ExecutionError, SchemaError, SimError, SimResult};
use crate::globals::Globals;
use crate::period::Period;
use crate::process::Evaluator;
use crate::schema::EntitySchema;
use crate::storage::{IndexSlot, PeriodStore, RowWindow, StorageError};
use crate::table::{ColumnTable, RowIndex};
use crate::value::{Binding, Column, Value};

/// Where an entity's schema comes from. Exactly one source is given.
#[derive(Debug, Clone)]
pub enum SchemaSource {
    /// A declared schema; the live array starts empty.
    Schema(Arc<EntitySchema>),
    /// An existing array of one period; the schema is derived from its
    /// columns and the array becomes the live array.
    Table { name: String, table: ColumnTable },
}

/// Fill policy when expanding past values to the current population.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fill {
    /// The missing value of the column type.
    Auto,
    /// An explicit filler.
    Value(Value),
    /// No expansion: return the raw ids and values.
    None,
}

/// Result of [`EntitySnapshot::value_for_period`].
#[derive(Debug, Clone)]
pub enum PeriodValue {
    /// The expression did not depend on the rows.
    Scalar(Value),
    /// Values of the past individuals, with their ids.
    Raw {
        /// Ids of the individuals of the evaluated period.
        ids: Vec<i64>,
        /// One value per id.
        values: Column,
    },
    /// One value per row of the target context.
    Expanded(Column),
}

impl PeriodValue {
    /// The expanded column or the raw values.
    #[must_use]
    pub fn column(&self) -> Option<&Column> {
        match self {
            Self::Scalar(_) => None,
            Self::Raw { values, .. } => Some(values),
            Self::Expanded(column) => Some(column),
        }
    }
}

/// The state of one entity across periods.
///
/// Besides the live array and its transients, it keeps the lag cache of
/// the previous period. Stored periods are reached through their row
/// windows and id indices.
#[derive(Debug)]
pub struct EntitySnapshot {
    schema: Arc<EntitySchema>,
    live_period: Option<Period>,
    base_period: Option<Period>,
    array: ColumnTable,
    id_to_rownum: Arc<RowIndex>,
    lag_fields: Vec<String>,
    lag_array: Option<ColumnTable>,
    transients: BTreeMap<String, Binding>,
    input_index: BTreeMap<Period, IndexSlot>,
    output_index: BTreeMap<Period, IndexSlot>,
    input_rows: BTreeMap<Period, RowWindow>,
    output_rows: BTreeMap<Period, RowWindow>,
    input: Option<Box<dyn PeriodStore>>,
    output: Box<dyn PeriodStore>,
    max_purged: usize,
}

impl EntitySnapshot {
    /// Creates the snapshot of one entity writing into `output`.
    ///
    /// Periods already present in `output` are registered, with their
    /// persisted indices behind lazy handles, so a reopened store can be
    /// inspected through [`EntitySnapshot::context`].
    pub fn new(source: SchemaSource, output: Box<dyn PeriodStore>) -> SimResult<Self> {
        let (schema, array, live_period) = match source {
            SchemaSource::Schema(schema) => {
                let array = ColumnTable::empty(schema.fields());
                (schema, array, None)
            }
            SchemaSource::Table { name, table } => {
                let schema = EntitySchema::new(name, table.fields(), Vec::new(), Vec::new())?;
                let period = Self::single_period(&table)?;
                let array = ColumnTable::empty(schema.fields()).merge(&table)?.0;
                (Arc::new(schema), array, period)
            }
        };

        for field in schema.fields() {
            match output.field_type(&field.name) {
                None => {
                    return Err(SchemaError::MissingField {
                        entity: schema.name().to_string(),
                        field: field.name.clone(),
                    }
                    .into())
                }
                Some(actual) if actual != field.field_type => {
                    return Err(StorageError::TypeMismatch {
                        table: output.name().to_string(),
                        field: field.name.clone(),
                        expected: field.field_type,
                        actual,
                    }
                    .into())
                }
                Some(_) => {}
            }
        }

        let output_rows = output.windows().clone();
        let mut output_index = BTreeMap::new();
        for &period in output_rows.keys() {
            if let Some(handle) = output.index_handle(period)? {
                output_index.insert(period, IndexSlot::Lazy(handle));
            }
        }

        let id_to_rownum = Arc::new(array.row_index()?);
        Ok(Self {
            schema,
            live_period,
            base_period: None,
            array,
            id_to_rownum,
            lag_fields: Vec::new(),
            lag_array: None,
            transients: BTreeMap::new(),
            input_index: BTreeMap::new(),
            output_index,
            input_rows: BTreeMap::new(),
            output_rows,
            input: None,
            output,
            max_purged: 0,
        })
    }

    fn single_period(table: &ColumnTable) -> SimResult<Option<Period>> {
        let Some(periods) = table.column("period").and_then(|c| c.as_ints()) else {
            return Ok(None);
        };
        let Some(&first) = periods.first() else {
            return Ok(None);
        };
        if periods.iter().any(|p| *p != first) {
            return Err(ExecutionError::precondition(
                "an array used as entity source must hold a single period",
            )
            .into());
        }
        Ok(Some(Period::new(first)))
    }

    /// Attaches the initial input, recording its period windows and indices.
    ///
    /// Every stored field not declared missing must be present in the input.
    pub fn attach_input(&mut self, input: Box<dyn PeriodStore>) -> SimResult<()> {
        for field in self.schema.fields() {
            if !input.has_field(&field.name) && !self.schema.missing_fields().contains(&field.name) {
                return Err(SchemaError::MissingField {
                    entity: self.schema.name().to_string(),
                    field: field.name.clone(),
                }
                .into());
            }
        }

        self.input_rows = input.windows().clone();
        self.input_index.clear();
        for (&period, &window) in &self.input_rows {
            let ids = input.read_field(window, "id")?;
            let ids = ids.as_ints().ok_or_else(|| {
                SimError::internal(format!("input id column of '{}' is not integer", input.name()))
            })?;
            let index = RowIndex::from_ids(ids)?;
            self.input_index
                .insert(period, IndexSlot::Materialized(Arc::new(index)));
        }
        tracing::debug!(
            entity = %self.schema.name(),
            periods = self.input_rows.len(),
            "attached input"
        );
        self.input = Some(input);
        Ok(())
    }

    /// Copies the input periods before `start` to the output store and makes
    /// the last of them the live array.
    ///
    /// Only row windows are recorded for those periods, not output indices:
    /// contexts for them look ids up through the input indices.
    pub fn seed_history(&mut self, start: Period) -> SimResult<()> {
        self.base_period = Some(start);
        let Some(input) = self.input.as_ref() else {
            return Ok(());
        };

        let history: Vec<(Period, RowWindow)> = self
            .input_rows
            .range(..start)
            .map(|(p, w)| (*p, *w))
            .collect();
        for (period, window) in history {
            if self.output_rows.contains_key(&period) {
                continue;
            }
            let rows = input.read_rows(window)?;
            let (conformed, index) = ColumnTable::empty(self.schema.fields()).merge(&rows)?;
            let written = self.output.append(period, &conformed)?;
            self.output_rows.insert(period, written);
            self.array = conformed;
            self.id_to_rownum = Arc::new(index);
            self.live_period = Some(period);
        }
        self.output.flush()?;
        tracing::debug!(
            entity = %self.schema.name(),
            %start,
            seeded = self.output_rows.len(),
            "seeded history"
        );
        Ok(())
    }

    /// Declares the fields captured into the lag cache each period.
    pub fn set_lag_fields(&mut self, fields: Vec<String>) -> Result<(), SchemaError> {
        if let Some(unknown) = fields.iter().find(|f| !self.schema.is_stored(f)) {
            return Err(SchemaError::UnknownLagField {
                entity: self.schema.name().to_string(),
                field: unknown.clone(),
            });
        }
        self.lag_fields = fields;
        Ok(())
    }

    /// Captures the lag cache, then merges the input rows of `period` into
    /// the live array.
    pub fn load_period_data(&mut self, period: Period) -> SimResult<()> {
        if !self.lag_fields.is_empty() {
            self.lag_array = Some(self.array.select(&self.lag_fields)?);
        }

        let Some(window) = self.input_rows.get(&period).copied() else {
            return Ok(());
        };
        let Some(input) = self.input.as_ref() else {
            return Ok(());
        };
        let rows = input.read_rows(window)?;
        let (array, index) = self.array.merge(&rows)?;
        self.array = array;
        self.id_to_rownum = Arc::new(index);
        Ok(())
    }

    /// Makes `period` the live period and stamps it on every row.
    pub fn set_live_period(&mut self, period: Period) -> SimResult<()> {
        self.live_period = Some(period);
        self.array
            .assign("period", &Binding::Scalar(Value::Int(period.get())))?;
        Ok(())
    }

    /// Makes a stored period the live array, for inspection after the fact.
    pub fn load_stored_period(&mut self, period: Period) -> SimResult<()> {
        let window = self.output.window(period);
        self.array = self.output.read_rows(window)?;
        self.id_to_rownum = Arc::new(self.array.row_index()?);
        self.transients.clear();
        self.lag_array = None;
        self.live_period = Some(period);
        Ok(())
    }

    /// Stores `value` under `name`: in place for stored fields, as a
    /// transient otherwise.
    pub fn assign(&mut self, name: &str, value: Binding) -> SimResult<()> {
        if self.schema.is_stored(name) {
            self.array.assign(name, &value)?;
        } else {
            self.transients.insert(name.to_string(), value);
        }
        Ok(())
    }

    /// Keeps only the rows where `keep` is true, rebuilding the id index.
    ///
    /// Transient columns of the current length are filtered alongside.
    pub fn retain(&mut self, keep: &[bool]) -> SimResult<()> {
        let len = self.array.len();
        let columns = self
            .array
            .iter()
            .map(|(name, col)| -> Result<(String, Column), ExecutionError> {
                Ok((name.to_string(), col.filter(keep)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.array = ColumnTable::from_columns(columns)?;
        self.id_to_rownum = Arc::new(self.array.row_index()?);
        for value in self.transients.values_mut() {
            if let Binding::Column(col) = value {
                if col.len() == len {
                    *value = Binding::column(col.filter(keep)?);
                }
            }
        }
        Ok(())
    }

    /// Evicts every transient not in `keep`, returning how many were purged.
    pub fn purge_locals(&mut self, keep: &BTreeSet<String>) -> usize {
        let locals: Vec<String> = self
            .transients
            .keys()
            .filter(|name| !keep.contains(*name))
            .cloned()
            .collect();
        let count = locals.len();
        if count == 0 {
            return 0;
        }

        self.max_purged = self.max_purged.max(count);
        let arrays: Vec<&Column> = locals
            .iter()
            .filter_map(|name| self.transients.get(name).and_then(Binding::as_column))
            .collect();
        let freed: usize = arrays.iter().map(|c| c.nbytes()).sum();
        let item_sizes: usize = arrays.iter().map(|c| c.field_type().item_size()).sum();
        tracing::debug!(
            entity = %self.schema.name(),
            purged = count,
            max = self.max_purged,
            freed_bytes = freed,
            avg_field_size = item_sizes / count,
            "purging local variables"
        );

        for name in &locals {
            self.transients.remove(name);
        }
        count
    }

    /// Drops every transient variable.
    pub fn clear_transients(&mut self) {
        self.transients.clear();
    }

    /// Appends the live array as `period`, records its window and persists
    /// its id index.
    pub fn store_period_data(&mut self, period: Period) -> SimResult<RowWindow> {
        if self.output_rows.contains_key(&period) {
            return Err(ExecutionError::PeriodAlreadyFlushed {
                entity: self.schema.name().to_string(),
                period,
            }
            .into());
        }

        let temp_bytes: usize = self.transients.values().map(Binding::nbytes).sum();
        let main_bytes = self.array.nbytes();
        tracing::debug!(
            entity = %self.schema.name(),
            %period,
            total_bytes = main_bytes + temp_bytes,
            main_bytes,
            temp_bytes,
            "memory used"
        );

        self.transients.clear();

        let window = self.output.append(period, &self.array)?;
        self.output_rows.insert(period, window);
        self.flush_index(period)?;
        self.output.flush()?;
        Ok(window)
    }

    /// Persists the index of `period` and demotes the previous period's
    /// in-memory index to a lazy handle on its durable copy.
    fn flush_index(&mut self, period: Period) -> SimResult<()> {
        self.output_index
            .insert(period, IndexSlot::Materialized(Arc::clone(&self.id_to_rownum)));
        self.output.write_index(period, &self.id_to_rownum)?;

        let previous = period.prev();
        if let Some(handle) = self.output.index_handle(previous)? {
            self.output_index.insert(previous, IndexSlot::Lazy(handle));
        }
        Ok(())
    }

    /// A context resolving names at `period`.
    #[must_use]
    pub fn context(&self, period: Period, globals: Arc<Globals>) -> TemporalContext<'_> {
        TemporalContext::new(self, period, globals)
    }

    /// Evaluates `expr` at `period` and expands the result to the
    /// population of `ctx`.
    pub fn value_for_period<E>(
        &self,
        evaluator: &dyn Evaluator<E>,
        expr: &E,
        period: Period,
        ctx: &dyn EvalContext,
        fill: Fill,
    ) -> SimResult<PeriodValue> {
        let sub = TemporalContext::new(self, period, ctx.globals()?);
        match evaluator.evaluate(expr, &sub)? {
            Binding::Scalar(value) => Ok(PeriodValue::Scalar(value)),
            Binding::Column(values) => {
                let ids = sub.resolve("id")?;
                let ids = ids.as_column().and_then(Column::as_ints).ok_or_else(|| {
                    SimError::internal(format!("id column of '{}' is not integer", self.name()))
                })?;
                let filler = match fill {
                    Fill::None => {
                        return Ok(PeriodValue::Raw {
                            ids: ids.to_vec(),
                            values: values.as_ref().clone(),
                        })
                    }
                    Fill::Auto => None,
                    Fill::Value(v) => Some(v),
                };
                Ok(PeriodValue::Expanded(Self::fill_missing_values(
                    ids, &values, ctx, filler,
                )?))
            }
            Binding::Globals(_) => Err(ExecutionError::Evaluation {
                message: "expression evaluated to the global state handle".to_string(),
            }
            .into()),
        }
    }

    /// Expands `values` of past individuals `ids` to the population of
    /// `ctx`; rows without a past value get `filler` (the type's missing
    /// value when `None`).
    pub fn fill_missing_values(
        ids: &[i64],
        values: &Column,
        ctx: &dyn EvalContext,
        filler: Option<Value>,
    ) -> SimResult<Column> {
        let ty = values.field_type();
        let filler = filler.map_or_else(|| ty.missing_value(), |v| v.cast(ty));
        let mut result = Column::filled(filler, ctx.length());
        if !ids.is_empty() {
            let index = ctx.id_to_rownum()?;
            result.put(&index.rows_for(ids), values)?;
        }
        Ok(result)
    }

    /// Name of the entity.
    #[must_use]
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// The entity's schema.
    #[must_use]
    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    /// The period being simulated, if any.
    #[must_use]
    pub const fn live_period(&self) -> Option<Period> {
        self.live_period
    }

    /// First simulated period, once history was seeded.
    #[must_use]
    pub const fn base_period(&self) -> Option<Period> {
        self.base_period
    }

    /// The live array.
    #[must_use]
    pub const fn array(&self) -> &ColumnTable {
        &self.array
    }

    /// Id -> row-number index of the live array.
    #[must_use]
    pub fn id_to_rownum(&self) -> &Arc<RowIndex> {
        &self.id_to_rownum
    }

    /// Fields copied into the lag cache at every period start.
    #[must_use]
    pub fn lag_fields(&self) -> &[String] {
        &self.lag_fields
    }

    /// Previous-period values of the lagged fields.
    #[must_use]
    pub const fn lag_array(&self) -> Option<&ColumnTable> {
        self.lag_array.as_ref()
    }

    /// Variables computed during the live period and not stored.
    #[must_use]
    pub const fn transients(&self) -> &BTreeMap<String, Binding> {
        &self.transients
    }

    /// Row windows of the input periods.
    #[must_use]
    pub const fn input_rows(&self) -> &BTreeMap<Period, RowWindow> {
        &self.input_rows
    }

    /// Row windows of the stored periods.
    #[must_use]
    pub const fn output_rows(&self) -> &BTreeMap<Period, RowWindow> {
        &self.output_rows
    }

    /// Id indices of the input periods.
    #[must_use]
    pub const fn input_index(&self) -> &BTreeMap<Period, IndexSlot> {
        &self.input_index
    }

    /// Id indices of the stored periods.
    #[must_use]
    pub const fn output_index(&self) -> &BTreeMap<Period, IndexSlot> {
        &self.output_index
    }

    /// The output store.
    #[must_use]
    pub fn output(&self) -> &dyn PeriodStore {
        self.output.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;
    use crate::storage::InMemoryPeriodStore;
    use crate::value::FieldType;

    fn schema() -> Arc<EntitySchema> {
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

    fn snapshot() -> EntitySnapshot {
        let schema = schema();
        let output = InMemoryPeriodStore::new("person", schema.fields().to_vec());
        let mut snapshot =
            EntitySnapshot::new(SchemaSource::Schema(schema), Box::new(output)).unwrap();
        let input = ColumnTable::from_columns([
            ("period", Column::Int(vec![2000, 2000, 2001])),
            ("id", Column::Int(vec![0, 1, 2])),
            ("age", Column::Int(vec![10, 20, 1])),
        ])
        .unwrap();
        snapshot
            .attach_input(Box::new(InMemoryPeriodStore::from_table("person", &input).unwrap()))
            .unwrap();
        snapshot
    }

    #[test]
    fn test_seed_history_copies_earlier_periods_only() {
        let mut s = snapshot();
        s.seed_history(Period::new(2001)).unwrap();

        assert_eq!(s.output_rows().len(), 1);
        assert_eq!(s.output_rows()[&Period::new(2000)], RowWindow::new(0, 2));
        assert!(s.output_index().is_empty());
        assert_eq!(s.live_period(), Some(Period::new(2000)));
        assert_eq!(s.array().len(), 2);
        assert_eq!(s.input_index().len(), 2);
    }

    #[test]
    fn test_load_period_merges_new_individuals_and_captures_lag() {
        let mut s = snapshot();
        s.seed_history(Period::new(2001)).unwrap();
        s.set_lag_fields(vec!["id".to_string(), "age".to_string()]).unwrap();

        s.load_period_data(Period::new(2001)).unwrap();
        s.set_live_period(Period::new(2001)).unwrap();

        assert_eq!(s.array().ids().unwrap(), &[0, 1, 2]);
        assert_eq!(s.lag_array().unwrap().len(), 2);
        assert_eq!(
            s.array().column("period").unwrap().as_ints().unwrap(),
            &[2001, 2001, 2001]
        );
        assert_eq!(s.id_to_rownum().row_of(2), Some(2));
    }

    #[test]
    fn test_missing_input_field_is_a_schema_error() {
        let schema = schema();
        let output = InMemoryPeriodStore::new("person", schema.fields().to_vec());
        let mut s = EntitySnapshot::new(SchemaSource::Schema(schema), Box::new(output)).unwrap();
        let input = ColumnTable::from_columns([
            ("period", Column::Int(vec![2000])),
            ("id", Column::Int(vec![0])),
        ])
        .unwrap();
        let err = s
            .attach_input(Box::new(InMemoryPeriodStore::from_table("person", &input).unwrap()))
            .unwrap_err();
        assert!(err.is_schema());
    }

    #[test]
    fn test_unknown_lag_field_is_rejected() {
        let mut s = snapshot();
        let err = s.set_lag_fields(vec!["height".to_string()]).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownLagField { .. }));
    }

    #[test]
    fn test_store_twice_fails_and_demotes_previous_index() {
        let mut s = snapshot();
        s.seed_history(Period::new(2001)).unwrap();
        for p in [2001, 2002] {
            let p = Period::new(p);
            s.load_period_data(p).unwrap();
            s.set_live_period(p).unwrap();
            s.store_period_data(p).unwrap();
        }
        assert!(s.output_index()[&Period::new(2001)].rows_for(&[2]).unwrap() == vec![2]);
        assert!(!s.output_index()[&Period::new(2001)].is_materialized());
        assert!(s.output_index()[&Period::new(2002)].is_materialized());

        let err = s.store_period_data(Period::new(2002)).unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(s.output_rows()[&Period::new(2002)], RowWindow::new(5, 8));
    }

    #[test]
    fn test_purge_keeps_predictors_and_store_clears_all() {
        let mut s = snapshot();
        s.seed_history(Period::new(2001)).unwrap();
        s.set_live_period(Period::new(2001)).unwrap();
        s.assign("tmp", Binding::column(Column::Int(vec![1, 2]))).unwrap();
        s.assign("shared", Binding::Scalar(Value::Int(3))).unwrap();
        s.assign("age", Binding::Scalar(Value::Int(40))).unwrap();

        let keep: BTreeSet<String> = ["shared".to_string()].into_iter().collect();
        assert_eq!(s.purge_locals(&keep), 1);
        assert!(s.transients().contains_key("shared"));
        assert!(!s.transients().contains_key("tmp"));
        assert_eq!(s.array().column("age").unwrap().as_ints().unwrap(), &[40, 40]);

        s.store_period_data(Period::new(2001)).unwrap();
        assert!(s.transients().is_empty());
    }

    #[test]
    fn test_retain_rebuilds_index_and_filters_transients() {
        let mut s = snapshot();
        s.seed_history(Period::new(2001)).unwrap();
        s.assign("tmp", Binding::column(Column::Int(vec![7, 8]))).unwrap();
        s.retain(&[false, true]).unwrap();

        assert_eq!(s.array().ids().unwrap(), &[1]);
        assert_eq!(s.id_to_rownum().row_of(1), Some(0));
        assert_eq!(s.id_to_rownum().row_of(0), None);
        assert_eq!(
            s.transients()["tmp"].as_column().unwrap().as_ints().unwrap(),
            &[8]
        );
    }

    #[test]
    fn test_table_source_derives_schema_and_live_period() {
        let table = ColumnTable::from_columns([
            ("period", Column::Int(vec![1990, 1990])),
            ("id", Column::Int(vec![4, 2])),
            ("wealth", Column::Float(vec![1.0, 2.0])),
        ])
        .unwrap();
        let output = InMemoryPeriodStore::new("hh", table.fields());
        let s = EntitySnapshot::new(
            SchemaSource::Table {
                name: "hh".to_string(),
                table,
            },
            Box::new(output),
        )
        .unwrap();
        assert_eq!(s.live_period(), Some(Period::new(1990)));
        assert_eq!(s.array().ids().unwrap(), &[2, 4]);
        assert!(s.schema().is_stored("wealth"));
    }
}
