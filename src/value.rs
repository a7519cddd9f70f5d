//! Scalar values, typed columns and context bindings.
//!
//! Entity data is columnar: every field of an entity is a [`Column`] holding
//! one value per individual. Expressions evaluate to a [`Binding`], which is
//! either a scalar, a column, or a handle to process-global data.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::globals::Globals;

/// Scalar type of an entity field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// `true` / `false`; missing is `false`.
    Bool,
    /// 64-bit signed integer; missing is `-1`.
    Int,
    /// 64-bit float; missing is NaN.
    Float,
}

impl FieldType {
    /// The type-appropriate missing value sentinel.
    #[must_use]
    pub const fn missing_value(self) -> Value {
        match self {
            Self::Bool => Value::Bool(false),
            Self::Int => Value::Int(-1),
            Self::Float => Value::Float(f64::NAN),
        }
    }

    /// Size in bytes of a single value of this type.
    #[must_use]
    pub const fn item_size(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Int | Self::Float => 8,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
        };
        f.write_str(name)
    }
}

/// A single scalar value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// An integer.
    Int(i64),
    /// A float.
    Float(f64),
}

impl Value {
    /// Type of this value.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::Bool(_) => FieldType::Bool,
            Self::Int(_) => FieldType::Int,
            Self::Float(_) => FieldType::Float,
        }
    }

    /// The boolean, if this is one.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The integer, if this is one.
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a float; integers are widened.
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            Self::Bool(_) => None,
        }
    }

    /// Truth value used by loop conditions: `false`, `0` and `0.0` are false.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Bool(v) => *v,
            Self::Int(v) => *v != 0,
            Self::Float(v) => *v != 0.0,
        }
    }

    /// Converts this value to `target`, following numeric assignment rules.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn cast(self, target: FieldType) -> Self {
        match (self, target) {
            (Self::Bool(v), FieldType::Int) => Self::Int(i64::from(v)),
            (Self::Bool(v), FieldType::Float) => Self::Float(if v { 1.0 } else { 0.0 }),
            (Self::Int(v), FieldType::Bool) => Self::Bool(v != 0),
            (Self::Int(v), FieldType::Float) => Self::Float(v as f64),
            (Self::Float(v), FieldType::Bool) => Self::Bool(v != 0.0),
            (Self::Float(v), FieldType::Int) => Self::Int(v as i64),
            (v, _) => v,
        }
    }
}

/// Floats are stored by bit pattern so that NaN missing values survive the
/// JSON frames of the persistent store.
mod float_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(values.iter().map(|v| v.to_bits()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let bits = Vec::<u64>::deserialize(deserializer)?;
        Ok(bits.into_iter().map(f64::from_bits).collect())
    }
}

/// A typed vector holding one value per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "snake_case")]
pub enum Column {
    /// Boolean rows.
    Bool(Vec<bool>),
    /// Integer rows.
    Int(Vec<i64>),
    /// Float rows.
    Float(#[serde(with = "float_bits")] Vec<f64>),
}

impl Column {
    /// An empty column of the given type.
    #[must_use]
    pub const fn empty(field_type: FieldType) -> Self {
        match field_type {
            FieldType::Bool => Self::Bool(Vec::new()),
            FieldType::Int => Self::Int(Vec::new()),
            FieldType::Float => Self::Float(Vec::new()),
        }
    }

    /// A column of `len` copies of `value`.
    #[must_use]
    pub fn filled(value: Value, len: usize) -> Self {
        match value {
            Value::Bool(v) => Self::Bool(vec![v; len]),
            Value::Int(v) => Self::Int(vec![v; len]),
            Value::Float(v) => Self::Float(vec![v; len]),
        }
    }

    /// A column of `len` missing values of the given type.
    #[must_use]
    pub fn missing(field_type: FieldType, len: usize) -> Self {
        Self::filled(field_type.missing_value(), len)
    }

    /// Element type of the column.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::Bool(_) => FieldType::Bool,
            Self::Int(_) => FieldType::Int,
            Self::Float(_) => FieldType::Float,
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Float(v) => v.len(),
        }
    }

    /// True when the column has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate memory footprint in bytes.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.len() * self.field_type().item_size()
    }

    /// The value at `row`.
    #[must_use]
    pub fn get(&self, row: usize) -> Option<Value> {
        match self {
            Self::Bool(v) => v.get(row).copied().map(Value::Bool),
            Self::Int(v) => v.get(row).copied().map(Value::Int),
            Self::Float(v) => v.get(row).copied().map(Value::Float),
        }
    }

    /// Boolean rows, if this is a boolean column.
    pub fn as_bools(&self) -> Option<&[bool]> {
        match self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Integer rows, if this is an integer column.
    pub fn as_ints(&self) -> Option<&[i64]> {
        match self {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Float rows, if this is a float column.
    pub fn as_floats(&self) -> Option<&[f64]> {
        match self {
            Self::Float(v) => Some(v),
            _ => None,
        }
    }

    /// True when at least one row is truthy.
    #[must_use]
    pub fn any_truthy(&self) -> bool {
        match self {
            Self::Bool(v) => v.iter().any(|x| *x),
            Self::Int(v) => v.iter().any(|x| *x != 0),
            Self::Float(v) => v.iter().any(|x| *x != 0.0),
        }
    }

    /// Rows `start..stop`, clamped to the column length.
    #[must_use]
    pub fn slice(&self, start: usize, stop: usize) -> Self {
        let stop = stop.min(self.len());
        let start = start.min(stop);
        match self {
            Self::Bool(v) => Self::Bool(v[start..stop].to_vec()),
            Self::Int(v) => Self::Int(v[start..stop].to_vec()),
            Self::Float(v) => Self::Float(v[start..stop].to_vec()),
        }
    }

    /// Gathers the given rows, in order.
    pub fn take(&self, rows: &[usize]) -> Result<Self, ExecutionError> {
        if let Some(bad) = rows.iter().find(|r| **r >= self.len()) {
            return Err(ExecutionError::precondition(format!(
                "row {bad} is out of bounds for a column of length {}",
                self.len()
            )));
        }
        Ok(match self {
            Self::Bool(v) => Self::Bool(rows.iter().map(|r| v[*r]).collect()),
            Self::Int(v) => Self::Int(rows.iter().map(|r| v[*r]).collect()),
            Self::Float(v) => Self::Float(rows.iter().map(|r| v[*r]).collect()),
        })
    }

    /// Keeps the rows where `mask` is true.
    pub fn filter(&self, mask: &[bool]) -> Result<Self, ExecutionError> {
        if mask.len() != self.len() {
            return Err(ExecutionError::precondition(format!(
                "boolean index has length {} instead of {}",
                mask.len(),
                self.len()
            )));
        }
        fn keep<T: Copy>(values: &[T], mask: &[bool]) -> Vec<T> {
            values
                .iter()
                .zip(mask)
                .filter_map(|(v, m)| m.then_some(*v))
                .collect()
        }
        Ok(match self {
            Self::Bool(v) => Self::Bool(keep(v, mask)),
            Self::Int(v) => Self::Int(keep(v, mask)),
            Self::Float(v) => Self::Float(keep(v, mask)),
        })
    }

    /// A copy of this column without `row`.
    pub fn without_row(&self, row: usize) -> Result<Self, ExecutionError> {
        if row >= self.len() {
            return Err(ExecutionError::precondition(format!(
                "cannot delete row {row} from a column of length {}",
                self.len()
            )));
        }
        let mut out = self.clone();
        match &mut out {
            Self::Bool(v) => {
                v.remove(row);
            }
            Self::Int(v) => {
                v.remove(row);
            }
            Self::Float(v) => {
                v.remove(row);
            }
        }
        Ok(out)
    }

    /// Converts every value to `target`.
    #[must_use]
    pub fn cast(&self, target: FieldType) -> Self {
        if self.field_type() == target {
            return self.clone();
        }
        let len = self.len();
        let mut out = Self::empty(target);
        for row in 0..len {
            if let Some(value) = self.get(row) {
                out.push(value.cast(target));
            }
        }
        out
    }

    /// Appends `value`, converting it to this column's type.
    pub fn push(&mut self, value: Value) {
        match self {
            Self::Bool(v) => v.push(value.cast(FieldType::Bool).as_bool().unwrap_or(false)),
            Self::Int(v) => v.push(value.cast(FieldType::Int).as_int().unwrap_or(-1)),
            Self::Float(v) => v.push(value.cast(FieldType::Float).as_float().unwrap_or(f64::NAN)),
        }
    }

    /// Appends all rows of `other`, which must have the same type.
    pub fn extend_from(&mut self, other: &Self) -> Result<(), ExecutionError> {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.extend_from_slice(b),
            (Self::Int(a), Self::Int(b)) => a.extend_from_slice(b),
            (Self::Float(a), Self::Float(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(ExecutionError::TypeMismatch {
                    context: "column append".to_string(),
                    expected: a.field_type(),
                    actual: b.field_type(),
                })
            }
        }
        Ok(())
    }

    /// Overwrites every row in place with `value`.
    pub fn fill(&mut self, value: Value) {
        let len = self.len();
        let ty = self.field_type();
        *self = Self::filled(value.cast(ty), len);
    }

    /// Overwrites every row in place with the rows of `src`, converting types.
    pub fn overwrite(&mut self, src: &Self) -> Result<(), ExecutionError> {
        if src.len() != self.len() {
            return Err(ExecutionError::precondition(format!(
                "cannot assign {} values to a column of length {}",
                src.len(),
                self.len()
            )));
        }
        let src = src.cast(self.field_type());
        match (self, &src) {
            (Self::Bool(a), Self::Bool(b)) => a.copy_from_slice(b),
            (Self::Int(a), Self::Int(b)) => a.copy_from_slice(b),
            (Self::Float(a), Self::Float(b)) => a.copy_from_slice(b),
            _ => {}
        }
        Ok(())
    }

    /// Scatters `values` into `rows`; negative rows (absent ids) are skipped.
    pub fn put(&mut self, rows: &[i64], values: &Self) -> Result<(), ExecutionError> {
        if rows.len() != values.len() {
            return Err(ExecutionError::precondition(format!(
                "{} rows given for {} values",
                rows.len(),
                values.len()
            )));
        }
        let len = self.len();
        let values = values.cast(self.field_type());
        for (i, row) in rows.iter().enumerate() {
            let Ok(row) = usize::try_from(*row) else {
                continue;
            };
            if row >= len {
                continue;
            }
            match (&mut *self, &values) {
                (Self::Bool(a), Self::Bool(b)) => a[row] = b[i],
                (Self::Int(a), Self::Int(b)) => a[row] = b[i],
                (Self::Float(a), Self::Float(b)) => a[row] = b[i],
                _ => {}
            }
        }
        Ok(())
    }
}

/// What a name resolves to inside a context.
///
/// Columns are reference counted: cloning a binding aliases the data, and a
/// writer goes through [`Arc::make_mut`], so readers holding an older alias
/// keep seeing the values they resolved.
#[derive(Debug, Clone)]
pub enum Binding {
    /// One value shared by every row.
    Scalar(Value),
    /// One value per row.
    Column(Arc<Column>),
    /// Read-only process-global state.
    Globals(Arc<Globals>),
}

impl Binding {
    /// Wraps a freshly computed column.
    #[must_use]
    pub fn column(column: Column) -> Self {
        Self::Column(Arc::new(column))
    }

    /// The scalar, if this is one.
    #[must_use]
    pub const fn as_scalar(&self) -> Option<Value> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// The column, if this is one.
    #[must_use]
    pub fn as_column(&self) -> Option<&Column> {
        match self {
            Self::Column(c) => Some(c),
            _ => None,
        }
    }

    /// The global state handle, if this is one.
    #[must_use]
    pub fn as_globals(&self) -> Option<&Arc<Globals>> {
        match self {
            Self::Globals(g) => Some(g),
            _ => None,
        }
    }

    /// True for per-row values, which follow row filtering and deletion.
    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self, Self::Column(_))
    }

    /// Number of rows for array bindings.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        self.as_column().map(Column::len)
    }

    /// Approximate memory footprint of array bindings.
    #[must_use]
    pub fn nbytes(&self) -> usize {
        self.as_column().map_or(0, Column::nbytes)
    }

    /// Loop-condition truthiness: an empty or all-false column is false.
    pub fn is_truthy(&self) -> Result<bool, ExecutionError> {
        match self {
            Self::Scalar(v) => Ok(v.is_truthy()),
            Self::Column(c) => Ok(c.any_truthy()),
            Self::Globals(_) => Err(ExecutionError::ConditionNotEvaluable {
                reason: "condition evaluated to the global state handle".to_string(),
            }),
        }
    }
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Self::Scalar(value)
    }
}

impl From<Column> for Binding {
    fn from(column: Column) -> Self {
        Self::column(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_values_are_type_appropriate() {
        assert_eq!(FieldType::Int.missing_value(), Value::Int(-1));
        assert_eq!(FieldType::Bool.missing_value(), Value::Bool(false));
        assert!(FieldType::Float.missing_value().as_float().unwrap().is_nan());
    }

    #[test]
    fn test_filter_rejects_wrong_mask_length() {
        let col = Column::Int(vec![1, 2, 3]);
        let err = col.filter(&[true, false]).unwrap_err();
        assert!(err.to_string().contains("boolean index has length 2 instead of 3"));
        assert_eq!(col.filter(&[true, false, true]).unwrap(), Column::Int(vec![1, 3]));
    }

    #[test]
    fn test_put_skips_absent_rows() {
        let mut col = Column::missing(FieldType::Int, 3);
        col.put(&[2, -1, 0], &Column::Int(vec![20, 99, 10])).unwrap();
        assert_eq!(col, Column::Int(vec![10, -1, 20]));
    }

    #[test]
    fn test_overwrite_casts_and_checks_length() {
        let mut col = Column::Int(vec![1, 2]);
        col.overwrite(&Column::Float(vec![3.7, 4.2])).unwrap();
        assert_eq!(col, Column::Int(vec![3, 4]));
        assert!(col.overwrite(&Column::Int(vec![1])).is_err());
    }

    #[test]
    fn test_nan_survives_json() {
        let col = Column::Float(vec![1.5, f64::NAN]);
        let json = serde_json::to_vec(&col).unwrap();
        let back: Column = serde_json::from_slice(&json).unwrap();
        let floats = back.as_floats().unwrap();
        assert!((floats[0] - 1.5).abs() < f64::EPSILON);
        assert!(floats[1].is_nan());
    }

    #[test]
    fn test_column_truthiness() {
        assert!(!Binding::column(Column::Bool(vec![])).is_truthy().unwrap());
        assert!(!Binding::column(Column::Int(vec![0, 0])).is_truthy().unwrap());
        assert!(Binding::column(Column::Bool(vec![false, true])).is_truthy().unwrap());
        assert!(!Binding::Scalar(Value::Int(0)).is_truthy().unwrap());
    }
}
