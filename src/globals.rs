//! Process-global, read-only state shared by every entity.
//!
//! Globals are loaded once per run (periodic tables, constant arrays) and are
//! only ever read by processes. Contexts hold them behind an `Arc` under the
//! reserved [`GLOBALS_KEY`] binding.

use std::collections::BTreeMap;

use crate::table::ColumnTable;

/// Binding name of the current period.
pub const PERIOD_KEY: &str = "period";

/// Binding name of the process-global state handle.
pub const GLOBALS_KEY: &str = "__globals__";

/// Binding name of the explicit row count of a detached context.
pub const LENGTH_KEY: &str = "__len__";

/// Binding name of the float NaN constant available to expressions.
pub const NAN_KEY: &str = "nan";

/// Named global tables.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    tables: BTreeMap<String, ColumnTable>,
}

impl Globals {
    /// No global tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a global table.
    #[must_use]
    pub fn with_table(mut self, name: impl Into<String>, table: ColumnTable) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// The global table `name`.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&ColumnTable> {
        self.tables.get(name)
    }

    /// Names of the global tables.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// True when no table is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
