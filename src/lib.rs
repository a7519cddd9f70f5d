//! # microsim - a period-stepped microsimulation core
//!
//! microsim advances a population of individuals (persons, households, ...)
//! one period at a time. Each entity keeps a columnar live array for the
//! period being simulated, reads its previous-period values from a lag
//! cache and every older period from an append-only output store.
//!
//! ## Core Concepts
//!
//! - **EntitySnapshot**: the live array, lag cache, transients and period
//!   windows of one entity
//! - **TemporalContext**: resolves a name for an entity at any period
//! - **ProcessGraph**: the compiled, declaration-ordered processes of one
//!   entity, run by an [`Executor`]
//! - **PeriodStore**: period-windowed columnar storage, in memory or on
//!   disk (`persistent` feature)
//! - **Simulation**: drives the fixed period cycle of every entity
//!
//! ## Usage
//!
//! ```rust,ignore
//! use microsim::{EntityCoordinator, EntitySnapshot, Globals, Period, ProcessGraph};
//! use microsim::{SchemaSource, Simulation, SimulationConfig};
//!
//! let mut snapshot = EntitySnapshot::new(SchemaSource::Schema(schema), Box::new(output))?;
//! snapshot.attach_input(Box::new(input))?;
//! let graph = ProcessGraph::build(snapshot.schema(), defs)?;
//!
//! let config = SimulationConfig::new(Period::new(2001), 10);
//! let mut sim = Simulation::new(config, Globals::new(), Box::new(evaluator));
//! sim.add_entity(EntityCoordinator::new(snapshot, graph)?);
//! let summary = sim.run()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod globals;
pub mod period;
pub mod process;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod table;
pub mod value;

// Re-export primary types at crate root for convenience
pub use config::{ConfigError, ScheduleEntry, SimulationConfig, StorageConfig};
pub use context::{delete, subset, Bindings, EvalContext, LocalContext, LookupSource, RowSelection, TemporalContext};
pub use coordinator::{EntityCoordinator, RunSummary, Simulation};
pub use error::{ExecutionError, SchemaError, SimError, SimResult};
pub use globals::{Globals, GLOBALS_KEY, LENGTH_KEY, NAN_KEY, PERIOD_KEY};
pub use period::Period;
pub use process::{
    Evaluator, Executor, Expression, Function, LagAccess, Node, Process, ProcessDef, ProcessGraph,
    ProcessGroup,
};
pub use schema::{EntityRegistry, EntitySchema, FieldDef, Link, LinkKind};
pub use snapshot::{EntitySnapshot, Fill, PeriodValue, SchemaSource};
pub use storage::{DiskIndex, InMemoryPeriodStore, IndexReader, IndexSlot, PeriodStore, RowWindow, StorageError};
pub use table::{ColumnTable, RowIndex};
pub use value::{Binding, Column, FieldType, Value};

#[cfg(feature = "persistent")]
pub use storage::persistent::{open_store, PersistentPeriodTable, PersistentStore};
