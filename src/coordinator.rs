//! Period cycle orchestration.
//!
//! An [`EntityCoordinator`] runs the fixed per-period cycle of one entity:
//!
//! 1. capture the lag cache from the live array
//! 2. merge the input rows of the period into the live array
//! 3. make the period live and run the processes
//! 4. clear every transient
//! 5. append the live array to the output store and persist its id index
//!
//! A [`Simulation`] drives the coordinators of every entity, period after
//! period.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SimulationConfig;
use crate::error::{ExecutionError, SchemaError, SimResult};
use crate::globals::Globals;
use crate::period::Period;
use crate::process::{Evaluator, Executor, Expression, ProcessGraph};
use crate::schema::EntityRegistry;
use crate::snapshot::EntitySnapshot;
use crate::storage::RowWindow;

/// The snapshot and process graph of one entity.
#[derive(Debug)]
pub struct EntityCoordinator<E> {
    snapshot: EntitySnapshot,
    graph: ProcessGraph<E>,
}

impl<E: Expression> EntityCoordinator<E> {
    /// Binds `graph` to `snapshot`, declaring the graph's lag fields.
    pub fn new(mut snapshot: EntitySnapshot, graph: ProcessGraph<E>) -> SimResult<Self> {
        let lag_fields = graph.lag_fields(snapshot.schema())?;
        snapshot.set_lag_fields(lag_fields)?;
        Ok(Self { snapshot, graph })
    }

    /// Name of the coordinated entity.
    #[must_use]
    pub fn name(&self) -> &str {
        self.snapshot.name()
    }

    /// The entity's snapshot.
    #[must_use]
    pub const fn snapshot(&self) -> &EntitySnapshot {
        &self.snapshot
    }

    /// Mutable access to the snapshot, e.g. to seed history by hand.
    pub fn snapshot_mut(&mut self) -> &mut EntitySnapshot {
        &mut self.snapshot
    }

    /// The compiled processes of the entity.
    #[must_use]
    pub const fn graph(&self) -> &ProcessGraph<E> {
        &self.graph
    }

    /// Steps 1 to 3 before any process runs: lag capture, input merge and
    /// live period switch.
    pub fn begin_period(&mut self, period: Period) -> SimResult<()> {
        self.snapshot.load_period_data(period)?;
        self.snapshot.set_live_period(period)
    }

    /// Runs the top-level process `name`.
    pub fn run_process(
        &mut self,
        evaluator: &dyn Evaluator<E>,
        globals: &Arc<Globals>,
        name: &str,
    ) -> SimResult<()> {
        let executor = Executor::new(&self.graph, evaluator, Arc::clone(globals), &self.snapshot);
        executor.run(&mut self.snapshot, name)
    }

    /// Runs every top-level process in declaration order.
    pub fn run_all(&mut self, evaluator: &dyn Evaluator<E>, globals: &Arc<Globals>) -> SimResult<()> {
        let executor = Executor::new(&self.graph, evaluator, Arc::clone(globals), &self.snapshot);
        executor.run_all(&mut self.snapshot)
    }

    /// Steps 4 and 5: clear transients, append and flush.
    pub fn end_period(&mut self, period: Period) -> SimResult<RowWindow> {
        self.snapshot.store_period_data(period)
    }

    /// The whole cycle for one period, running `processes` (every top-level
    /// process when `None`).
    pub fn run_period(
        &mut self,
        period: Period,
        evaluator: &dyn Evaluator<E>,
        globals: &Arc<Globals>,
        processes: Option<&[String]>,
    ) -> SimResult<RowWindow> {
        self.begin_period(period)?;
        match processes {
            Some(names) => {
                for name in names {
                    self.run_process(evaluator, globals, name)?;
                }
            }
            None => self.run_all(evaluator, globals)?,
        }
        self.end_period(period)
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Simulated periods, in order.
    pub periods: Vec<Period>,
    /// Rows stored per entity for the last simulated period.
    pub rows: BTreeMap<String, u64>,
    /// Wall-clock time of the whole run.
    pub elapsed: Duration,
}

/// All entities of a run with the process-global state and evaluator.
pub struct Simulation<E> {
    config: SimulationConfig,
    globals: Arc<Globals>,
    evaluator: Box<dyn Evaluator<E>>,
    entities: Vec<EntityCoordinator<E>>,
}

impl<E: Expression> Simulation<E> {
    /// A simulation without entities.
    #[must_use]
    pub fn new(config: SimulationConfig, globals: Globals, evaluator: Box<dyn Evaluator<E>>) -> Self {
        Self {
            config,
            globals: Arc::new(globals),
            evaluator,
            entities: Vec::new(),
        }
    }

    /// Adds an entity; entities are cycled in the order they were added.
    pub fn add_entity(&mut self, coordinator: EntityCoordinator<E>) {
        self.entities.push(coordinator);
    }

    /// The coordinator of entity `name`.
    #[must_use]
    pub fn entity(&self, name: &str) -> Option<&EntityCoordinator<E>> {
        self.entities.iter().find(|e| e.name() == name)
    }

    /// Coordinators in the order they were added.
    pub fn entities(&self) -> impl Iterator<Item = &EntityCoordinator<E>> {
        self.entities.iter()
    }

    /// The run configuration.
    #[must_use]
    pub const fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// The shared global state.
    #[must_use]
    pub fn globals(&self) -> &Arc<Globals> {
        &self.globals
    }

    /// The schemas of every added entity.
    #[must_use]
    pub fn registry(&self) -> EntityRegistry {
        let mut registry = EntityRegistry::new();
        for coordinator in &self.entities {
            registry.insert(Arc::clone(coordinator.snapshot().schema()));
        }
        registry
    }

    /// Checks that every schedule entry names a known entity and process.
    fn check_schedule(&self) -> SimResult<()> {
        for entry in &self.config.schedule {
            let coordinator = self.entity(&entry.entity).ok_or_else(|| SchemaError::UnknownEntity {
                entity: entry.entity.clone(),
            })?;
            if coordinator.graph().get(&entry.process).is_none() {
                return Err(ExecutionError::UnknownProcess {
                    entity: entry.entity.clone(),
                    name: entry.process.clone(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Seeds history, then runs every configured period.
    ///
    /// Links and schedule entries are checked before anything runs.
    pub fn run(&mut self) -> SimResult<RunSummary> {
        self.registry().check_links()?;
        self.check_schedule()?;
        let started = Instant::now();
        let start = self.config.start_period;

        for coordinator in &mut self.entities {
            coordinator.snapshot_mut().seed_history(start)?;
        }

        let periods: Vec<Period> = self.config.simulated_periods().collect();
        let mut rows = BTreeMap::new();
        for &period in &periods {
            let period_started = Instant::now();
            for coordinator in &mut self.entities {
                coordinator.begin_period(period)?;
            }

            if self.config.schedule.is_empty() {
                for coordinator in &mut self.entities {
                    coordinator.run_all(self.evaluator.as_ref(), &self.globals)?;
                }
            } else {
                for entry in &self.config.schedule {
                    let Some(coordinator) =
                        self.entities.iter_mut().find(|e| e.name() == entry.entity)
                    else {
                        continue;
                    };
                    coordinator.run_process(self.evaluator.as_ref(), &self.globals, &entry.process)?;
                }
            }

            for coordinator in &mut self.entities {
                let window = coordinator.end_period(period)?;
                tracing::info!(
                    entity = %coordinator.name(),
                    %period,
                    rows = window.len(),
                    "stored period"
                );
                rows.insert(coordinator.name().to_string(), window.len());
            }
            tracing::info!(
                %period,
                elapsed_ms = u64::try_from(period_started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "simulated period"
            );
        }

        let summary = RunSummary {
            periods,
            rows,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            periods = summary.periods.len(),
            elapsed_ms = u64::try_from(summary.elapsed.as_millis()).unwrap_or(u64::MAX),
            "simulation done"
        );
        Ok(summary)
    }
}

impl<E> std::fmt::Debug for Simulation<E>
where
    E: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("entities", &self.entities)
            .finish_non_exhaustive()
    }
}
