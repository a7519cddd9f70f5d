use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use microsim::{
    Binding, Column, ColumnTable, EntityCoordinator, EntitySchema, EntitySnapshot, EvalContext,
    Evaluator, Expression, FieldDef, FieldType, Globals, InMemoryPeriodStore, LagAccess, Period,
    ProcessDef, ProcessGraph, SchemaSource, SimResult, Value,
};

const POPULATION: i64 = 10_000;

/// `name + 1` over an integer column.
#[derive(Debug, Clone)]
struct Increment(&'static str);

impl Expression for Increment {
    fn lag_accesses(&self) -> Vec<LagAccess> {
        Vec::new()
    }
}

struct Incrementer;

impl Evaluator<Increment> for Incrementer {
    fn evaluate(&self, expr: &Increment, ctx: &dyn EvalContext) -> SimResult<Binding> {
        let current = ctx.resolve(expr.0)?;
        let values = current
            .as_column()
            .and_then(Column::as_ints)
            .map(|v| v.iter().map(|x| x + 1).collect())
            .unwrap_or_default();
        Ok(Binding::column(Column::Int(values)))
    }
}

fn make_coordinator() -> EntityCoordinator<Increment> {
    let schema = Arc::new(
        EntitySchema::new(
            "person",
            vec![
                FieldDef::new("age", FieldType::Int),
                FieldDef::new("income", FieldType::Int),
            ],
            Vec::new(),
            Vec::new(),
        )
        .unwrap(),
    );
    let output = InMemoryPeriodStore::new("person", schema.fields().to_vec());
    let mut snapshot =
        EntitySnapshot::new(SchemaSource::Schema(Arc::clone(&schema)), Box::new(output)).unwrap();

    // Seed one period of POPULATION individuals.
    let input = ColumnTable::from_columns([
        ("period", Column::filled(Value::Int(2000), POPULATION as usize)),
        ("id", Column::Int((0..POPULATION).collect())),
        ("age", Column::Int((0..POPULATION).map(|i| i % 90).collect())),
        ("income", Column::Int((0..POPULATION).map(|i| i * 10).collect())),
    ])
    .unwrap();
    snapshot
        .attach_input(Box::new(
            InMemoryPeriodStore::from_table("person", &input).unwrap(),
        ))
        .unwrap();
    snapshot.seed_history(Period::new(2001)).unwrap();

    let graph = ProcessGraph::build(
        &schema,
        vec![
            (Some("age".to_string()), ProcessDef::Assign(Increment("age"))),
            (
                Some("income".to_string()),
                ProcessDef::Assign(Increment("income")),
            ),
        ],
    )
    .unwrap();
    EntityCoordinator::new(snapshot, graph).unwrap()
}

fn bench_period_cycle(c: &mut Criterion) {
    let globals = Arc::new(Globals::new());
    let mut group = c.benchmark_group("period_cycle");
    group.throughput(Throughput::Elements(POPULATION as u64));

    group.bench_function("run_period", |b| {
        b.iter_batched(
            make_coordinator,
            |mut coord| {
                coord
                    .run_period(Period::new(2001), &Incrementer, &globals, None)
                    .unwrap()
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("ten_periods", |b| {
        b.iter_batched(
            make_coordinator,
            |mut coord| {
                for period in Period::range(Period::new(2001), 10) {
                    coord
                        .run_period(period, &Incrementer, &globals, None)
                        .unwrap();
                }
                coord
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(period_cycle, bench_period_cycle);
criterion_main!(period_cycle);
