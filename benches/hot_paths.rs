use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use hpxdash::parser::{CounterSample, CounterValue, LineClassifier};
use hpxdash::store::Run;

const COUNTER_LINE: &str =
    "/threads{locality#0/pool#default/worker-thread#3}/count/cumulative,128,12.500000,[s],4096,[0.01%]";
const TASK_LINE: &str = "task_data,0,3,hpx::lcos::local::spinlock,12.4001,12.4017";
const PROGRAM_LINE: &str = "iteration 42 finished, residual 1.0e-9";

fn sample(seq: u64, worker: u64) -> CounterSample {
    CounterSample {
        counter_name: "threads/count/cumulative".to_string(),
        instance: format!("locality#0/pool#default/worker-thread#{worker}"),
        parameters: None,
        sequence_number: seq,
        timestamp: seq as f64 * 0.01,
        timestamp_unit: "[s]".to_string(),
        value: CounterValue::Number(seq as f64),
        value_unit: Some("[0.01%]".to_string()),
    }
}

fn bench_classify(c: &mut Criterion) {
    let mut classifier = LineClassifier::new();

    c.bench_function("classify/counter_sample", |b| {
        b.iter(|| classifier.classify(black_box(COUNTER_LINE)))
    });

    c.bench_function("classify/task_event", |b| {
        b.iter(|| classifier.classify(black_box(TASK_LINE)))
    });

    c.bench_function("classify/program_output", |b| {
        b.iter(|| classifier.classify(black_box(PROGRAM_LINE)))
    });
}

fn bench_store_append(c: &mut Criterion) {
    let samples: Vec<CounterSample> = (0..1_024u64).map(|i| sample(i, i % 16)).collect();

    c.bench_function("store/add_sample_1024", |b| {
        b.iter_batched(
            || Run::new(0, 0.0),
            |mut run| {
                for s in &samples {
                    run.add_sample(black_box(s));
                }
                black_box(run.series().len())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_classify(c);
    bench_store_append(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
