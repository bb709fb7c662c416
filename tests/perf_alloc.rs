use std::alloc::System;
use std::hint::black_box;

use hpxdash::parser::{CounterSample, CounterValue, LineClassifier, TaskEvent};
use hpxdash::store::{GrowthBuffer, InstanceId, Run, SeriesInstance};
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

const HISTORY: usize = 50_000;
const COUNTER: &str = "threads/count/instantaneous/active";

/// Counts `(allocations + reallocations, deallocations)` made by `f`.
fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = (used.allocations + used.reallocations)
        .saturating_sub(idle.allocations + idle.reallocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn sample(seq: u64) -> CounterSample {
    CounterSample {
        counter_name: COUNTER.to_string(),
        instance: "locality#0/total".to_string(),
        parameters: None,
        sequence_number: seq,
        timestamp: seq as f64 * 0.01,
        timestamp_unit: "[s]".to_string(),
        value: CounterValue::Number(seq as f64),
        value_unit: None,
    }
}

fn task(i: usize) -> TaskEvent {
    TaskEvent {
        locality: "0".to_string(),
        worker_id: (i % 4).to_string(),
        task_name: "myfunc".to_string(),
        start: i as f64,
        end: i as f64 + 0.5,
    }
}

fn build_long_run() -> Run {
    let mut run = Run::new(0, 0.0);
    for i in 0..HISTORY {
        run.add_sample(&sample(i as u64));
        run.add_task(&task(i));
    }
    run
}

fn total_instance() -> SeriesInstance {
    SeriesInstance::Addressed(InstanceId::new("0", None::<&str>, "total"))
}

#[test]
#[serial]
fn series_suffix_query_allocates_zero() {
    let run = build_long_run();
    let instance = total_instance();

    let (len, allocations, deallocations) = measure_alloc_counts(|| {
        let suffix = run.get_series(COUNTER, &instance, HISTORY - 10);
        black_box(suffix.len())
    });

    assert_eq!(len, 10);
    assert!(
        allocations <= 1,
        "series suffix query allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 1,
        "series suffix query deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn task_suffix_query_allocates_zero() {
    let run = build_long_run();

    let (len, allocations, _deallocations) = measure_alloc_counts(|| {
        let suffix = run.get_task_events("0", "3", HISTORY / 4 - 5);
        black_box(suffix.len())
    });

    assert_eq!(len, 5);
    assert!(
        allocations <= 1,
        "task suffix query allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn numeric_view_suffix_allocates_zero() {
    let run = build_long_run();

    let (len, allocations, _deallocations) = measure_alloc_counts(|| {
        let rows = run.numeric().rows_from(HISTORY - 100);
        black_box(rows.len())
    });

    assert_eq!(len, 100);
    assert!(
        allocations <= 1,
        "numeric view suffix allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn growth_buffer_appends_reallocate_logarithmically() {
    let mut buffer: GrowthBuffer<u64> = GrowthBuffer::new();

    let (_, allocations, _deallocations) = measure_alloc_counts(|| {
        for i in 0..HISTORY as u64 {
            buffer.push(i);
        }
    });

    assert_eq!(buffer.len(), HISTORY);
    // 100 -> 51_200 takes 9 doublings.
    assert!(
        allocations <= 12,
        "growth buffer append allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn classify_program_output_allocation_budget() {
    let mut classifier = LineClassifier::new();
    let line = "iteration 42 finished, residual 1e-9";

    let (_, allocations, _deallocations) = measure_alloc_counts(|| {
        for _ in 0..256 {
            black_box(classifier.classify(black_box(line)));
        }
    });

    // One owned copy of the line per classification.
    assert!(
        allocations <= 256 * 2,
        "program output classification allocation budget exceeded: {}",
        allocations
    );
}
