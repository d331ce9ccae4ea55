//! End-to-end flow pipelines: sources, transducers, and combiners.

use std::time::Duration;

use freshet::flow::watch::{watch, Ref};
use freshet::test_utils::init_test_logging;
use freshet::transducer::{compose, filter, flat_map, partition_all};
use freshet::{aggregate, enumerate, gather, integrate, transform, zip, Error};

fn collect<T: Send + 'static>(flow: freshet::Flow<T>) -> Vec<T> {
    aggregate(
        |mut acc: Vec<T>, v| {
            acc.push(v);
            Ok(acc)
        },
        Vec::new(),
        flow,
    )
    .block_on()
    .unwrap()
}

#[test]
fn aggregate_sums_an_enumeration() {
    init_test_logging();
    let total = aggregate(|acc, v| Ok(acc + v), 0, enumerate(vec![1, 2, 3, 4, 5]))
        .block_on()
        .unwrap();
    assert_eq!(total, 15);
}

#[test]
fn transducer_pipeline_produces_expected_partitions() {
    init_test_logging();
    let xf = compose(
        compose(filter(|x: &i32| x % 2 == 1), flat_map(|x: i32| 0..x)),
        partition_all(4),
    );
    let out = collect(transform(xf, enumerate(0..10)));
    assert_eq!(
        out,
        vec![
            vec![0, 0, 1, 2],
            vec![0, 1, 2, 3],
            vec![4, 0, 1, 2],
            vec![3, 4, 5, 6],
            vec![0, 1, 2, 3],
            vec![4, 5, 6, 7],
            vec![8],
        ]
    );
}

#[test]
fn zip_truncates_to_the_shorter_flow() {
    init_test_logging();
    let out = collect(zip(
        |vs| (vs[0], vs[1]),
        vec![enumerate(vec![1, 2, 3, 4]), enumerate(vec![10, 20])],
    ));
    assert_eq!(out, vec![(1, 10), (2, 20)]);
}

#[test]
fn integrate_emits_running_reductions() {
    init_test_logging();
    let out = collect(integrate(
        |acc, v| Ok(acc + v),
        0,
        enumerate(vec![1, 2, 3, 4, 5]),
    ));
    assert_eq!(out, vec![0, 1, 3, 6, 10, 15]);
}

#[test]
fn gather_drains_every_source() {
    init_test_logging();
    let mut out = collect(gather(vec![
        enumerate(vec![1, 3, 5]),
        enumerate(vec![2, 4, 6]),
    ]));
    out.sort_unstable();
    assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn aggregate_rf_error_surfaces_and_cancels() {
    init_test_logging();
    let err = aggregate(
        |acc: i32, v: i32| {
            if v > 2 {
                Err(Error::msg("too big"))
            } else {
                Ok(acc + v)
            }
        },
        0,
        enumerate(0..),
    )
    .block_on()
    .unwrap_err();
    assert_eq!(err.to_string(), "user error: too big");
}

#[test]
fn watch_driven_pipeline_sees_mutations() {
    init_test_logging();
    let cell = Ref::new(0);
    let writer = cell.clone();
    let handle = std::thread::spawn(move || {
        for v in 1..=5 {
            std::thread::sleep(Duration::from_millis(20));
            writer.set(v);
        }
    });
    // Consume the watch flow until the value reaches 5.
    let flow = watch(cell);
    let last = aggregate(
        |_acc, v: i32| {
            if v >= 5 {
                Err(Error::msg("done"))
            } else {
                Ok(v)
            }
        },
        0,
        flow,
    )
    .block_on()
    .unwrap_err();
    assert_eq!(last.to_string(), "user error: done");
    handle.join().unwrap();
}
