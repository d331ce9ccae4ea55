//! End-to-end task combinator behavior over real time.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use freshet::test_utils::init_test_logging;
use freshet::{absolve, attempt, join, race, sleep, timeout, Error, ErrorKind, Task};

#[test]
fn join_combines_concurrent_sleeps() {
    init_test_logging();
    let started = Instant::now();
    let out = join(
        |vs| vs,
        vec![
            sleep(Duration::from_millis(100), 1),
            sleep(Duration::from_millis(100), 2),
        ],
    )
    .block_on()
    .unwrap();
    let elapsed = started.elapsed();
    assert_eq!(out, vec![1, 2]);
    assert!(elapsed >= Duration::from_millis(100));
    // Concurrent, not sequential.
    assert!(elapsed < Duration::from_millis(190), "took {elapsed:?}");
}

#[test]
fn race_first_success_wins_and_loser_is_cancelled() {
    init_test_logging();
    let (tx, rx) = mpsc::channel();
    let loser = Task::new({
        let tx = tx.clone();
        move |_s, on_failure: freshet::task::OnFailure| {
            freshet::Cancel::new(move || {
                tx.send(()).unwrap();
                on_failure(Error::cancelled());
            })
        }
    });
    let started = Instant::now();
    let winner = race(vec![sleep(Duration::from_millis(100), "a"), loser])
        .block_on()
        .unwrap();
    assert_eq!(winner, "a");
    assert!(started.elapsed() >= Duration::from_millis(100));
    // The 200 ms candidate observed cancellation.
    rx.recv_timeout(Duration::from_secs(1)).unwrap();
}

#[test]
fn race_of_sleeps_resolves_to_the_shorter() {
    init_test_logging();
    let out = race(vec![
        sleep(Duration::from_millis(100), "a"),
        sleep(Duration::from_millis(200), "b"),
    ])
    .block_on()
    .unwrap();
    assert_eq!(out, "a");
}

#[test]
fn timeout_returns_value_within_deadline() {
    init_test_logging();
    let out = timeout(
        Duration::from_millis(500),
        sleep(Duration::from_millis(20), 7),
    )
    .block_on()
    .unwrap();
    assert_eq!(out, 7);
}

#[test]
fn timeout_fails_with_configured_duration() {
    init_test_logging();
    let err = timeout(
        Duration::from_millis(50),
        sleep(Duration::from_secs(60), ()),
    )
    .block_on()
    .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.duration(), Some(Duration::from_millis(50)));
}

#[test]
fn attempt_absolve_round_trips() {
    init_test_logging();
    // absolve . attempt = identity on tasks.
    assert_eq!(
        absolve(attempt(sleep(Duration::from_millis(10), 5)))
            .block_on()
            .unwrap(),
        5
    );
    let err = absolve(attempt(Task::<i32>::fail(Error::msg("kept"))))
        .block_on()
        .unwrap_err();
    assert_eq!(err.to_string(), "user error: kept");
}

#[test]
fn join_first_failure_cancels_the_rest() {
    init_test_logging();
    let (tx, rx) = mpsc::channel();
    let slow = Task::new({
        move |_s, on_failure: freshet::task::OnFailure| {
            freshet::Cancel::new(move || {
                tx.send(()).unwrap();
                on_failure(Error::cancelled());
            })
        }
    });
    let failing = freshet::sp(async {
        freshet::park(sleep(Duration::from_millis(20), ())).await?;
        Err::<i32, _>(Error::msg("deliberate"))
    });
    let err = join(|vs| vs, vec![slow, failing]).block_on().unwrap_err();
    assert_eq!(err.to_string(), "user error: deliberate");
    rx.recv_timeout(Duration::from_secs(1)).unwrap();
}

#[test]
fn race_aggregates_when_everyone_fails() {
    init_test_logging();
    let err = race(vec![
        Task::<i32>::fail(Error::msg("one")),
        Task::<i32>::fail(Error::msg("two")),
    ])
    .block_on()
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RaceFailure);
    assert_eq!(err.children().len(), 2);
}
