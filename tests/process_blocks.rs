//! End-to-end process blocks: sequential and ambiguous fibers over
//! coordination primitives.

use std::sync::mpsc;
use std::time::Duration;

use freshet::fiber::ap;
use freshet::test_utils::init_test_logging;
use freshet::{
    aggregate, enumerate, park, relieve, sleep, sp, Dataflow, Flow, Mailbox, Rendezvous,
};

#[test]
fn sequential_processes_coordinate_through_a_mailbox() {
    init_test_logging();
    let mbx = Mailbox::new();
    let answer = Dataflow::new();

    let consumer = sp({
        let mbx = mbx.clone();
        let answer = answer.clone();
        async move {
            let mut total = 0;
            loop {
                let v = park(mbx.fetch()).await?;
                if v == 0 {
                    break;
                }
                total += v;
            }
            answer.assign(total);
            Ok(())
        }
    });
    let producer = sp({
        let mbx = mbx.clone();
        async move {
            for v in [3, 4, 5, 0] {
                park(sleep(Duration::from_millis(5), ())).await?;
                mbx.post(v);
            }
            Ok(())
        }
    });
    freshet::join(|_: Vec<()>| (), vec![consumer, producer])
        .block_on()
        .unwrap();
    assert_eq!(answer.deref().block_on().unwrap(), 12);
}

#[test]
fn rendezvous_hands_off_between_processes() {
    init_test_logging();
    let rdv = Rendezvous::new();
    let giver = sp({
        let rdv = rdv.clone();
        async move {
            park(rdv.give("payload")).await?;
            Ok("gave")
        }
    });
    let taker = sp({
        let rdv = rdv.clone();
        async move {
            park(sleep(Duration::from_millis(20), ())).await?;
            park(rdv.take()).await
        }
    });
    let out = freshet::join(|vs| vs.join("+"), vec![giver, taker])
        .block_on()
        .unwrap();
    assert_eq!(out, "gave+payload");
}

/// The relieve scenario: a concat process emits after per-value sleeps,
/// the consumer lags 80 ms per transfer, and overflow sums up.
#[test]
fn relieved_process_output_sums_overflow() {
    init_test_logging();
    let produced = ap::concat(enumerate(vec![24u64, 79, 67, 34, 18, 9, 99, 37]), |x| {
        Flow::once(sp(async move {
            park(sleep(Duration::from_millis(x), x)).await
        }))
    });
    let relieved = relieve(|a, b| a + b, produced);

    let (value_tx, value_rx) = mpsc::channel();
    let (event_tx, event_rx) = mpsc::channel();
    let handle = std::sync::Arc::new(relieved.subscribe(
        {
            let event_tx = event_tx.clone();
            move || event_tx.send("ready").unwrap()
        },
        move || event_tx.send("done").unwrap(),
    ));
    let consumer = std::thread::spawn(move || {
        while let Ok(event) = event_rx.recv() {
            if event == "done" {
                break;
            }
            let v = handle.transfer().unwrap();
            value_tx.send(v).unwrap();
            std::thread::sleep(Duration::from_millis(80));
        }
    });
    consumer.join().unwrap();
    let collected: Vec<u64> = value_rx.iter().collect();
    assert_eq!(collected, vec![24, 79, 67, 34 + 18 + 9, 99, 37]);
}

#[test]
fn gather_forks_run_concurrently_and_backpressure_downstream() {
    init_test_logging();
    let started = std::time::Instant::now();
    let mut out = aggregate(
        |mut acc: Vec<u64>, v| {
            acc.push(v);
            Ok(acc)
        },
        Vec::new(),
        ap::gather(enumerate(vec![60u64, 40, 20]), |ms| {
            Flow::once(sp(async move {
                park(sleep(Duration::from_millis(ms), ms)).await
            }))
        }),
    )
    .block_on()
    .unwrap();
    // All forks ran concurrently.
    assert!(started.elapsed() < Duration::from_millis(150));
    out.sort_unstable();
    assert_eq!(out, vec![20, 40, 60]);
}

#[test]
fn switch_only_latest_fork_contributes() {
    init_test_logging();
    let out = aggregate(
        |mut acc: Vec<u64>, v| {
            acc.push(v);
            Ok(acc)
        },
        Vec::new(),
        ap::switch(enumerate(vec![1u64, 2, 3]), |x| {
            Flow::once(sp(async move {
                park(sleep(Duration::from_millis(40), x * 100)).await
            }))
        }),
    )
    .block_on()
    .unwrap();
    assert_eq!(out, vec![300]);
}

#[test]
fn cancelled_process_releases_its_awaited_task() {
    init_test_logging();
    let (tx, rx) = mpsc::channel();
    let task = sp(async {
        park(sleep(Duration::from_secs(60), ())).await?;
        Ok(())
    });
    let cancel = task.subscribe(
        |()| panic!("cancelled process must not complete"),
        move |e| tx.send(e).unwrap(),
    );
    cancel.cancel();
    assert!(rx
        .recv_timeout(Duration::from_secs(1))
        .unwrap()
        .is_cancelled());
}
