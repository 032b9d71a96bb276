use std::sync::Arc;

use futures::StreamExt;
use thetaflow_core::{
    CollectingFaultSink, ComparisonOperator, ComparisonPredicate, DataType, DeployedJoin,
    Filter, FnPredicate, JoinConfig, JoinPredicate, JoinStatus, JoinSummary, JoinWindow,
    MatrixAssignment, Projection, Row, ScalarValue, Side, SpillLocation, ThetaJoin, row,
};
use thetaflow_core::storage::kv::{KvFactory, OrderedKv};
use thetaflow_error::{ErrorKind, FlowError, Result};

enum Event {
    Tuple(Side, Row, u64),
    Remap(MatrixAssignment),
}

fn config(workers: usize) -> JoinConfig {
    JoinConfig {
        joiner_parallelism: workers,
        ..Default::default()
    }
}

/// Interleave `ratio` left tuples per right tuple. Ingest times increase by
/// one per tuple.
fn interleave(left: Vec<Row>, right: Vec<Row>, ratio: usize) -> Vec<Event> {
    let mut events = Vec::new();
    let mut left = left.into_iter();
    let mut right = right.into_iter();
    let mut ts = 0;
    loop {
        let mut progressed = false;
        for row in left.by_ref().take(ratio) {
            events.push(Event::Tuple(Side::Left, row, ts));
            ts += 1;
            progressed = true;
        }
        if let Some(row) = right.next() {
            events.push(Event::Tuple(Side::Right, row, ts));
            ts += 1;
            progressed = true;
        }
        if !progressed {
            return events;
        }
    }
}

fn keyed_rows(count: i64, modulo: i64, tag: &str) -> Vec<Row> {
    (0..count).map(|i| row![i % modulo, format!("{tag}{i}")]).collect()
}

/// Expected pairs computed with a nested loop.
fn nested_loop(predicate: &dyn JoinPredicate, window: JoinWindow, events: &[Event]) -> Vec<String> {
    let tuples = |side: Side| {
        events
            .iter()
            .filter_map(move |e| match e {
                Event::Tuple(s, row, ts) if *s == side => Some((row, *ts)),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    let (left, right) = (tuples(Side::Left), tuples(Side::Right));

    let mut pairs = Vec::new();
    for (l, lts) in &left {
        for (r, rts) in &right {
            if window.admits(*lts, *rts) && predicate.matches(l, r).unwrap_or(false) {
                pairs.push(format!("{l}|{r}"));
            }
        }
    }
    pairs.sort();
    pairs
}

async fn run(
    join: ThetaJoin,
    assignment: MatrixAssignment,
    events: Vec<Event>,
) -> (Vec<String>, JoinSummary) {
    let DeployedJoin {
        input,
        output,
        control,
        completion,
        ..
    } = join.deploy_with_assignment(assignment).unwrap();

    let collector = tokio::spawn(output.collect_all());
    for event in events {
        match event {
            Event::Tuple(side, row, ts) => input.send_at(side, row, ts).await.unwrap(),
            Event::Remap(assignment) => control.remap(assignment).unwrap(),
        }
    }
    input.finish();

    let summary = completion.wait().await.unwrap();
    let mut pairs: Vec<_> = collector
        .await
        .unwrap()
        .into_iter()
        .map(|m| format!("{}|{}", m.left, m.right))
        .collect();
    pairs.sort();

    (pairs, summary)
}

fn eq_predicate() -> ComparisonPredicate {
    ComparisonPredicate::new(0, ComparisonOperator::Eq, 0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn equi_join_matches_nested_loop() {
    logutil::init_test();

    let events = interleave(keyed_rows(200, 13, "l"), keyed_rows(150, 13, "r"), 1);
    let expected = nested_loop(&eq_predicate(), JoinWindow::Unbounded, &events);

    let join = ThetaJoin::new(config(4), eq_predicate());
    let assignment = MatrixAssignment::compute(200, 150, 4).unwrap();
    let (pairs, summary) = run(join, assignment, events).await;

    assert_eq!(expected, pairs);
    assert_eq!(JoinStatus::Completed, summary.status);
    assert_eq!(expected.len() as u64, summary.matches);
    assert_eq!(200, summary.left_tuples);
    assert_eq!(150, summary.right_tuples);
    assert_eq!(0, summary.remaps);
    assert_eq!(0, summary.faults);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inequality_and_band_joins() {
    logutil::init_test();

    let left: Vec<_> = (0..60_i64).map(|i| row![i * 3 % 50, format!("l{i}")]).collect();
    let right: Vec<_> = (0..40_i64).map(|i| row![i * 7 % 50, format!("r{i}")]).collect();

    let lt = ComparisonPredicate::new(0, ComparisonOperator::Lt, 0);
    let events = interleave(left.clone(), right.clone(), 2);
    let expected = nested_loop(&lt, JoinWindow::Unbounded, &events);
    let (pairs, _) = run(
        ThetaJoin::new(config(3), lt),
        MatrixAssignment::compute(60, 40, 3).unwrap(),
        events,
    )
    .await;
    assert_eq!(expected, pairs);

    let band = ComparisonPredicate::band(0, 0, 2);
    let events = interleave(left, right, 2);
    let expected = nested_loop(&band, JoinWindow::Unbounded, &events);
    let (pairs, _) = run(
        ThetaJoin::new(config(5), band),
        MatrixAssignment::compute(60, 40, 5).unwrap(),
        events,
    )
    .await;
    assert_eq!(expected, pairs);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reassign_preserves_results() {
    logutil::init_test();

    let initial = MatrixAssignment::try_from_owners(2, 2, 4, vec![0, 1, 2, 3]).unwrap();
    let swapped = MatrixAssignment::try_from_owners(2, 2, 4, vec![3, 2, 1, 0]).unwrap();

    let mut events = interleave(keyed_rows(100, 7, "l"), keyed_rows(100, 7, "r"), 1);
    let rest = events.split_off(100);
    events.push(Event::Remap(swapped));
    events.extend(rest);
    let expected = nested_loop(&eq_predicate(), JoinWindow::Unbounded, &events);

    let (pairs, summary) = run(ThetaJoin::new(config(4), eq_predicate()), initial, events).await;

    assert_eq!(expected, pairs);
    assert_eq!(1, summary.remaps);
    assert!(summary.epochs >= 2);
    let exported: u64 = summary.workers.iter().map(|w| w.exported).sum();
    let imported: u64 = summary.workers.iter().map(|w| w.imported).sum();
    assert_eq!(exported, imported);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repartition_preserves_results() {
    logutil::init_test();

    let initial = MatrixAssignment::compute(100, 100, 4).unwrap();
    assert_eq!((2, 2), (initial.rows(), initial.cols()));
    let wide = MatrixAssignment::compute(1, 1000, 4).unwrap();
    let tall = MatrixAssignment::compute(1000, 1, 4).unwrap();
    assert!(!wide.same_shape(&initial));
    assert!(!tall.same_shape(&wide));

    let mut events = interleave(keyed_rows(150, 11, "l"), keyed_rows(150, 11, "r"), 1);
    let third = events.split_off(200);
    let second = events.split_off(100);
    events.push(Event::Remap(wide));
    events.extend(second);
    // Queued behind the first remap until its migration settles.
    events.push(Event::Remap(tall));
    events.extend(third);
    let expected = nested_loop(&eq_predicate(), JoinWindow::Unbounded, &events);

    let (pairs, summary) = run(ThetaJoin::new(config(4), eq_predicate()), initial, events).await;

    assert_eq!(expected, pairs);
    assert!(summary.remaps >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rescaling_uses_standby_joiners() {
    logutil::init_test();

    let initial = MatrixAssignment::compute(100, 100, 2).unwrap();
    let grown = MatrixAssignment::compute(100, 100, 4).unwrap();
    let shrunk = MatrixAssignment::compute(100, 100, 3).unwrap();

    let mut events = interleave(keyed_rows(150, 11, "l"), keyed_rows(150, 11, "r"), 1);
    let third = events.split_off(200);
    let second = events.split_off(100);
    events.push(Event::Remap(grown));
    events.extend(second);
    events.push(Event::Remap(shrunk));
    events.extend(third);
    let expected = nested_loop(&eq_predicate(), JoinWindow::Unbounded, &events);

    let join = ThetaJoin::new(
        JoinConfig {
            max_parallelism: 4,
            ..config(2)
        },
        eq_predicate(),
    );
    let (pairs, summary) = run(join, initial, events).await;

    assert_eq!(expected, pairs);
    assert!(summary.remaps >= 1);
    assert_eq!(4, summary.workers.len());
    // Growing to four workers hands cells to both standby joiners.
    assert!(summary.workers[2..].iter().all(|w| w.imported > 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn advisor_reshapes_skewed_input() {
    logutil::init_test();

    // Deployed expecting few left tuples, then fed mostly left tuples.
    let initial = MatrixAssignment::compute(1, 1000, 4).unwrap();
    let events = interleave(keyed_rows(1000, 17, "l"), keyed_rows(20, 17, "r"), 50);
    let expected = nested_loop(&eq_predicate(), JoinWindow::Unbounded, &events);

    let join = ThetaJoin::new(
        JoinConfig {
            epoch_tuples: 64,
            ..config(4)
        },
        eq_predicate(),
    );
    let (pairs, summary) = run(join, initial, events).await;

    assert_eq!(expected, pairs);
    assert!(summary.epochs > 1);
    assert!(summary.remaps >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interval_epochs_do_not_change_results() {
    logutil::init_test();

    let events = interleave(keyed_rows(300, 5, "l"), keyed_rows(300, 5, "r"), 1);
    let expected = nested_loop(&eq_predicate(), JoinWindow::Unbounded, &events);

    let join = ThetaJoin::new(
        JoinConfig {
            epoch_interval_ms: 1,
            batch_output_ms: 2,
            ..config(3)
        },
        eq_predicate(),
    );
    let (pairs, _) = run(join, MatrixAssignment::compute(300, 300, 3).unwrap(), events).await;

    assert_eq!(expected, pairs);
}

fn spill_predicate() -> ComparisonPredicate {
    ComparisonPredicate::new(0, ComparisonOperator::LtEq, 0)
        .with_key_datatype(DataType::Int64)
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spilled_join_matches_in_memory_join() {
    logutil::init_test();

    let left = keyed_rows(120, 20, "l");
    let right = keyed_rows(120, 20, "r");
    let expected = nested_loop(&spill_predicate(), JoinWindow::Unbounded, &interleave(left.clone(), right.clone(), 1));

    let dir = tempfile::tempdir().unwrap();
    for location in [SpillLocation::Memory, SpillLocation::Directory(dir.path().to_path_buf())] {
        let join = ThetaJoin::new(
            JoinConfig {
                spill_threshold: 4,
                spill_location: location,
                ..config(4)
            },
            spill_predicate(),
        );
        let events = interleave(left.clone(), right.clone(), 1);
        let (pairs, summary) = run(join, MatrixAssignment::compute(120, 120, 4).unwrap(), events).await;

        assert_eq!(expected, pairs);
        assert!(summary.spilled > 0);
    }

    // Spill files are removed once the joiners finish.
    assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spilled_state_migrates() {
    logutil::init_test();

    let initial = MatrixAssignment::compute(100, 100, 4).unwrap();
    let wide = MatrixAssignment::compute(1, 1000, 4).unwrap();

    let mut events = interleave(keyed_rows(100, 9, "l"), keyed_rows(100, 9, "r"), 1);
    let rest = events.split_off(120);
    events.push(Event::Remap(wide));
    events.extend(rest);
    let expected = nested_loop(&spill_predicate(), JoinWindow::Unbounded, &events);

    let join = ThetaJoin::new(
        JoinConfig {
            spill_threshold: 3,
            spill_location: SpillLocation::Memory,
            ..config(4)
        },
        spill_predicate(),
    );
    let (pairs, summary) = run(join, initial, events).await;

    assert_eq!(expected, pairs);
    assert_eq!(1, summary.remaps);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn declared_key_type_coerces_parsed_rows() {
    logutil::init_test();

    let predicate = || {
        ComparisonPredicate::new(0, ComparisonOperator::Eq, 0)
            .with_key_datatype(DataType::Int32)
            .unwrap()
    };
    // Parsed CSV values are always Int64.
    let parse = |count: i64, tag: &str| -> Vec<Row> {
        (0..count)
            .map(|i| {
                Row::new([
                    ScalarValue::parse_inferred(&(i % 6).to_string()),
                    ScalarValue::Utf8(format!("{tag}{i}")),
                ])
            })
            .collect()
    };
    let mut left = parse(60, "l");
    let mut right = parse(60, "r");
    // Out of Int32 range, stays in memory and still joins.
    left.push(row![1_i64 << 40, "lbig"]);
    right.push(row![1_i64 << 40, "rbig"]);

    let events = interleave(left, right, 1);
    let expected = nested_loop(&predicate(), JoinWindow::Unbounded, &events);

    let join = ThetaJoin::new(
        JoinConfig {
            spill_threshold: 2,
            spill_location: SpillLocation::Memory,
            ..config(4)
        },
        predicate(),
    );
    let (pairs, summary) = run(join, MatrixAssignment::compute(61, 61, 4).unwrap(), events).await;

    assert_eq!(expected, pairs);
    assert!(summary.spilled > 0);
    assert!(pairs.iter().any(|p| p.contains("lbig") && p.contains("rbig")));
}

#[derive(Debug)]
struct FailingKv;

impl OrderedKv for FailingKv {
    fn get(&mut self, _key: i128) -> Result<Option<String>> {
        Ok(None)
    }

    fn put(&mut self, _key: i128, _value: String) -> Result<()> {
        Err(FlowError::storage("disk full"))
    }

    fn scan(&mut self, _low: i128, _high: i128) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn num_entries(&self) -> usize {
        0
    }
}

#[derive(Debug)]
struct FailingKvFactory;

impl KvFactory for FailingKvFactory {
    fn create(&self, _name: &str) -> Result<Box<dyn OrderedKv>> {
        Ok(Box::new(FailingKv))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn storage_failure_aborts_join() {
    logutil::init_test();

    let join = ThetaJoin::new(
        JoinConfig {
            spill_threshold: 2,
            spill_location: SpillLocation::Custom(Arc::new(FailingKvFactory)),
            ..config(2)
        },
        spill_predicate(),
    );
    let DeployedJoin {
        input,
        output,
        completion,
        ..
    } = join.deploy(100, 100).unwrap();
    let collector = tokio::spawn(output.collect_all());

    for event in interleave(keyed_rows(100, 10, "l"), keyed_rows(100, 10, "r"), 1) {
        if let Event::Tuple(side, row, ts) = event {
            // Input closes once the join aborted.
            if input.send_at(side, row, ts).await.is_err() {
                break;
            }
        }
    }
    input.finish();

    let err = completion.wait().await.unwrap_err();
    assert_eq!(ErrorKind::Storage, err.kind());
    // Output ends even though the join failed.
    collector.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn predicate_faults_skip_pairs() {
    logutil::init_test();

    let predicate = FnPredicate::new("fails_on_three", |l: &Row, r: &Row| {
        let l = l.column(0)?.try_as_i64()?;
        if l == 3 {
            return Err(FlowError::predicate("left key three"));
        }
        Ok(l == r.column(0)?.try_as_i64()?)
    });

    let events = interleave(keyed_rows(40, 8, "l"), keyed_rows(30, 8, "r"), 1);
    let expected = nested_loop(&predicate, JoinWindow::Unbounded, &events);
    let left_threes = (0..40).filter(|i| i % 8 == 3).count() as u64;

    let sink = Arc::new(CollectingFaultSink::default());
    let join = ThetaJoin::new(config(4), predicate).with_fault_sink(sink.clone());
    let (pairs, summary) = run(join, MatrixAssignment::compute(40, 30, 4).unwrap(), events).await;

    assert_eq!(expected, pairs);
    assert_eq!(left_threes * 30, summary.faults);
    let faults = sink.take();
    assert_eq!(summary.faults, faults.len() as u64);
    assert!(faults.iter().all(|f| f.error.kind() == ErrorKind::Predicate));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn windows_restrict_pairs() {
    logutil::init_test();

    for window in [
        JoinWindow::Sliding { range_ms: 10 },
        JoinWindow::Tumbling { size_ms: 16 },
    ] {
        let events = interleave(keyed_rows(80, 4, "l"), keyed_rows(80, 4, "r"), 1);
        let expected = nested_loop(&eq_predicate(), window, &events);
        let unwindowed = nested_loop(&eq_predicate(), JoinWindow::Unbounded, &events);
        assert!(expected.len() < unwindowed.len());

        let join = ThetaJoin::new(JoinConfig { window, ..config(3) }, eq_predicate());
        let (pairs, _) = run(join, MatrixAssignment::compute(80, 80, 3).unwrap(), events).await;
        assert_eq!(expected, pairs, "window: {window}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn operators_shape_output() {
    logutil::init_test();

    let join = ThetaJoin::new(config(2), eq_predicate())
        .with_operator(Filter::new(0, ComparisonOperator::GtEq, 2_i64))
        .with_operator(Projection::new([1, 3]));
    let DeployedJoin {
        input,
        mut output,
        completion,
        ..
    } = join.deploy(10, 10).unwrap();

    for i in 0..4_i64 {
        input.send(Side::Left, row![i, format!("l{i}")]).await.unwrap();
        input.send(Side::Right, row![i, format!("r{i}")]).await.unwrap();
    }
    input.finish();

    let mut rows = Vec::new();
    while let Some(m) = output.next().await {
        rows.push(m.row.to_string());
    }
    rows.sort();

    assert_eq!(vec!["l2,r2".to_string(), "l3,r3".to_string()], rows);
    // Matches count joined pairs that survived the chain.
    assert_eq!(2, completion.wait().await.unwrap().matches);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_stops_join() {
    logutil::init_test();

    let DeployedJoin {
        input,
        output,
        control,
        completion,
        ..
    } = ThetaJoin::new(config(2), eq_predicate()).deploy(10, 10).unwrap();

    for i in 0..10_i64 {
        input.send(Side::Left, row![i]).await.unwrap();
    }
    control.cancel();

    let summary = completion.wait().await.unwrap();
    assert_eq!(JoinStatus::Cancelled, summary.status);
    // Output ends once every joiner stopped.
    output.collect_all().await;

    // Input is closed once the reshuffler stopped.
    input.send(Side::Right, row![1]).await.unwrap_err();
}

#[tokio::test]
async fn invalid_deployments_rejected() {
    let err = ThetaJoin::new(config(0), eq_predicate())
        .deploy(10, 10)
        .unwrap_err();
    assert_eq!(ErrorKind::Configuration, err.kind());

    let err = ThetaJoin::new(config(2), eq_predicate())
        .deploy(0, 10)
        .unwrap_err();
    assert_eq!(ErrorKind::Configuration, err.kind());

    let err = ThetaJoin::new(config(3), eq_predicate())
        .deploy_with_assignment(MatrixAssignment::compute(10, 10, 4).unwrap())
        .unwrap_err();
    assert_eq!(ErrorKind::Configuration, err.kind());

    let deployed = ThetaJoin::new(config(2), eq_predicate()).deploy(10, 10).unwrap();
    let err = deployed
        .control
        .remap(MatrixAssignment::compute(10, 10, 3).unwrap())
        .unwrap_err();
    assert_eq!(ErrorKind::Configuration, err.kind());
    let err = deployed.control.rescale(3, 10, 10).unwrap_err();
    assert_eq!(ErrorKind::Configuration, err.kind());
    assert_eq!(2, deployed.control.max_workers());

    deployed.input.finish();
    let summary = deployed.completion.wait().await.unwrap();
    assert_eq!(0, summary.matches);
}
