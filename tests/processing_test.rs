mod common;

use common::{state_dump, TestCluster};
use futures::future::join_all;
use raftstream::logstream::LogStreamReader;
use raftstream::engine::StreamClock;
use raftstream::protocol::{InstanceValue, JobValue, TimerValue};
use raftstream::state::{ExporterPositionState, InstanceState, InstanceStatus, JobState, TimerState};
use raftstream::{CommandRequest, CommandResponse, Intent, IngressError, Record, RecordValue, RejectionType};
use std::time::Duration;

fn create_instance(type_name: &str) -> CommandRequest {
    CommandRequest::new(
        Intent::Create,
        RecordValue::Instance(InstanceValue {
            type_name: type_name.into(),
            ..Default::default()
        }),
    )
}

fn complete_instance(key: i64) -> CommandRequest {
    CommandRequest::new(Intent::Complete, RecordValue::Instance(InstanceValue::default())).with_key(key)
}

/// Every committed record of the partition, in position order.
fn committed_log(cluster: &TestCluster, node_id: u64, partition_id: u32) -> Vec<Record> {
    let raft = cluster.broker(node_id).partition(partition_id).unwrap().raft().clone();
    let mut reader = LogStreamReader::new(raft.storage(), raft.subscribe_commit());
    reader.seek_after(-1).unwrap();
    let mut records = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        records.push(record);
    }
    records
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_create_with_explicit_key_yields_created_event() {
    let cluster = TestCluster::start(1, 1, 1).await;

    let response = cluster.submit(1, create_instance("Foo").with_key(7)).await;
    let CommandResponse::Event(event) = response else {
        panic!("expected an event, got {:?}", response);
    };
    assert_eq!(event.intent, Intent::Created);
    assert_eq!(event.key, 7);
    assert!(event.source_position > 0);

    let instance = InstanceState::get(&cluster.state(1, 1), 7).unwrap().unwrap();
    assert_eq!(instance.type_name, "Foo");
    assert_eq!(instance.status, InstanceStatus::Active);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejections_are_written_to_the_log_once_each() {
    let cluster = TestCluster::start(1, 1, 1).await;
    cluster.submit(1, create_instance("Foo")).await;
    let before_state = state_dump(&cluster.state(1, 1));
    let before_log = committed_log(&cluster, 1, 1).len();

    for _ in 0..2 {
        let response = cluster.submit(1, complete_instance(42)).await;
        let CommandResponse::Rejected(rejection) = response else {
            panic!("expected a rejection, got {:?}", response);
        };
        assert_eq!(rejection.rejection_type, Some(RejectionType::NotFound));
        assert_eq!(rejection.key, 42);
    }

    let log = committed_log(&cluster, 1, 1);
    let added = &log[before_log..];
    let commands: Vec<&Record> = added.iter().filter(|r| r.is_command()).collect();
    let rejections: Vec<&Record> = added.iter().filter(|r| r.is_rejection()).collect();
    assert_eq!(commands.len(), 2);
    assert_eq!(rejections.len(), 2);
    assert!(added.iter().all(|r| !r.is_event()));
    for (command, rejection) in commands.iter().zip(&rejections) {
        assert_eq!(rejection.source_position, command.position);
    }
    assert_eq!(state_dump(&cluster.state(1, 1)), before_state);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_log_positions_are_gap_free_and_traceable() {
    let cluster = TestCluster::start(1, 1, 1).await;
    let CommandResponse::Event(created) = cluster.submit(1, create_instance("Order")).await else {
        panic!("instance not created");
    };
    cluster
        .submit(
            1,
            CommandRequest::new(
                Intent::Create,
                RecordValue::Job(JobValue {
                    instance_key: created.key,
                    job_type: "ship".into(),
                    retries: 3,
                    ..Default::default()
                }),
            ),
        )
        .await;
    cluster.submit(1, complete_instance(created.key)).await;

    let log = committed_log(&cluster, 1, 1);
    for (i, record) in log.iter().enumerate() {
        assert_eq!(record.position, i as i64 + 1);
        if !record.is_command() {
            let source = &log[(record.source_position - 1) as usize];
            assert!(source.is_command(), "{:?} not caused by a command", record);
        }
    }

    let state = cluster.state(1, 1);
    assert_eq!(
        InstanceState::get(&state, created.key).unwrap().unwrap().status,
        InstanceStatus::Completed
    );
    assert!(JobState::of_instance(&state, created.key).unwrap().is_empty());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_commands_are_bounded() {
    let cluster = TestCluster::start_with(1, 1, 1, |config| {
        config.processing.max_in_flight_commands = 1;
    })
    .await;
    let leader = cluster.leader(1).await;

    let results = join_all((0..8).map(|i| leader.submit_command(1, create_instance(&format!("T{}", i))))).await;
    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(IngressError::Backpressure(1))))
        .count();
    assert!(accepted >= 1);
    assert!(refused >= 1);
    assert_eq!(accepted + refused, 8);

    assert!(matches!(
        leader.submit_command(9, create_instance("X")).await,
        Err(IngressError::UnknownPartition(9))
    ));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exporter_positions_are_persisted() {
    let cluster = TestCluster::start_with(1, 1, 1, |config| {
        config.exporters.ids = vec!["audit".into()];
    })
    .await;
    for name in ["A", "B"] {
        cluster.submit(1, create_instance(name)).await;
    }

    let deadline = tokio::time::Instant::now() + common::WAIT;
    let feed = loop {
        if let Ok(feed) = cluster.broker(1).exporter_feed(1) {
            break feed;
        }
        assert!(tokio::time::Instant::now() < deadline, "no exporter feed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    let mut records = Vec::new();
    while records.len() < 4 {
        assert!(tokio::time::Instant::now() < deadline, "exporter saw {} records", records.len());
        records = feed.poll("audit", 100).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(records[0].position, 1);
    assert!(records.windows(2).all(|w| w[1].position == w[0].position + 1));
    let last = records.last().unwrap().position;
    // unacknowledged records are handed out again
    assert_eq!(feed.poll("audit", 1).await.unwrap()[0].position, 1);
    feed.acknowledge("audit", last).await.unwrap();
    feed.flush().await.unwrap();

    let state = cluster.state(1, 1);
    while ExporterPositionState::get(&state, "audit").unwrap() != Some(last) {
        assert!(tokio::time::Instant::now() < deadline, "exporter position not persisted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(feed.positions().await.unwrap().get("audit"), Some(&last));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_due_timers_are_triggered() {
    let cluster = TestCluster::start_with(1, 1, 1, |config| {
        config.processing.due_date_check_interval_ms = 50;
    })
    .await;
    let CommandResponse::Event(instance) = cluster.submit(1, create_instance("Waiting")).await else {
        panic!("instance not created");
    };
    let due_date = cluster.clock.now_millis() + 500;
    let CommandResponse::Event(timer) = cluster
        .submit(
            1,
            CommandRequest::new(
                Intent::Create,
                RecordValue::Timer(TimerValue {
                    instance_key: instance.key,
                    due_date,
                }),
            ),
        )
        .await
    else {
        panic!("timer not created");
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(TimerState::get(&cluster.state(1, 1), timer.key).unwrap().is_some());

    cluster.clock.advance(1_000);
    let deadline = tokio::time::Instant::now() + common::WAIT;
    while TimerState::get(&cluster.state(1, 1), timer.key).unwrap().is_some() {
        assert!(tokio::time::Instant::now() < deadline, "timer never triggered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let triggered = committed_log(&cluster, 1, 1)
        .into_iter()
        .filter(|r| r.key == timer.key && r.intent == Intent::Triggered)
        .count();
    assert_eq!(triggered, 1);

    cluster.shutdown().await;
}
