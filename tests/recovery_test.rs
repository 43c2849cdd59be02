mod common;

use common::{state_dump, TestCluster};
use raftstream::protocol::{InstanceValue, JobValue};
use raftstream::state::InstanceState;
use raftstream::{CommandRequest, CommandResponse, Intent, RecordValue};
use std::collections::BTreeSet;

fn create_instance(type_name: &str) -> CommandRequest {
    CommandRequest::new(
        Intent::Create,
        RecordValue::Instance(InstanceValue {
            type_name: type_name.into(),
            ..Default::default()
        }),
    )
}

/// Instance with a job and a failed job, returning the instance key.
async fn run_workload(cluster: &TestCluster, name: &str) -> i64 {
    let CommandResponse::Event(instance) = cluster.submit(1, create_instance(name)).await else {
        panic!("instance not created");
    };
    let CommandResponse::Event(job) = cluster
        .submit(
            1,
            CommandRequest::new(
                Intent::Create,
                RecordValue::Job(JobValue {
                    instance_key: instance.key,
                    job_type: "work".into(),
                    retries: 2,
                    ..Default::default()
                }),
            ),
        )
        .await
    else {
        panic!("job not created");
    };
    cluster
        .submit(
            1,
            CommandRequest::new(
                Intent::Fail,
                RecordValue::Job(JobValue {
                    instance_key: instance.key,
                    job_type: "work".into(),
                    retries: 1,
                    error_message: "boom".into(),
                }),
            )
            .with_key(job.key),
        )
        .await;
    instance.key
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicas_build_identical_state() {
    let cluster = TestCluster::start(3, 1, 3).await;
    let mut last = 0;
    for i in 0..5 {
        last = run_workload(&cluster, &format!("W{}", i)).await;
    }
    let CommandResponse::Event(done) = cluster
        .submit(
            1,
            CommandRequest::new(Intent::Complete, RecordValue::Instance(InstanceValue::default())).with_key(last),
        )
        .await
    else {
        panic!("instance not completed");
    };

    cluster.await_processed(1, done.source_position).await;
    let leader = state_dump(&cluster.state(1, 1));
    for node_id in 2..=3 {
        assert_eq!(state_dump(&cluster.state(node_id, 1)), leader, "replica {} diverged", node_id);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_replays_the_log() {
    let mut cluster = TestCluster::start(1, 1, 1).await;
    let mut keys = BTreeSet::new();
    for i in 0..3 {
        keys.insert(run_workload(&cluster, &format!("W{}", i)).await);
    }
    let before = state_dump(&cluster.state(1, 1));

    cluster.restart(1).await;
    cluster.leader(1).await;
    assert_eq!(state_dump(&cluster.state(1, 1)), before);

    // keys keep increasing after recovery
    let fresh = run_workload(&cluster, "Fresh").await;
    assert!(keys.iter().all(|k| *k < fresh));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_restart_from_snapshot_and_log_tail() {
    let mut cluster = TestCluster::start(1, 1, 1).await;
    for i in 0..3 {
        run_workload(&cluster, &format!("Before{}", i)).await;
    }
    let snapshot = cluster.broker(1).take_snapshot(1).await.unwrap().expect("snapshot taken");
    let tail = run_workload(&cluster, "Tail").await;
    let before = state_dump(&cluster.state(1, 1));

    cluster.restart(1).await;
    cluster.leader(1).await;
    let restored = cluster.broker(1).partition(1).unwrap().snapshot_store().latest().unwrap();
    assert_eq!(restored.id(), snapshot.id);
    assert_eq!(state_dump(&cluster.state(1, 1)), before);
    assert!(InstanceState::get(&cluster.state(1, 1), tail).unwrap().is_some());

    cluster.shutdown().await;
}
