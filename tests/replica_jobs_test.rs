// Control-plane integration: jobs running against the in-process worker
// fleet and replica catalog.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::unbounded;

use skyshard::replica::{
    Controller, DatabaseConfig, DatabaseServices, ExtendedState, FamilyConfig, FileInfo,
    InMemoryDatabaseServices, Job, JobOptions, JobState, MockWorkerService, RebalanceJob,
    ReplicaConfig, ReplicaDiffCallback, ReplicaInfo, ReplicaStatus, SqlCreateIndexesJob,
    SqlGetIndexesJob, SqlIndexColumn, IndexSpec, TableConfig, VerifyJob, WorkerConfig,
    DUMMY_CHUNK,
};

fn config(workers: &[&str]) -> ReplicaConfig {
    ReplicaConfig {
        workers: workers.iter().map(|w| WorkerConfig::new(*w, "host", 25000)).collect(),
        databases: vec![DatabaseConfig {
            name: "Obj".to_string(),
            family: "production".to_string(),
            tables: vec![TableConfig { name: "Object".to_string(), is_partitioned: true }],
        }],
        families: vec![FamilyConfig { name: "production".to_string(), replication_level: 2 }],
        max_tables_per_request: 10,
        job_deadline_sec: 0,
    }
}

fn fixture(
    workers: &[&str],
    replicas: Vec<ReplicaInfo>,
) -> (Arc<Controller>, Arc<InMemoryDatabaseServices>, Arc<MockWorkerService>) {
    let database = Arc::new(InMemoryDatabaseServices::with_replicas(replicas));
    let worker_service =
        Arc::new(MockWorkerService::new(database.clone() as Arc<dyn DatabaseServices>));
    let controller =
        Controller::with_threads(config(workers), database.clone(), worker_service.clone(), 4);
    (controller, database, worker_service)
}

#[test]
fn test_index_creation_across_fleet() {
    let workers = ["worker-a", "worker-b", "worker-c"];
    let mut replicas = Vec::new();
    for worker in workers {
        for chunk in [100u32, 200, 300] {
            replicas.push(ReplicaInfo::new(worker, "Obj", chunk, ReplicaStatus::Complete));
        }
    }
    let (controller, _database, _worker_service) = fixture(&workers, replicas);

    let job = SqlCreateIndexesJob::create(
        "Obj",
        "Object",
        false,
        IndexSpec::Default,
        "idx_radecl",
        "spatial index",
        vec![SqlIndexColumn::new("ra", 0, true), SqlIndexColumn::new("decl", 0, true)],
        false,
        false,
        controller.clone(),
        "",
        JobOptions::default(),
    );
    controller.launch(job.clone()).unwrap();
    job.core().wait();
    assert_eq!(job.core().state(), (JobState::Finished, ExtendedState::Success));
    assert_eq!(job.result().total_completed(), 12);

    // The retrieval job sees what the creation job built.
    let get = SqlGetIndexesJob::create(
        "Obj",
        "Object",
        false,
        false,
        controller.clone(),
        "",
        JobOptions::default(),
    );
    controller.launch(get.clone()).unwrap();
    get.core().wait();
    let indexes = get.indexes();
    for worker in workers {
        assert_eq!(indexes[worker].len(), 4);
        assert!(indexes[worker].contains_key(&format!("Obj.Object_{}", DUMMY_CHUNK)));
    }
}

#[test]
fn test_verify_reports_file_size_drift() {
    let stored = ReplicaInfo::new("w1", "Obj", 100, ReplicaStatus::Complete)
        .with_files(vec![FileInfo::new("chunk_100.data", 1000, 42, "")]);
    let (controller, _database, worker_service) = fixture(&["w1"], vec![stored.clone()]);

    // The worker observes a grown file.
    let mut observed = stored;
    observed.files[0].size = 1001;
    worker_service.observe(observed);

    let (sender, receiver) = unbounded();
    let on_diff: ReplicaDiffCallback = Box::new(move |self_diff, _peers| {
        let _ = sender.send((self_diff.file_size_mismatch(), self_diff.flags2string()));
    });
    let job =
        VerifyJob::create(1, false, Some(on_diff), controller.clone(), "", JobOptions::default());
    controller.launch(job.clone()).unwrap();

    let (size_mismatch, flags) = receiver.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(size_mismatch);
    assert!(flags.starts_with("DIFF"));
    assert!(flags.contains("size"));

    job.cancel();
    job.core().wait();
}

#[test]
fn test_rebalance_estimate_plan_shape() {
    let mut replicas = Vec::new();
    for chunk in 1..=8u32 {
        replicas.push(ReplicaInfo::new("w1", "Obj", chunk, ReplicaStatus::Complete));
    }
    let (controller, _database, _worker_service) = fixture(&["w1", "w2"], replicas);

    let job =
        RebalanceJob::create("production", true, controller.clone(), "", JobOptions::default());
    controller.launch(job.clone()).unwrap();
    job.core().wait();

    let result = job.result();
    assert_eq!(result.total_workers, 2);
    assert_eq!(result.total_good_chunks, 8);
    assert_eq!(result.planned_moves(), 4);
    for moves in result.plan.values() {
        for (source, destination) in moves {
            assert_eq!(source, "w1");
            assert_eq!(destination, "w2");
        }
    }
}

#[test]
fn test_job_lifecycle_recorded_in_event_log() {
    let (controller, database, _worker_service) = fixture(&["w1"], Vec::new());

    // An empty catalog fails the verification job immediately.
    let job = VerifyJob::create(2, true, None, controller.clone(), "", JobOptions::default());
    controller.launch(job.clone()).unwrap();
    job.core().wait();
    assert_eq!(job.core().state(), (JobState::Finished, ExtendedState::Failed));

    let events = database.events(controller.id()).unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    assert!(kinds.contains(&"CONTROLLER_STARTED"));
    assert!(kinds.contains(&"JOB_STARTED"));
    assert!(kinds.contains(&"JOB_FINISHED"));

    let record = database.job(job.core().id()).unwrap();
    assert_eq!(record.extended_state, "FAILED");
    assert!(record.parameters.contains(&("max_replicas".to_string(), "2".to_string())));
    assert!(record.parameters.contains(&("compute_check_sum".to_string(), "1".to_string())));
}

#[test]
fn test_job_deadline_expires() {
    let stored = ReplicaInfo::new("w1", "Obj", 100, ReplicaStatus::Complete);
    let database = Arc::new(InMemoryDatabaseServices::with_replicas(vec![stored]));
    let worker_service =
        Arc::new(MockWorkerService::new(database.clone() as Arc<dyn DatabaseServices>));
    let mut config = config(&["w1"]);
    config.job_deadline_sec = 1;
    let controller = Controller::with_threads(config, database, worker_service, 2);

    // The sweep would run forever; the deadline reaps it.
    let job = VerifyJob::create(1, false, None, controller.clone(), "", JobOptions::default());
    controller.launch(job.clone()).unwrap();
    assert!(job.core().wait_timeout(Duration::from_secs(15)));
    assert_eq!(job.core().state(), (JobState::Finished, ExtendedState::TimeoutExpired));
}
