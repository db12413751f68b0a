// Continuously verifies the integrity of existing replicas.

use std::sync::Arc;

use skyshard::cli::{Parser, ScalarType, Status};
use skyshard::replica::{
    Controller, DatabaseServices, InMemoryDatabaseServices, Job, JobOptions,
    MockWorkerService, ReplicaConfig, ReplicaDiffCallback, ReplicaInfo, VerifyJob,
};
use skyshard::replica::job::track;
use skyshard::util::BlockPost;
use skyshard::ShardError;

fn load_catalog(locator: &str) -> skyshard::Result<Vec<ReplicaInfo>> {
    let path = locator.strip_prefix("file:").ok_or_else(|| {
        ShardError::Configuration(format!("unsupported catalog locator: {}", locator))
    })?;
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| ShardError::Configuration(format!("bad catalog {}: {}", path, e)))
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut parser = Parser::new(
        "skyshard-replica-verify",
        "verify the integrity of existing replicas",
        std::env::args().skip(1).collect(),
    );
    parser
        .option("config", "configuration locator", ScalarType::Str, "file:replica.json")
        .option("catalog", "replica catalog locator (JSON)", ScalarType::Str, "")
        .option("max-replicas", "number of replicas inspected concurrently", ScalarType::Uint, "1")
        .flag("compute-check-sum", "tell workers to recompute file control sums")
        .flag("progress-report", "print progress while the job runs")
        .flag("detailed-report", "print the full difference report");

    match parser.parse() {
        Status::Success => {}
        Status::HelpRequested => {
            println!("{}", parser.help());
            std::process::exit(0);
        }
        _ => {
            eprintln!("{}", parser.help());
            if let Some(error) = parser.error() {
                eprintln!("error: {}", error);
            }
            std::process::exit(1);
        }
    }
    tracing::info!(args = %parser.serialize(), "starting");

    let config = match ReplicaConfig::load(parser.get("config")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {}", e);
            std::process::exit(1);
        }
    };
    let catalog = if parser.get("catalog").is_empty() {
        Vec::new()
    } else {
        match load_catalog(parser.get("catalog")) {
            Ok(catalog) => catalog,
            Err(e) => {
                eprintln!("catalog error: {}", e);
                std::process::exit(1);
            }
        }
    };

    let database = Arc::new(InMemoryDatabaseServices::with_replicas(catalog));
    let worker_service =
        Arc::new(MockWorkerService::new(database.clone() as Arc<dyn DatabaseServices>));
    let controller = Controller::new(config, database, worker_service);

    let detailed = parser.flag_value("detailed-report");
    let on_diff: ReplicaDiffCallback = Box::new(move |self_diff, peer_diffs| {
        let r1 = self_diff.replica1();
        let r2 = self_diff.replica2();
        println!(
            "Compared with OWN previous state  {:>20} {:>12} {:>20} {:>20}  {}",
            r1.database,
            r1.chunk,
            r1.worker,
            r2.worker,
            self_diff.flags2string()
        );
        for diff in peer_diffs {
            let r1 = diff.replica1();
            let r2 = diff.replica2();
            println!(
                "Compared with OTHER replica state {:>20} {:>12} {:>20} {:>20}  {}",
                r1.database,
                r1.chunk,
                r1.worker,
                r2.worker,
                diff.flags2string()
            );
        }
        if detailed && self_diff.not_equal() {
            println!("{}", self_diff);
        }
    });

    let job = VerifyJob::create(
        parser.get_u64("max-replicas") as usize,
        parser.flag_value("compute-check-sum"),
        Some(on_diff),
        controller.clone(),
        "",
        JobOptions::default(),
    );
    if let Err(e) = controller.launch(job.clone()) {
        eprintln!("failed to start the verification job: {}", e);
        std::process::exit(2);
    }

    track(
        job.as_ref(),
        parser.flag_value("progress-report"),
        BlockPost::new(1000, 2000),
        &mut std::io::stdout(),
    );

    let (_, extended) = job.core().state();
    if extended != skyshard::replica::ExtendedState::Success {
        eprintln!("verification finished with state {}", extended.as_str());
        std::process::exit(2);
    }
}
