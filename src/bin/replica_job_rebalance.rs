// Rebalances chunk replicas of a database family so that the participating
// workers end up (nearly) equally loaded.

use std::sync::Arc;

use skyshard::cli::{Parser, ScalarType, Status};
use skyshard::replica::job::track;
use skyshard::replica::{
    Controller, DatabaseServices, ExtendedState, InMemoryDatabaseServices, Job, JobOptions,
    MockWorkerService, RebalanceJob, RebalanceJobResult, ReplicaConfig, ReplicaInfo,
    ReplicaStatus,
};
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

fn print_plan(result: &RebalanceJobResult) {
    println!("THE REBALANCE PLAN:");
    println!("  totalWorkers:    {}", result.total_workers);
    println!("  totalGoodChunks: {}", result.total_good_chunks);
    println!("  avgChunks:       {:.2}", result.avg_chunks);
    println!();
    println!("--------+--------------------------+--------------------------");
    println!("  chunk |            source worker |       destination worker ");
    println!("--------+--------------------------+--------------------------");
    for (chunk, moves) in &result.plan {
        for (source, destination) in moves {
            println!(" {:>6} | {:>24} | {:>24}", chunk, source, destination);
        }
    }
    println!("--------+--------------------------+--------------------------");
}

fn print_replica_census(database: &Arc<dyn DatabaseServices>, config: &ReplicaConfig, family: &str) {
    println!("REPLICAS:");
    println!("----------+----------+-----+-----------------------------------------");
    println!("    chunk | database | rep | workers");
    println!("----------+----------+-----+-----------------------------------------");
    for db in config.family_databases(family) {
        let mut by_chunk: std::collections::BTreeMap<u32, Vec<ReplicaInfo>> =
            std::collections::BTreeMap::new();
        for worker in &config.workers {
            if let Ok(replicas) = database.find_worker_replicas(&worker.name, &db.name) {
                for replica in replicas {
                    by_chunk.entry(replica.chunk).or_default().push(replica);
                }
            }
        }
        for (chunk, replicas) in by_chunk {
            let workers: Vec<String> = replicas
                .iter()
                .map(|r| {
                    let marker =
                        if r.status == ReplicaStatus::Complete { "" } else { "(!)" };
                    format!("{}{}", r.worker, marker)
                })
                .collect();
            println!(
                " {:>8} | {:>8} | {:>3} | {}",
                chunk,
                db.name,
                replicas.len(),
                workers.join(" ")
            );
        }
    }
    println!("----------+----------+-----+-----------------------------------------");
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut parser = Parser::new(
        "skyshard-replica-job-rebalance",
        "rebalance chunk replicas of a database family",
        std::env::args().skip(1).collect(),
    );
    parser
        .required("family", "name of the database family to rebalance")
        .option("config", "configuration locator", ScalarType::Str, "file:replica.json")
        .option("catalog", "replica catalog locator (JSON)", ScalarType::Str, "")
        .flag("estimate-only", "compute and print the plan without moving chunks")
        .flag("progress-report", "print progress while the job runs")
        .flag("error-report", "print the detailed error summary");

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
    let controller = Controller::new(config.clone(), database.clone(), worker_service);

    let family = parser.get("family").to_string();
    let job = RebalanceJob::create(
        &family,
        parser.flag_value("estimate-only"),
        controller.clone(),
        "",
        JobOptions::default(),
    );
    if let Err(e) = controller.launch(job.clone()) {
        eprintln!("failed to start the rebalance job: {}", e);
        std::process::exit(2);
    }

    track(
        job.as_ref(),
        parser.flag_value("progress-report"),
        BlockPost::new(1000, 2000),
        &mut std::io::stdout(),
    );

    let result = job.result();
    print_plan(&result);
    let generic: Arc<dyn DatabaseServices> = database;
    print_replica_census(&generic, &config, &family);

    if parser.flag_value("error-report") && !result.failed_moves.is_empty() {
        println!("FAILED MOVES:");
        for (planned, error) in &result.failed_moves {
            println!(
                "  chunk {} {} -> {}: {}",
                planned.chunk, planned.source_worker, planned.destination_worker, error
            );
        }
    }

    let (_, extended) = job.core().state();
    if extended != ExtendedState::Success {
        eprintln!("rebalance finished with state {}", extended.as_str());
        std::process::exit(2);
    }
}
