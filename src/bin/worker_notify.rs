// Sends chunk-list notifications to one worker service.

use std::sync::Arc;

use skyshard::cli::{Parser, ScalarType, Status};
use skyshard::replica::{
    InMemoryDatabaseServices, MockWorkerService, WorkerCommand, WorkerCommandOutcome,
    WorkerService,
};

fn build_parser() -> Parser {
    let mut parser = Parser::new(
        "skyshard-worker-notify",
        "notify a worker service about chunk list changes",
        std::env::args().skip(1).collect(),
    );
    parser
        .option("config", "configuration locator", ScalarType::Str, "file:replica.json")
        .option("service", "worker service address, host:port", ScalarType::Str, "localhost:25000")
        .option("worker", "name of the worker to notify", ScalarType::Str, "worker");
    parser.command("RELOAD_CHUNK_LIST");
    parser
        .command("ADD_CHUNK_GROUP")
        .required("chunk", "chunk number")
        .required("database", "database of the chunk group");
    parser
        .command("REMOVE_CHUNK_GROUP")
        .required("chunk", "chunk number")
        .required("database", "database of the chunk group")
        .flag("force", "remove the group even if the chunk is in use");
    parser.command("TEST_ECHO").required("data", "text the worker must echo back");
    parser
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut parser = build_parser();
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

    let command = match parser.command_name().expect("command required by the parser") {
        "RELOAD_CHUNK_LIST" => WorkerCommand::ReloadChunkList,
        "ADD_CHUNK_GROUP" => WorkerCommand::AddChunkGroup {
            chunk: parser.get_u64("chunk") as u32,
            databases: vec![parser.get("database").to_string()],
        },
        "REMOVE_CHUNK_GROUP" => WorkerCommand::RemoveChunkGroup {
            chunk: parser.get_u64("chunk") as u32,
            databases: vec![parser.get("database").to_string()],
            force: parser.flag_value("force"),
        },
        "TEST_ECHO" => WorkerCommand::TestEcho { data: parser.get("data").to_string() },
        other => unreachable!("command {} not registered", other),
    };

    // The wire client for the worker management service is pluggable; this
    // tool ships with the in-process implementation.
    let database = Arc::new(InMemoryDatabaseServices::new());
    let service = MockWorkerService::new(database);
    match service.notify(parser.get("worker"), &command) {
        Ok(WorkerCommandOutcome::ChunkList { added, removed }) => {
            println!("added: {} chunk(s), removed: {} chunk(s)", added.len(), removed.len());
            for (database, chunk) in added {
                println!("  + {}:{}", database, chunk);
            }
            for (database, chunk) in removed {
                println!("  - {}:{}", database, chunk);
            }
        }
        Ok(WorkerCommandOutcome::Echo { data }) => {
            println!("{}", data);
        }
        Ok(WorkerCommandOutcome::Ack) => {
            println!("ok");
        }
        Err(e) => {
            eprintln!("notification failed: {}", e);
            std::process::exit(2);
        }
    }
}
