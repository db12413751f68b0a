// Copies a file in fixed-size records.

use std::path::Path;

use skyshard::cli::{Parser, ScalarType, Status};
use skyshard::util::copy_records;

fn main() {
    tracing_subscriber::fmt::init();

    let mut parser = Parser::new(
        "skyshard-copy-file",
        "copy a file in fixed-size records",
        std::env::args().skip(1).collect(),
    );
    parser
        .required("inUrl", "path of the input file")
        .required("outUrl", "path of the output file")
        .option("record-size", "record size of the copy, bytes", ScalarType::Uint, "1048576");

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

    let record_size = parser.get_u64("record-size") as usize;
    match copy_records(Path::new(parser.get("inUrl")), Path::new(parser.get("outUrl")), record_size)
    {
        Ok(copied) => {
            println!("copied {} bytes", copied);
        }
        Err(e) => {
            eprintln!("copy failed: {}", e);
            std::process::exit(2);
        }
    }
}
