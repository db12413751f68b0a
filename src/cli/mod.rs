// # Command-Line Parser
//
// The reusable argument parser every tool is built on: positional
// parameters, `--name=value` options, flags and reversed flags, and closed
// sub-command sets. Sub-parse failures travel as result values; the
// top-level `parse()` folds them into an exit status.

pub mod parser;

pub use parser::{ParseErrorKind, Parser, ScalarType, Status};
