// # Result Row Sink
//
// Streams decoded worker response fragments into a local MySQL result table
// through a bulk-load session. Rows are rendered in the LOAD DATA LOCAL
// INFILE dialect: tab-separated cells, newline-separated rows, `\N` nulls,
// single-quoted strings with a backslash escape set.

pub mod infile;
pub mod row_buffer;

pub use infile::{ColumnDef, InfileMerger, LocalInfileSink, MemoryInfileSink};
pub use row_buffer::{escape_bytes, unescape_bytes, ProtoRowBuffer};
