// # Worker Wire Protocol
//
// The czar and workers exchange size-prefixed, schema-driven messages:
// a one-byte header-size field, a `ProtoHeader` announcing the body length
// and its MD5 digest, then the body itself. The first fragment of a response
// carries the result schema; later fragments carry only rows.

pub mod header;
pub mod worker;

pub use header::{ProtoHeader, PROTOCOL_VERSION};
pub use worker::{ColumnSchema, ResponseData, RowBundle, RowSchema, TaskMsg, WorkerResponse};
