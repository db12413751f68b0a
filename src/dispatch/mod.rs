// # Query Dispatch
//
// Czar-side execution of one user query: an Executive owns a fleet of
// per-chunk JobQuery tasks; each attempt provisions a transport session and
// drives a QueryRequest conversation whose response bytes are decoded by a
// MergingRequester and streamed into the InfileMerger.

pub mod executive;
pub mod job_query;
pub mod job_status;
pub mod query_request;
pub mod requester;
pub mod transport;

pub use executive::{Executive, QueryId};
pub use job_query::{JobDescription, JobQuery};
pub use job_status::{JobPhase, JobStatus, JobStatusInfo};
pub use query_request::{FinishStatus, QueryRequest};
pub use requester::{MergingRequester, MsgState, ResponseRequester};
pub use transport::{CancelToken, QueryResource, SsiService};
