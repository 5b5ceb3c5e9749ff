// NOTE: Database Design Rationale
//
// Why one SQLite file for index + queue + FTS + vectors?
// - A single daemon process owns the database; WAL gives concurrent readers
// - The queue must commit atomically with nothing else, and the node index
//   must commit atomically with its FTS row - same transaction, same file
// - Vectors are small (one per node); a dedicated vector store buys nothing
//   at this scale
//
// Why application-managed FTS (not triggers)?
// - Trigger-maintained FTS drifts silently when the schema evolves
// - Doing the delete+insert inside the node-write transaction keeps the
//   invariant visible in one place and testable
//
// Why canonical JSON outside the database?
// - The index holds only what queries filter and sort on; the full node
//   document lives in versioned JSON files that survive index rebuilds

mod db;
mod error;
mod schema;

pub mod queries;

pub use db::Database;
pub use error::{Error, Result};
pub use queries::nodes::{NodeFilter, NodeRow};
pub use queries::queue::{EnqueueRequest, LeaseRequest};
pub use queries::search::SearchHit;
pub use schema::SCHEMA_VERSION;
