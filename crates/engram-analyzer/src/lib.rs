// NOTE: Analyzer Boundary Rationale
//
// Why a subprocess (not a linked inference client)?
// - The analyzer is a full agent with its own tooling and prompt surface;
//   the daemon only owns spawn, timeout, and output validation
// - Process-group kill is the one reliable cancellation primitive across
//   whatever the agent itself spawns
//
// Why classify on stderr text?
// - The analyzer's exit codes are not stable across versions; its error
//   strings are the de-facto contract
// - Misclassification degrades to the 'unknown' category, which retries a
//   bounded number of times - safe in both directions

mod error;

pub mod classify;
pub mod invoke;
pub mod output;
pub mod prompt;
pub mod query;
pub mod skills;

pub use classify::{Classified, backoff_delay, classify_failure, schema_failure};
pub use error::{Error, Result};
pub use invoke::{AnalyzerConfig, Invocation, RawOutput, invoke};
pub use output::{AnalyzerOutput, ValidatedOutput, validate_output};
pub use prompt::{PromptFile, append_version_bump, load_prompt};
pub use query::{QueryAnswer, parse_query_answer};
pub use skills::{SkillProbe, probe_skills};
