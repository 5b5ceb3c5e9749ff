//! Test utilities shared across engram crates.
//!
//! Provides session-file builders in the producer's wire format, stub
//! analyzer scripts with scriptable behavior, and a temp-directory world
//! holding a daemon-shaped data layout.

mod analyzer;
mod fixtures;
mod world;

pub use analyzer::{StubBehavior, write_stub_analyzer};
pub use fixtures::SessionFixture;
pub use world::TestWorld;
