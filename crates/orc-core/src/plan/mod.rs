//! `orc plan create --from-toml` (§4.9): parse, validate, and materialize
//! a batch of tasks from a single TOML file into a project's document.

pub mod materialize;
pub mod parser;
pub mod toml_format;

pub use materialize::materialize_plan;
pub use parser::{parse_plan_toml, PlanParseError};
pub use toml_format::{PlanMeta, PlanToml, TaskToml};
