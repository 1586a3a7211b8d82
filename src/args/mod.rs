mod cli;
mod parsers;

pub use cli::{HatchType, WorkerArgs};
pub(crate) use parsers::parse_rate_spec;
