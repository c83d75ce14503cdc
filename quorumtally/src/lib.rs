#[macro_use]
extern crate serde;

mod blob;
mod election;
mod engine;
mod error;
mod guardian;
mod lifecycle;
mod orchestrator;
mod registry;
mod shares;
mod sqlite;
mod store;

pub use blob::*;
pub use election::*;
pub use engine::*;
pub use error::*;
pub use guardian::*;
pub use lifecycle::*;
pub use orchestrator::*;
pub use registry::*;
pub use shares::*;
pub use sqlite::*;
pub use store::*;
