#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod context;
mod dispatcher;
mod effect;
mod engine;
mod error;
mod hook;
mod lanes;
mod scheduler;
mod source;
mod update;
mod value;

pub use context::*;
pub use dispatcher::*;
pub use effect::*;
pub use engine::*;
pub use error::*;
pub use hook::*;
pub use lanes::*;
pub use scheduler::*;
pub use source::*;
pub use update::*;
pub use value::*;
