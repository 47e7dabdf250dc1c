#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod context;
mod effect;
mod error;
mod graph;
mod map;
mod node;
mod seq;
mod version;

pub use context::*;
pub use effect::*;
pub use error::*;
pub use graph::*;
pub use map::{Iter, OrderedMap};
pub use node::PortId;
pub use seq::{OrderedSequence, SeqContext, SeqId, SeqIter};
pub use version::*;
