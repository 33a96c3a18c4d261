mod coalesce;
mod codec;
mod common;
mod dispatch;
mod memory;
mod normalization;
mod rocks;
mod spatial;

pub use coalesce::coalesce;
pub use codec::*;
pub use common::*;
pub use dispatch::*;
pub use memory::*;
pub use normalization::*;
pub use rocks::*;
pub use spatial::*;
