//! SoftBound+CETS instrumentation for a typed SSA IR.
//!
//! The pass rewrites an in-memory module so that every pointer computation
//! propagates four shadow values (base, bound, key, lock) and every
//! dereference is guarded by a spatial and a temporal check, implemented
//! as calls into an external runtime library. Parsing, printing, the
//! runtime itself, and option selection belong to the surrounding tooling;
//! this crate consumes and produces `ir::module::IrModule` values.
//!
//! Entry point: [`instrument::instrument_module`] with an
//! [`instrument::InstrumentOptions`].

pub mod common;
pub mod instrument;
pub mod ir;

pub use common::error::InstrumentError;
pub use instrument::{instrument_module, InstrumentOptions};
