//! ClientScript decompiler, recompiler and opcode calibration.
//!
//! Pipeline, leaves first:
//! - [`stack`]: stack effect algebra shared by every pass
//! - [`ops`]: canonical operations and the raw opcode [`OpcodeRegistry`]
//! - [`calibrate`]: discovers the registry of a scrambled cache from a
//!   reference dump
//! - [`cfg`]: basic blocks and successor edges of one script
//! - [`ast`]: structured tree built from the block graph
//! - [`solver`]: cache-wide subtype inference
//! - [`compile`]: the tree back to operations, including emulated calls
//!
//! [`interpreter`], [`render`], [`module`] and [`source`] sit on top of these.

pub mod annotate;
pub mod ast;
pub mod calibrate;
pub mod cfg;
pub mod compile;
pub mod config;
pub mod entity;
pub mod error;
pub mod interpreter;
pub mod module;
pub mod ops;
pub mod render;
pub mod solver;
pub mod source;
pub mod stack;
pub mod subtypes;
pub mod symbols;

pub use config::{CalibrationConfig, ImmediateTolerance};
pub use error::{CoreError, Result};
pub use ops::{ClientScript, OpId, OpcodeInfo, OpcodeRegistry, Operation};
pub use subtypes::Subtype;
