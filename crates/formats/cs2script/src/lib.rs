//! Reader/writer for compiled ClientScript (CS2) blobs.
//!
//! Two layers:
//! - **Layer 1** (`cursor`, `immediate`): big-endian primitives and the
//!   immediate shapes that follow each opcode
//! - **Layer 2** (`script`, `bytecode`): the script header (switch tables,
//!   argument/local counts) and the instruction stream
//!
//! Raw opcode ids are passed through untouched; mapping them to meaningful
//! operations is the job of a calibrated opcode registry.

pub mod bytecode;
pub mod cursor;
pub mod error;
pub mod immediate;
pub mod script;
pub mod version;

pub use bytecode::{ImmediateLookup, Instruction};
pub use error::{Error, Result};
pub use immediate::{ImmediateKind, Payload};
pub use script::{RawScript, Script, ScriptHeader, SlotCounts, SwitchCase};
pub use version::BuildNumber;
