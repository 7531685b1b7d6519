pub mod analyser;
pub mod arch;
pub mod codegen;

pub use analyser::{Aggregation, Analyser, Analysis, MapDef, PrintHint, PrintfSpec};
pub use codegen::ir::IrProgram;
pub use codegen::CodeGen;
