/// Error fingerprinting and message normalization
pub mod fingerprinter;

pub use fingerprinter::{ErrorSignature, Fingerprinter, StackFrame};
