//! Configuration language
//!
//! Files are tokenized line by line ([`lexer`]), checked for trusted
//! ownership ([`source`]), compiled statement by statement into a
//! [`HierarchyNode`](crate::HierarchyNode) tree ([`compiler`]) and finally
//! lowered into VM chains ([`linker`]).

pub mod compiler;
pub mod lexer;
pub mod linker;
pub mod source;

pub use compiler::{CompileRequest, Compiled, Compiler};
