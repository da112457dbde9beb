pub mod ast;
pub mod parser;

pub use ast::{Call, Expr, Literal};
pub use parser::parse;
