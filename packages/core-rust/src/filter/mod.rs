//! The rule filter language: lexer, parser, syntax tree and evaluator.

pub mod ast;
pub mod evaluator;
pub mod lexer;
pub mod parser;
pub mod value;

pub use ast::{CompareOp, Expr, Identifier, LogicalOp, Operand, Operator};
pub use evaluator::Evaluator;
pub use parser::parse;
pub use value::Scalar;
