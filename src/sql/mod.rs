//! SQL front end: lexer, tokens, AST and parser.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::Statement;
pub use parser::Parser;

/// Parses a single SQL statement.
pub fn parse(sql: &str) -> crate::error::Result<Statement> {
    Parser::new(sql).parse()
}
