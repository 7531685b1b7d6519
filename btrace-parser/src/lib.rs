use thiserror::Error;

// Modular parser structure
mod parser;
pub use parser::Parser;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Parse error at {location}: {message}")]
    SyntaxError { location: String, message: String },
    #[error("Lexer error at {location}: invalid token")]
    LexerError { location: String },
}
