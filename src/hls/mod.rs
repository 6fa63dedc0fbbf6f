pub mod parser;
pub mod rewrite;
