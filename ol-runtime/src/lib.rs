mod commands;
pub use commands::*;
pub mod generate;
pub mod model_file;
pub mod parser;
pub mod producer;
