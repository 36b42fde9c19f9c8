pub mod parser;
pub mod size;
