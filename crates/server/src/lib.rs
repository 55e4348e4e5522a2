pub mod file_logging;
pub mod mcp;
