pub mod analyzer_server;
