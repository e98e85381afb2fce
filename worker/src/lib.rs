pub mod action;
pub mod backplane;
pub mod cas_writer;
pub mod claims;
pub mod config;
pub mod exec;
pub mod matcher;
pub mod operation;
pub mod output_directory;
pub mod pipeline;
pub mod retrier;
pub mod stubs;
