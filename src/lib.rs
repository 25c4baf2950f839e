pub mod auto;
pub mod cli;
pub mod command;
pub mod config;
pub mod domain;
pub mod error;
pub mod fs_util;
pub mod report;
pub mod spider;
pub mod template;
pub mod timed;
pub mod upload;
pub mod xnat;
