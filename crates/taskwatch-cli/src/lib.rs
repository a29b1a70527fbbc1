//! # taskwatch-cli
//!
//! Command-line front end for the taskwatch scanning engine.
//!
//! ## Features
//!
//! - **Process scan**: every task with its executable, libraries, open files and sockets
//! - **Trust model**: package-database signatures plus VirusTotal reputation
//! - **Filtering**: by text, trust level and process tree
//! - **Multiple output formats**: Pretty tables, JSON, CSV

pub mod cli;
pub mod config;
pub mod output;

pub use cli::run;
