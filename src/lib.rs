//! # confr
//!
//! A configuration-management daemon that renders local configuration files
//! from data stored in external key-value backends.
//!
//! ## Overview
//!
//! For each declared template resource, confr:
//! - **Fetches** a set of keys from a backend (env, file, etcd, Consul,
//!   Vault, SSM, Secrets Manager, ACM)
//! - **Renders** a text template against those keys with a small
//!   function-rich templating language
//! - **Stages** the result atomically, optionally validating it with a
//!   check command before committing
//! - **Reloads** the consumer of the rendered file with a reload command
//!
//! It can run once, on a fixed interval, or in watch mode, where it reacts
//! to backend change notifications instead of polling.
//!
//! ## Quick Start
//!
//! ```no_run
//! use confr::cli::Cli;
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() -> confr::Result<()> {
//!     let cli = Cli::parse();
//!     confr::runloop::run(cli).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! backend (GetValues/WatchPrefix) -> template context -> renderer -> stager -> dest + reload
//! ```

pub use errors::{ConfrError, Result};

pub mod backend;
pub mod cli;
pub mod config;
pub mod errors;
pub mod health;
pub mod log;
pub mod processor;
pub mod runloop;
pub mod stager;
pub mod template;
