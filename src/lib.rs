//! # Office Kernel - Managed Function Execution
//!
//! Rust implementation of a managed-function kernel providing:
//! - Managed function containers with pre/post administration duties
//! - Managed objects bound per function, thread or process scope, recycled exactly once
//! - Governance over object extensions, enforced automatically or by duties
//! - Sequential, parallel and spawned flows plus asynchronous flows with timeouts
//! - Escalation procedures at function and office level
//! - Team scheduling of functions and duties onto worker pools
//!
//! ## Architecture
//!
//! ```text
//!                    ┌──────────────────────────────────────┐
//!   invoke_process → │               Office                 │
//!                    │  ┌──────────┐  ┌──────────────────┐  │
//!                    │  │ Metadata │  │ Teams / Executor │  │
//!                    │  │ (linked) │  │  (tokio pools)   │  │
//!                    │  └──────────┘  └──────────────────┘  │
//!                    │  ┌──────────┐  ┌──────────────────┐  │
//!                    │  │ Process  │→ │ Thread → Flow →  │  │
//!                    │  │  State   │  │    Container     │  │
//!                    │  └──────────┘  └──────────────────┘  │
//!                    └──────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use office_kernel::kernel::OfficeBuilder;
//! use serde_json::json;
//!
//! let mut builder = OfficeBuilder::new("greeter");
//! builder.function("greet", |ctx| {
//!     let name: String = ctx.parameter_as()?;
//!     Ok(json!(format!("hello {}", name)))
//! });
//! let office = builder.open().unwrap();
//! let completion = office
//!     .function_manager("greet")
//!     .unwrap()
//!     .invoke_process_and_wait(json!("world"), Duration::from_secs(5))
//!     .unwrap();
//! assert_eq!(completion.value(), Some(&json!("hello world")));
//! office.close();
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod kernel;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::{Office, OfficeBuilder};
pub use types::{Error, KernelConfig, Result};
