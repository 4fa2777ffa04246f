//! Compiles ephemeral requests into Kubernetes primitives
//!
//! Pure translation from an [`EphemeralRequest`] into the Deployment, Service
//! and optional Secret that back it. No I/O happens here; the operator crate
//! applies the output.
//!
//! # Usage
//!
//! ```rust,ignore
//! validate_spec(&request.spec, &config)?;
//! let compiled = ResourceBuilder::new(&config, namespace).build(&request)?;
//! client.apply_deployment(&compiled.deployment).await?;
//! ```
//!
//! [`EphemeralRequest`]: ephemera_common::model::EphemeralRequest

mod compiled;
mod compiler;
pub mod config;
pub mod error;
pub mod validation;

pub use compiled::CompiledResources;
pub use compiler::ResourceBuilder;
pub use config::BuilderConfig;
pub use error::CompilationError;
pub use validation::validate_spec;
