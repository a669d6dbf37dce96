//! # steward-id
//!
//! Identity types shared by every steward crate.
//!
//! ## Design Principles
//!
//! - A resource is identified by `(kind, namespace, name)`; the triple is unique
//! - Keys have a canonical string form `kind/namespace/name` with strict parsing
//! - Counters (generations, resource versions) are typed so they cannot be mixed
//!
//! Examples:
//! - `Deployment/default/web`
//! - `ConfigMap/kube-system/coredns`

mod error;
mod macros;
mod types;

pub use error::KeyError;
pub use types::*;
