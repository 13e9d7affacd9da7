//! Shared foundations for the image registry: the [`runtime::Runtime`]
//! abstraction, the per-request security [`context::RequestContext`], the
//! image domain types, and the tunable knobs.

pub mod backoff;
pub mod context;
pub mod knobs;
pub mod md5;
pub mod runtime;
pub mod types;
