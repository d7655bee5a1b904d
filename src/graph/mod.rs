/// Graph validation and the immutable execution plan.
pub mod build;
/// Serde composition model.
pub mod composition;
/// Programmatic composition builder.
pub mod dsl;
pub(crate) mod scheduler;
