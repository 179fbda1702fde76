//! Contains the components the server can host and the catalog that builds
//! them.
//!
//! [`catalog::ComponentCatalog`] maps component kinds to factories. The
//! [`builtin`] kinds stand in for the subsystems of the IDE server, and
//! [`func::FnComponent`] wraps plain closures for embedding and tests.

pub mod builtin;
pub mod catalog;
pub mod func;
