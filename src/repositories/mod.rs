//! SQL access for the collaborator tables.
//!
//! Each repository owns a pool handle and exposes the narrow interface the
//! streaming core consumes: credential verification, target resolution and
//! connection tracking.

pub mod connections;
pub mod targets;
pub mod users;

pub use connections::{ConnectionGuard, ConnectionRepository};
pub use targets::TargetRepository;
pub use users::UserRepository;
