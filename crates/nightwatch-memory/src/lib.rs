//! `nightwatch-memory` – the audit trail.
//!
//! # Modules
//!
//! - [`audit`] – [`AuditLog`][audit::AuditLog]: an append-only SQLite log of
//!   every veto, emergency, confirmation and operator action. The table is
//!   guarded by triggers so rows can never be updated or deleted.

pub mod audit;

pub use audit::{AuditEntry, AuditError, AuditLog};
