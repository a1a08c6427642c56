//! SQLite plumbing: connection pool, pragmas, and schema migrations.

pub mod connection;
pub mod migrations;
