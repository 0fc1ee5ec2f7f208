//! Concrete repository implementation behind `shared::repository`'s
//! traits (§6.3: "a repository abstraction is assumed"). Grounded on
//! `server/src/database.rs` (`ServerDatabase`: lazy-created SQLite file,
//! `CREATE TABLE IF NOT EXISTS`, per-concern submodules).

mod sqlite;

pub use sqlite::SqliteRepositories;
