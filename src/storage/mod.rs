//! Store implementations.
//!
//! - [`InMemoryStore`]: every store trait in process, for development and tests
//! - `SeaOrmStore` (feature `database`): PostgreSQL persistence via SeaORM

mod memory;
#[cfg(feature = "database")]
mod migration;
#[cfg(feature = "database")]
mod sea_orm_store;

pub use memory::InMemoryStore;
#[cfg(feature = "database")]
pub use migration::{Migrator, rollback_migration, run_migrations};
#[cfg(feature = "database")]
pub use sea_orm_store::SeaOrmStore;
