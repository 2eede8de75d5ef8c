//! Backend adapters implementing [`EntityMetadataProvider`](crate::traits::EntityMetadataProvider).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redb")]
pub mod table;

pub use memory::MemoryEntityMetadataProvider;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEntityMetadataProvider;
#[cfg(feature = "redb")]
pub use table::TableEntityMetadataProvider;
