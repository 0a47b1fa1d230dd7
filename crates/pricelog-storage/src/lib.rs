//! Feed transport and persistence backends for the price history pipeline.

pub mod fetch;
pub mod memory;
pub mod postgres;
pub mod store;

pub use fetch::{
    connect_object_store, FeedReader, FeedSource, FeedStream, HttpClientConfig, ObjectStoreConfig,
    TransportError,
};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{PersistenceError, PriceStore, RunLease, TagUpdate};

pub const CRATE_NAME: &str = "pricelog-storage";
