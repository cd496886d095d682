pub mod analysis;
pub mod config;
pub mod engine;
pub mod error;
pub mod index;

pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use index::{Index, IndexCatalog, IndexManager, IndexMeta, IndexSettings};

pub use sediment_storage as storage;
