mod error;
mod gateway;
mod kv;
mod mem;
mod registry;

pub use error::Error;
pub use gateway::{Client, Gateway, WatchEventType, WatchStream, node_by_name};
pub use kv::{Kv, KvEvent, KvWatch};
pub use mem::MemoryKv;
pub use registry::WatchRegistry;
