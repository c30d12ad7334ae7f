pub mod endpoint_store;
pub mod etcd;
pub mod kv;
pub mod memory;
pub mod postgres;
pub mod types;

pub use endpoint_store::{DeploymentWrite, EndpointStore, StoreError};
pub use etcd::EtcdMetaStore;
pub use kv::KvEndpointStore;
pub use memory::MemoryMetaStore;
pub use postgres::PgEndpointStore;
pub use types::{KvTxn, MetaStore};
