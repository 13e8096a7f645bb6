//! asaas-storage: OpenDAL access to the cloud object store (S3 / R2)

pub mod health;
pub mod operator;

pub use health::{check_health, is_healthy};
pub use operator::{build_operator, memory_operator, ObjectStoreConfig};
