pub mod core;
pub mod delivery;
pub mod image;
pub mod metadata;
pub mod observability;
pub mod proxy;
pub mod signer;
pub mod storage;
