pub mod network;
pub mod subnet;

pub use network::NetworkManager;
pub use subnet::{SubnetAllocator, SubnetLease};
