pub mod bundler;
pub mod cli;
pub mod common;
pub mod entrypoint;
pub mod kv;
pub mod mempool;
pub mod rpc;
pub mod store;
