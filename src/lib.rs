pub mod abi;

pub mod amount;

pub mod decode;

pub mod deployment;

pub mod error;

pub mod model;

pub mod network;

pub mod reader;

pub mod retry;

pub mod rpc_wallet;

pub mod scheduler;

pub mod token;

pub mod wallet;

pub mod writer;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;
