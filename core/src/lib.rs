pub mod audit;
pub mod config;
pub mod determinism;
pub mod error;
pub mod evidence;
pub mod records;
pub mod session;
pub mod storage;
