pub mod crypto;
pub mod object_store;
pub mod vault;
