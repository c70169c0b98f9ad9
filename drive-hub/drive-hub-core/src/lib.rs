pub mod acl;
pub mod auth;
pub mod cache;
pub mod drive;
pub mod encryption;
pub mod error;
pub mod events;
pub mod ledger;
pub mod settings;
pub mod storage;
pub mod sync;
