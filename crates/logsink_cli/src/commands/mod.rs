//! CLI command implementations.

pub mod compact;
pub mod dead_letters;
pub mod init_store;
pub mod inspect;
pub mod produce;
pub mod reset_cursor;
pub mod run;
