//! Flashdeck core: card model, sheet cache, working set, level filter,
//! navigation, editing and sync with a remote sheet store.
pub mod cache;
pub mod config;
pub mod edit;
pub mod filter;
pub mod navigator;
pub mod normalize;
pub mod remote;
pub mod session;
pub mod sync;
pub mod types;
pub mod working_set;
