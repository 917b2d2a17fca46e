//! Repo Curator: a batch pipeline that turns newsletters into a curated
//! list of repositories.

pub mod channels;
pub mod client;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod worker;
