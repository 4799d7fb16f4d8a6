#[macro_use]
pub mod log;

pub mod auth;
pub mod config;
pub mod gmail;
pub mod matcher;
pub mod paths;
pub mod run;
pub mod vault;
