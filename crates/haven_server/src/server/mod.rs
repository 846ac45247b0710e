#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod groups;
pub mod http;
pub mod hub;
pub mod registry;
pub mod seed;
pub mod store;


#[cfg(test)]
mod groups_tests;

#[cfg(test)]
mod http_tests;
