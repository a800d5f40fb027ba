pub mod archive;
pub mod backend;
pub mod compress;
pub mod config;
pub mod ingest;
pub mod model;
pub mod registry;
pub mod session;
pub mod store;

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
