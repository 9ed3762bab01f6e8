pub mod ber;
pub mod client;
pub mod config;
pub mod connection;
pub mod controls;
pub mod error;
pub mod filter;
pub mod framer;
pub mod ldap_protocol;
pub mod metrics;
pub mod session;
pub mod tls;

#[cfg(test)]
mod test_server;

pub use client::{LdapClient, PagedSearch, SearchItem, SearchResult, SearchStream};
pub use config::ClientConfig;
pub use error::{LdapError, ResultCode};
pub use filter::Filter;
pub use metrics::ClientMetrics;
pub use session::ConnectionState;
