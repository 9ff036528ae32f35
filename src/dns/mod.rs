//! DNS engine: wire codec, upstream resolvers, routing, and the
//! forwarder
//!
//! The data flow for one query:
//!
//! ```text
//! client -> listener -> handle_query
//!   -> message (parse, inject ECS)
//!   -> router.resolver_for(qname)
//!   -> resolver.query
//!   -> reply (original response, or ServFail-patched query on failure)
//! -> client
//! ```

pub mod client;
pub mod error;
pub mod message;
pub mod router;
pub mod server;

pub use client::{resolver_from_export, Resolver, ResolverExport, ResolverProtocol};
pub use error::{DnsError, DnsResult};
pub use message::QueryMsg;
pub use router::{RouteExport, RouteMatch, Router, RouterExport, MAX_ROUTES};
pub use server::{BoundAddrs, DnsHandler, Forwarder, ListenConfig, TlsIdentity};
