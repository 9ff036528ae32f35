//! Resolver routing
//!
//! A router holds one default resolver plus a fixed array of prioritized
//! routes, each pairing a zone set with a resolver. Queries are matched
//! against the routes in priority order (smaller index first) using
//! longest-suffix zone matching; the first route whose zone trie matches
//! the query name wins, and the default resolver backstops everything
//! else.
//!
//! Route slots are addressed by index `1..MAX_ROUTES`; slot 0 is
//! reserved as the unused sentinel. State is guarded by a reader/writer
//! lock: lookups on the query path take brief read locks, mutation from
//! the management API takes the write lock.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use super::client::{resolver_from_export, Resolver, ResolverExport};
use super::error::{DnsError, DnsResult};
use crate::util::dnstrie::DnsTrie;

/// Maximum number of routes supported in a router.
///
/// Valid route indices are `1..MAX_ROUTES`; smaller index means higher
/// priority.
pub const MAX_ROUTES: usize = 10;

/// One route: a zone set dispatched to a resolver.
struct Route {
    name: String,
    resolver: Option<Arc<dyn Resolver>>,
    trie: DnsTrie<()>,
}

impl Route {
    fn empty() -> Self {
        Self {
            name: String::new(),
            resolver: None,
            trie: DnsTrie::new(),
        }
    }
}

struct RouterInner {
    resolver: Option<Arc<dyn Resolver>>,
    routes: [Option<Route>; MAX_ROUTES],
}

/// Export/import form of a route, exchanged as JSON with the management
/// API. Empty fields leave the corresponding slot state untouched on
/// import (partial update).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteExport {
    /// Route slot index; `1..MAX_ROUTES`, lower is higher priority.
    #[serde(default)]
    pub index: usize,
    /// Route name for logs and the UI.
    #[serde(default)]
    pub name: String,
    /// Resolver serving this route.
    #[serde(default)]
    pub resolver: Option<ResolverExport>,
    /// Zones matched by this route; when provided and non-empty, the
    /// zone set is replaced wholesale.
    #[serde(default)]
    pub zones: Option<Vec<String>>,
}

/// Export/import form of a whole router.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterExport {
    /// The default resolver.
    #[serde(default)]
    pub resolver: Option<ResolverExport>,
    /// Occupied route slots.
    #[serde(default)]
    pub routes: Vec<RouteExport>,
}

/// Outcome of a route lookup.
///
/// The first route whose zone trie matches the query name wins
/// unconditionally; a matched route without a resolver is reported as
/// such rather than silently falling through to lower-priority routes
/// or the default.
pub enum RouteMatch {
    /// No route matched and no default resolver is installed.
    None,
    /// The route at this index matched but carries no resolver yet.
    NoResolver(i32),
    /// The resolver to use and the index it came from (-1 = default).
    Resolver(Arc<dyn Resolver>, i32),
}

/// Longest-zone-suffix resolver router.
pub struct Router {
    inner: RwLock<RouterInner>,
    roots: Arc<rustls::RootCertStore>,
}

impl Router {
    /// Create an empty router.
    ///
    /// `roots` holds the trust anchors handed to TLS-based resolvers
    /// built through this router.
    #[must_use]
    pub fn new(roots: Arc<rustls::RootCertStore>) -> Self {
        Self {
            inner: RwLock::new(RouterInner {
                resolver: None,
                routes: std::array::from_fn(|_| None),
            }),
            roots,
        }
    }

    /// Install the default resolver, closing any previous one.
    ///
    /// # Errors
    ///
    /// Fails when the export does not validate; the previous resolver
    /// keeps serving in that case.
    pub async fn set_resolver(&self, export: &ResolverExport) -> DnsResult<()> {
        let resolver = resolver_from_export(export, &self.roots)?;

        let old = {
            let mut inner = self.inner.write().await;
            inner.resolver.replace(resolver)
        };
        if let Some(old) = old {
            old.close().await;
        }

        info!(resolver = %export.address, "set default resolver");
        Ok(())
    }

    /// Apply a partial route update.
    ///
    /// Empty `name`, absent `resolver`, and absent-or-empty `zones`
    /// leave the corresponding slot fields untouched; provided zones
    /// replace the route's zone trie wholesale.
    ///
    /// # Errors
    ///
    /// Fails on an out-of-range index (slot 0 is reserved) or an invalid
    /// resolver export.
    pub async fn set_route(&self, export: &RouteExport) -> DnsResult<()> {
        if export.index == 0 || export.index >= MAX_ROUTES {
            return Err(DnsError::config_field(
                format!("route index {} out of range 1..{MAX_ROUTES}", export.index),
                "route.index",
            ));
        }

        let new_resolver = export
            .resolver
            .as_ref()
            .map(|re| resolver_from_export(re, &self.roots))
            .transpose()?;

        let old = {
            let mut inner = self.inner.write().await;
            let route = inner.routes[export.index].get_or_insert_with(Route::empty);

            if !export.name.is_empty() {
                route.name = export.name.clone();
            }

            if let Some(zones) = export.zones.as_ref().filter(|z| !z.is_empty()) {
                let mut trie = DnsTrie::new();
                for zone in zones {
                    trie.add_zone(zone, ());
                }
                route.trie = trie;
            }

            match new_resolver {
                Some(resolver) => route.resolver.replace(resolver),
                None => None,
            }
        };
        if let Some(old) = old {
            old.close().await;
        }

        info!(index = export.index, "set route");
        Ok(())
    }

    /// Find the best-matched resolver for a query name (dotted raw-byte
    /// form).
    ///
    /// Routes are scanned in priority order and the first trie match
    /// wins, whether or not that route has a resolver installed; only
    /// unmatched names fall through to the default resolver.
    pub async fn resolver_for(&self, name: &[u8]) -> RouteMatch {
        let inner = self.inner.read().await;

        for (i, slot) in inner.routes.iter().enumerate().skip(1) {
            let Some(route) = slot else { continue };
            if route.trie.match_name(name).is_some() {
                return match &route.resolver {
                    Some(resolver) => RouteMatch::Resolver(Arc::clone(resolver), i as i32),
                    None => RouteMatch::NoResolver(i as i32),
                };
            }
        }

        match &inner.resolver {
            Some(resolver) => RouteMatch::Resolver(Arc::clone(resolver), -1),
            None => RouteMatch::None,
        }
    }

    /// Snapshot the router for external interactions.
    pub async fn export(&self) -> RouterExport {
        let inner = self.inner.read().await;

        let routes = inner
            .routes
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, slot)| {
                let route = slot.as_ref()?;
                Some(RouteExport {
                    index: i,
                    name: route.name.clone(),
                    resolver: route.resolver.as_ref().map(|r| r.export()),
                    zones: Some(
                        route
                            .trie
                            .export()
                            .into_iter()
                            .map(|(zone, ())| zone.to_string())
                            .collect(),
                    ),
                })
            })
            .collect();

        RouterExport {
            resolver: inner.resolver.as_ref().map(|r| r.export()),
            routes,
        }
    }

    /// Close the default resolver and every route resolver.
    pub async fn close(&self) {
        let resolvers: Vec<Arc<dyn Resolver>> = {
            let mut inner = self.inner.write().await;
            inner
                .resolver
                .take()
                .into_iter()
                .chain(
                    inner
                        .routes
                        .iter_mut()
                        .filter_map(|slot| slot.as_mut()?.resolver.take()),
                )
                .collect()
        };
        for resolver in resolvers {
            resolver.close().await;
        }
    }
}
