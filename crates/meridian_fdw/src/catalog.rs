//! Foreign server and user mapping definitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use meridian_common::error::FdwError;
use meridian_common::types::{ServerId, UserId, UserMappingId};

use crate::inval::{CatalogCache, CatalogInvalidation, InvalidationBus};

/// Options that configure the wrapper itself and are never passed to the
/// remote server as connection parameters.
const WRAPPER_OPTIONS: &[&str] = &[
    "password_required",
    "updatable",
    "use_remote_estimate",
    "fdw_startup_cost",
    "fdw_tuple_cost",
    "extensions",
    "fetch_size",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignServer {
    pub id: ServerId,
    pub name: String,
    pub options: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMapping {
    pub id: UserMappingId,
    pub server: ServerId,
    pub user: UserId,
    pub options: Vec<(String, String)>,
}

impl UserMapping {
    /// `password_required` defaults to true; only an explicit false lifts it.
    pub fn password_required(&self) -> bool {
        self.options
            .iter()
            .find(|(k, _)| k == "password_required")
            .map_or(true, |(_, v)| !matches!(v.as_str(), "false" | "off" | "no" | "0"))
    }
}

/// Syscache-style hash of a catalog row id. Zero is reserved for "reset
/// everything" invalidations.
pub fn catalog_hash(id: u32) -> u32 {
    match xxh3_64(&id.to_le_bytes()) as u32 {
        0 => 1,
        h => h,
    }
}

/// Keyword/value pairs handed to a [`Connector`](crate::link::Connector).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnParams {
    pub server_name: String,
    pub options: Vec<(String, String)>,
}

impl ConnParams {
    /// Server options, then user mapping options, then the fallback
    /// application name and client encoding.
    pub fn assemble(server: &ForeignServer, mapping: &UserMapping, application_name: &str) -> Self {
        let mut options: Vec<(String, String)> = server
            .options
            .iter()
            .chain(mapping.options.iter())
            .filter(|(k, _)| !WRAPPER_OPTIONS.contains(&k.as_str()))
            .cloned()
            .collect();
        options.push(("fallback_application_name".into(), application_name.into()));
        options.push(("client_encoding".into(), "UTF8".into()));
        Self {
            server_name: server.name.clone(),
            options,
        }
    }

    /// Last value wins, as with libpq keyword arrays.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_password(&self) -> bool {
        self.get("password").is_some_and(|p| !p.is_empty())
    }
}

/// Lookup side of the system catalogs the connection cache needs.
pub trait ForeignCatalog: Send + Sync {
    fn server(&self, id: ServerId) -> Result<ForeignServer, FdwError>;
    fn user_mapping(&self, id: UserMappingId) -> Result<UserMapping, FdwError>;
    fn is_superuser(&self, user: UserId) -> bool;
}

/// Catalog held in memory. Every change publishes an invalidation for the
/// changed row on the attached bus.
#[derive(Default)]
pub struct MemCatalog {
    servers: RwLock<HashMap<ServerId, ForeignServer>>,
    mappings: RwLock<HashMap<UserMappingId, UserMapping>>,
    superusers: RwLock<HashSet<UserId>>,
    bus: Option<Arc<InvalidationBus>>,
}

impl MemCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bus(bus: Arc<InvalidationBus>) -> Self {
        Self {
            bus: Some(bus),
            ..Self::default()
        }
    }

    pub fn upsert_server(&self, server: ForeignServer) {
        let hash = catalog_hash(server.id.0);
        self.servers.write().insert(server.id, server);
        self.publish(CatalogCache::ForeignServer, hash);
    }

    pub fn upsert_user_mapping(&self, mapping: UserMapping) {
        let hash = catalog_hash(mapping.id.0);
        self.mappings.write().insert(mapping.id, mapping);
        self.publish(CatalogCache::UserMapping, hash);
    }

    pub fn drop_user_mapping(&self, id: UserMappingId) {
        self.mappings.write().remove(&id);
        self.publish(CatalogCache::UserMapping, catalog_hash(id.0));
    }

    pub fn grant_superuser(&self, user: UserId) {
        self.superusers.write().insert(user);
    }

    fn publish(&self, cache: CatalogCache, hash: u32) {
        if let Some(bus) = &self.bus {
            bus.publish(CatalogInvalidation { cache, hash });
        }
    }
}

impl ForeignCatalog for MemCatalog {
    fn server(&self, id: ServerId) -> Result<ForeignServer, FdwError> {
        self.servers
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| FdwError::Catalog(format!("cache lookup failed for foreign server {id}")))
    }

    fn user_mapping(&self, id: UserMappingId) -> Result<UserMapping, FdwError> {
        self.mappings
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| FdwError::Catalog(format!("cache lookup failed for user mapping {id}")))
    }

    fn is_superuser(&self, user: UserId) -> bool {
        self.superusers.read().contains(&user)
    }
}
