//! Namespace registry.
//!
//! Static mapping from service namespace name to its network-namespace
//! file and the set of peer namespaces it is permitted to reach. Built
//! once from the deployment configuration and immutable for the process
//! lifetime; there is no mutation API, so concurrent lookups require no
//! locking and can never observe a partial update.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::DeploymentConfig;

/// A single network namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    /// Namespace identifier.
    pub name: String,

    /// Link-local address of the confined service.
    pub address: String,

    /// Namespaces this one is permitted to reach. Directed: membership
    /// here says nothing about the reverse direction.
    pub peers: BTreeSet<String>,
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The named namespace is not in the registry.
    #[error("unknown namespace '{name}'")]
    UnknownNamespace {
        /// The requested namespace name.
        name: String,
    },
}

/// Immutable registry of network namespaces.
#[derive(Debug, Clone)]
pub struct NamespaceRegistry {
    netns_dir: PathBuf,
    namespaces: BTreeMap<String, Namespace>,
}

impl NamespaceRegistry {
    /// Build the registry from a validated deployment configuration.
    #[must_use]
    pub fn from_config(config: &DeploymentConfig) -> Self {
        let namespaces = config
            .namespaces
            .iter()
            .map(|ns| {
                (
                    ns.name.clone(),
                    Namespace {
                        name: ns.name.clone(),
                        address: ns.address.clone(),
                        peers: ns.peers.iter().cloned().collect(),
                    },
                )
            })
            .collect();

        Self {
            netns_dir: config.gateway.netns_dir.clone(),
            namespaces,
        }
    }

    /// Look up a namespace by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Namespace> {
        self.namespaces.get(name)
    }

    /// The set of namespaces `name` is permitted to reach.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::UnknownNamespace` if `name` is not
    /// registered.
    pub fn permitted_peers(&self, name: &str) -> Result<&BTreeSet<String>, RegistryError> {
        self.namespaces
            .get(name)
            .map(|ns| &ns.peers)
            .ok_or_else(|| RegistryError::UnknownNamespace {
                name: name.to_string(),
            })
    }

    /// Whether `from` is permitted to reach `to`.
    ///
    /// Unknown namespaces are not permitted peers of anything.
    #[must_use]
    pub fn is_permitted_peer(&self, from: &str, to: &str) -> bool {
        self.namespaces
            .get(from)
            .is_some_and(|ns| ns.peers.contains(to))
    }

    /// Iterate over registered namespaces in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Namespace> {
        self.namespaces.values()
    }

    /// Registered namespace names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// Path of the network-namespace file for `name`.
    #[must_use]
    pub fn netns_path(&self, name: &str) -> PathBuf {
        self.netns_dir.join(name)
    }

    /// Directory holding the network-namespace files.
    #[must_use]
    pub fn netns_dir(&self) -> &Path {
        &self.netns_dir
    }

    /// Number of registered namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CallerConfig, GatewayConfig, NamespaceConfig};

    fn registry() -> NamespaceRegistry {
        let config = DeploymentConfig {
            gateway: GatewayConfig::default(),
            namespaces: vec![
                NamespaceConfig {
                    name: "nb-bitcoind".to_string(),
                    address: "169.254.1.12".to_string(),
                    peers: vec!["nb-clightning".to_string(), "nb-liquidd".to_string()],
                },
                NamespaceConfig {
                    name: "nb-clightning".to_string(),
                    address: "169.254.1.13".to_string(),
                    peers: vec!["nb-bitcoind".to_string()],
                },
                NamespaceConfig {
                    name: "nb-liquidd".to_string(),
                    address: "169.254.1.15".to_string(),
                    peers: vec![],
                },
            ],
            callers: vec![CallerConfig {
                user: "operator".to_string(),
                namespaces: vec!["nb-bitcoind".to_string()],
            }],
            ..Default::default()
        };
        NamespaceRegistry::from_config(&config)
    }

    #[test]
    fn test_lookup_and_peers() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        let peers = registry.permitted_peers("nb-bitcoind").unwrap();
        assert!(peers.contains("nb-clightning"));
        assert!(peers.contains("nb-liquidd"));
    }

    #[test]
    fn test_peer_sets_are_directed() {
        let registry = registry();
        // bitcoind may reach liquidd, liquidd may not reach bitcoind back.
        assert!(registry.is_permitted_peer("nb-bitcoind", "nb-liquidd"));
        assert!(!registry.is_permitted_peer("nb-liquidd", "nb-bitcoind"));
    }

    #[test]
    fn test_unknown_namespace() {
        let registry = registry();
        assert!(registry.get("nb-nanopos").is_none());
        assert!(matches!(
            registry.permitted_peers("nb-nanopos"),
            Err(RegistryError::UnknownNamespace { .. })
        ));
        assert!(!registry.is_permitted_peer("nb-nanopos", "nb-bitcoind"));
    }

    #[test]
    fn test_netns_path() {
        let registry = registry();
        assert_eq!(
            registry.netns_path("nb-bitcoind"),
            PathBuf::from("/run/netns/nb-bitcoind")
        );
    }
}
