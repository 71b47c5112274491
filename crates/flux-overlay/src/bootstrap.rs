//! Bootstrap (§4.4.2): derive rank, topology, cert, and parent connection
//! info before an [`crate::overlay::Overlay`] can be built, then publish the
//! derived `tbon.*`/`broker.*` attributes (§6) the rest of the broker reads
//! back.
//!
//! Two real providers: [`ConfigFileBootstrap`] (a hostname-to-rank map plus
//! a cert shared by the whole fleet) and [`PmiBootstrap`] (the two-barrier
//! "business card" exchange over an abstract key-value store). FLUB
//! late-join bootstrap is not implemented against this topology model; see
//! [`crate::dispatch`]'s `overlay.flub-*` handlers.

use std::path::PathBuf;

use flux_cert::Cert;
use flux_config::{AttrFlags, AttrStore, ConfigError, TbonSettings};
use flux_topology::{Scheme, Topology};
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;
use crate::overlay::Overlay;

/// Everything bootstrap resolves before the overlay core can be built.
pub struct Bootstrapped {
    pub rank: u32,
    pub size: u32,
    pub hostname: String,
    pub topology: Topology,
    pub cert: Cert,
    pub bind_uri: Option<String>,
    pub parent_uri: Option<String>,
    pub parent_public_key: Option<String>,
    /// Every hostname in rank order, for `broker.hostlist`.
    pub hostlist: Vec<String>,
    /// CURVE public keys bootstrap has already authorized for each direct
    /// child, for the caller to seed into [`crate::zap::Allowlist`] before
    /// the ROUTER socket binds.
    pub child_public_keys: Vec<(u32, String)>,
}

impl Bootstrapped {
    /// Build the overlay core from bootstrap results. `uuid` is this
    /// broker's own identity, generated by the binary crate and never
    /// derived here (bootstrap only knows ranks and hostnames).
    pub fn into_overlay(self, uuid: String, settings: TbonSettings) -> Overlay {
        let mut overlay = Overlay::new(
            self.rank,
            self.size,
            uuid,
            self.hostname,
            self.topology,
            self.cert,
            settings,
        );
        overlay.bind_uri = self.bind_uri;
        if let Some(parent) = overlay.parent.as_mut() {
            if let Some(uri) = self.parent_uri {
                parent.uri = uri;
            }
            if let Some(key) = self.parent_public_key {
                parent.public_key = key;
            }
        }
        overlay
    }
}

#[async_trait::async_trait]
pub trait BootstrapProvider {
    async fn bootstrap(&mut self, settings: &TbonSettings) -> Result<Bootstrapped, OverlayError>;
}

/// Write the derived attributes §4.4.2 lists after a successful bootstrap.
/// Called once, with `force` semantics for the READONLY entries it creates
/// (the broker itself is the only writer afterward).
pub fn publish_derived_attrs(store: &mut AttrStore, b: &Bootstrapped) -> Result<(), ConfigError> {
    store.add("rank", b.rank.to_string(), AttrFlags::IMMUTABLE | AttrFlags::READONLY)?;
    store.add("size", b.size.to_string(), AttrFlags::IMMUTABLE | AttrFlags::READONLY)?;
    store.add(
        "tbon.endpoint",
        b.bind_uri.clone().unwrap_or_default(),
        AttrFlags::READONLY,
    )?;
    store.add(
        "tbon.parent-endpoint",
        b.parent_uri.clone().unwrap_or_default(),
        AttrFlags::READONLY,
    )?;
    store.add("tbon.level", b.topology.get_level().to_string(), AttrFlags::READONLY)?;
    store.add(
        "tbon.maxlevel",
        b.topology.get_maxlevel().to_string(),
        AttrFlags::READONLY,
    )?;
    store.add(
        "tbon.descendants",
        b.topology.get_descendant_count().to_string(),
        AttrFlags::READONLY,
    )?;
    store.add("broker.hostlist", b.hostlist.join(","), AttrFlags::IMMUTABLE)?;
    store.add("broker.mapping", rfc29_mapping(b.hostlist.len()), AttrFlags::IMMUTABLE)?;
    Ok(())
}

/// A minimal RFC-29 compact process-to-node mapping: this broker runs a
/// single process per node, so the whole hostlist collapses to one run.
fn rfc29_mapping(node_count: usize) -> String {
    serde_json::json!([{ "nodeid": 0, "nbrokers": 1, "count": node_count }]).to_string()
}

/// One broker's entry in a config-file host map.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostEntry {
    pub hostname: String,
    /// `None` for a leaf: leaves never bind a ROUTER socket.
    pub bind_uri: Option<String>,
}

/// Config bootstrap (§4.4.2): hostnames map to rank indices by position in
/// `hosts`, every broker shares one cert loaded from disk, and each
/// broker's bind/parent URIs come straight out of the map.
pub struct ConfigFileBootstrap {
    hosts: Vec<HostEntry>,
    cert_path: PathBuf,
    local_hostname: String,
}

impl ConfigFileBootstrap {
    pub fn new(
        hosts: Vec<HostEntry>,
        cert_path: impl Into<PathBuf>,
        local_hostname: impl Into<String>,
    ) -> Self {
        Self {
            hosts,
            cert_path: cert_path.into(),
            local_hostname: local_hostname.into(),
        }
    }

    fn find_rank(&self) -> Result<u32, OverlayError> {
        self.hosts
            .iter()
            .position(|h| h.hostname == self.local_hostname)
            .map(|i| i as u32)
            .ok_or_else(|| OverlayError::HostnameMismatch {
                rank: 0,
                claimed: self.local_hostname.clone(),
                expected: "one of the configured hosts".to_string(),
            })
    }
}

#[async_trait::async_trait]
impl BootstrapProvider for ConfigFileBootstrap {
    async fn bootstrap(&mut self, settings: &TbonSettings) -> Result<Bootstrapped, OverlayError> {
        let rank = self.find_rank()?;
        let size = self.hosts.len() as u32;

        let scheme = Scheme::parse(&settings.topo)?;
        let mut topology = Topology::build(scheme, size as i64)?;
        topology.set_rank(rank)?;

        let cert = Cert::read(&self.cert_path)?;
        let bind_uri = self.hosts[rank as usize].bind_uri.clone();

        let (parent_uri, parent_public_key) = match topology.get_parent() {
            Some(parent_rank) => {
                let entry = &self.hosts[parent_rank as usize];
                let uri = entry.bind_uri.clone().ok_or_else(|| {
                    OverlayError::ParentUnreachable(format!("rank {parent_rank} has no bind uri"))
                })?;
                (Some(uri), cert.public_key().map(str::to_string))
            }
            None => (None, None),
        };

        // Every broker shares one cert, so each child is authorized under
        // the same key as everyone else.
        let shared_key = cert.public_key().unwrap_or_default().to_string();
        let child_public_keys = topology
            .get_child_ranks()
            .into_iter()
            .map(|r| (r, shared_key.clone()))
            .collect();

        Ok(Bootstrapped {
            rank,
            size,
            hostname: self.local_hostname.clone(),
            topology,
            cert,
            bind_uri,
            parent_uri,
            parent_public_key,
            hostlist: self.hosts.iter().map(|h| h.hostname.clone()).collect(),
            child_public_keys,
        })
    }
}

/// A broker's published identity during the PMI business-card exchange.
#[derive(Debug, Clone, Deserialize, Serialize)]
struct BusinessCard {
    hostname: String,
    public_key: String,
    bind_uri: Option<String>,
}

fn parse_card(raw: &str) -> Result<BusinessCard, OverlayError> {
    serde_json::from_str(raw).map_err(|e| OverlayError::Bootstrap(format!("malformed business card: {e}")))
}

fn card_key(rank: u32) -> String {
    format!("flux.tbon.card.{rank}")
}

/// The PMI key-value client itself is out of scope (§1): this trait is the
/// narrow slice of it the business-card exchange drives. `rank`/`size` come
/// from the PMI universe the binary crate already joined; `put`/`get` are a
/// flat string-keyed store; `barrier` blocks until every rank in the
/// universe has called it.
#[async_trait::async_trait]
pub trait PmiKvs: Send {
    async fn rank(&self) -> u32;
    async fn size(&self) -> u32;
    async fn put(&mut self, key: &str, value: String) -> Result<(), String>;
    async fn get(&mut self, key: &str) -> Result<String, String>;
    async fn barrier(&mut self) -> Result<(), String>;
}

/// PMI bootstrap (§4.4.2): each rank writes its own business card, barriers,
/// reads its parent's and every child's card (authorizing the children's
/// public keys), reads every remaining card to build the hostlist, then
/// barriers a second time before anyone is allowed to connect a socket.
pub struct PmiBootstrap<K> {
    kvs: K,
    hostname: String,
    bind_hint: Option<String>,
}

impl<K: PmiKvs> PmiBootstrap<K> {
    /// `bind_hint` is this broker's own bind URI, used only if the topology
    /// turns out to give it children; leaves publish no bind URI.
    pub fn new(kvs: K, hostname: impl Into<String>, bind_hint: Option<String>) -> Self {
        Self {
            kvs,
            hostname: hostname.into(),
            bind_hint,
        }
    }
}

#[async_trait::async_trait]
impl<K: PmiKvs + Send> BootstrapProvider for PmiBootstrap<K> {
    async fn bootstrap(&mut self, settings: &TbonSettings) -> Result<Bootstrapped, OverlayError> {
        let rank = self.kvs.rank().await;
        let size = self.kvs.size().await;

        let scheme = Scheme::parse(&settings.topo)?;
        let mut topology = Topology::build(scheme, size as i64)?;
        topology.set_rank(rank)?;

        let cert = Cert::create()?;
        let is_leaf = topology.get_child_ranks().is_empty();
        let bind_uri = if is_leaf { None } else { self.bind_hint.clone() };

        let card = BusinessCard {
            hostname: self.hostname.clone(),
            public_key: cert.public_key().unwrap_or_default().to_string(),
            bind_uri: bind_uri.clone(),
        };
        let card_json =
            serde_json::to_string(&card).map_err(|e| OverlayError::Bootstrap(e.to_string()))?;
        self.kvs
            .put(&card_key(rank), card_json)
            .await
            .map_err(OverlayError::Bootstrap)?;
        self.kvs.barrier().await.map_err(OverlayError::Bootstrap)?;

        let parent_card = match topology.get_parent() {
            Some(parent_rank) => {
                let raw = self
                    .kvs
                    .get(&card_key(parent_rank))
                    .await
                    .map_err(OverlayError::Bootstrap)?;
                Some(parse_card(&raw)?)
            }
            None => None,
        };

        // Reading a child's card is what authorizes its public key; the ZAP
        // handler (crate::zap) consults the set of keys collected here.
        let mut child_public_keys = Vec::new();
        for child_rank in topology.get_child_ranks() {
            let raw = self
                .kvs
                .get(&card_key(child_rank))
                .await
                .map_err(OverlayError::Bootstrap)?;
            let card = parse_card(&raw)?;
            child_public_keys.push((child_rank, card.public_key));
        }

        let mut hostlist = Vec::with_capacity(size as usize);
        for r in 0..size {
            if r == rank {
                hostlist.push(self.hostname.clone());
                continue;
            }
            let raw = self
                .kvs
                .get(&card_key(r))
                .await
                .map_err(OverlayError::Bootstrap)?;
            hostlist.push(parse_card(&raw)?.hostname);
        }

        self.kvs.barrier().await.map_err(OverlayError::Bootstrap)?;

        let (parent_uri, parent_public_key) = match parent_card {
            Some(card) => {
                let parent_rank = topology.get_parent().expect("parent_card implies a parent rank");
                let uri = card.bind_uri.ok_or_else(|| {
                    OverlayError::ParentUnreachable(format!("rank {parent_rank} published no bind uri"))
                })?;
                (Some(uri), Some(card.public_key))
            }
            None => (None, None),
        };

        Ok(Bootstrapped {
            rank,
            size,
            hostname: self.hostname.clone(),
            topology,
            cert,
            bind_uri,
            parent_uri,
            parent_public_key,
            hostlist,
            child_public_keys,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{Barrier, Mutex};

    fn two_host_map() -> Vec<HostEntry> {
        vec![
            HostEntry {
                hostname: "node0".to_string(),
                bind_uri: Some("tcp://node0:9000".to_string()),
            },
            HostEntry {
                hostname: "node1".to_string(),
                bind_uri: None,
            },
        ]
    }

    #[tokio::test]
    async fn config_bootstrap_resolves_rank_from_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cluster.cert");
        Cert::create().unwrap().write(&cert_path).unwrap();

        let mut provider = ConfigFileBootstrap::new(two_host_map(), &cert_path, "node1");
        let b = provider.bootstrap(&TbonSettings::default()).await.unwrap();

        assert_eq!(b.rank, 1);
        assert_eq!(b.size, 2);
        assert_eq!(b.parent_uri.as_deref(), Some("tcp://node0:9000"));
        assert_eq!(b.bind_uri, None);
        assert_eq!(b.hostlist, vec!["node0".to_string(), "node1".to_string()]);
    }

    #[tokio::test]
    async fn config_bootstrap_rejects_unknown_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cluster.cert");
        Cert::create().unwrap().write(&cert_path).unwrap();

        let mut provider = ConfigFileBootstrap::new(two_host_map(), &cert_path, "not-a-node");
        let err = provider.bootstrap(&TbonSettings::default()).await.unwrap_err();
        assert!(matches!(err, OverlayError::HostnameMismatch { .. }));
    }

    #[tokio::test]
    async fn config_bootstrap_root_has_no_parent() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cluster.cert");
        Cert::create().unwrap().write(&cert_path).unwrap();

        let mut provider = ConfigFileBootstrap::new(two_host_map(), &cert_path, "node0");
        let b = provider.bootstrap(&TbonSettings::default()).await.unwrap();
        assert_eq!(b.rank, 0);
        assert!(b.parent_uri.is_none());
        assert_eq!(b.bind_uri.as_deref(), Some("tcp://node0:9000"));
        assert_eq!(b.child_public_keys, vec![(1, b.cert.public_key().unwrap().to_string())]);
    }

    #[test]
    fn publish_derived_attrs_writes_every_tbon_and_broker_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cluster.cert");
        Cert::create().unwrap().write(&cert_path).unwrap();

        let mut topo = Topology::from_uri("kary:2", 3).unwrap();
        topo.set_rank(0).unwrap();
        let b = Bootstrapped {
            rank: 0,
            size: 3,
            hostname: "node0".to_string(),
            topology: topo,
            cert: Cert::read(&cert_path).unwrap(),
            bind_uri: Some("tcp://node0:9000".to_string()),
            parent_uri: None,
            parent_public_key: None,
            hostlist: vec!["node0".into(), "node1".into(), "node2".into()],
            child_public_keys: Vec::new(),
        };

        let mut store = AttrStore::new();
        publish_derived_attrs(&mut store, &b).unwrap();

        assert_eq!(store.get("rank").unwrap().0, "0");
        assert_eq!(store.get("tbon.endpoint").unwrap().0, "tcp://node0:9000");
        assert_eq!(store.get("tbon.parent-endpoint").unwrap().0, "");
        assert_eq!(store.get("tbon.level").unwrap().0, "0");
        assert_eq!(store.get("tbon.descendants").unwrap().0, "2");
        assert_eq!(store.get("broker.hostlist").unwrap().0, "node0,node1,node2");
        assert!(store.get("broker.mapping").unwrap().0.contains("\"count\":3"));
    }

    #[derive(Clone)]
    struct InMemoryKvs {
        rank: u32,
        size: u32,
        store: Arc<Mutex<HashMap<String, String>>>,
        barrier: Arc<Barrier>,
    }

    #[async_trait::async_trait]
    impl PmiKvs for InMemoryKvs {
        async fn rank(&self) -> u32 {
            self.rank
        }

        async fn size(&self) -> u32 {
            self.size
        }

        async fn put(&mut self, key: &str, value: String) -> Result<(), String> {
            self.store.lock().await.insert(key.to_string(), value);
            Ok(())
        }

        async fn get(&mut self, key: &str) -> Result<String, String> {
            self.store
                .lock()
                .await
                .get(key)
                .cloned()
                .ok_or_else(|| format!("no such key {key}"))
        }

        async fn barrier(&mut self) -> Result<(), String> {
            self.barrier.wait().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn pmi_bootstrap_three_ranks_agree_on_topology() {
        let size = 3u32;
        let store = Arc::new(Mutex::new(HashMap::new()));
        let barrier = Arc::new(Barrier::new(size as usize));

        let mut handles = Vec::new();
        for rank in 0..size {
            let kvs = InMemoryKvs {
                rank,
                size,
                store: store.clone(),
                barrier: barrier.clone(),
            };
            let bind_hint = Some(format!("tcp://node{rank}:9000"));
            let mut provider = PmiBootstrap::new(kvs, format!("node{rank}"), bind_hint);
            handles.push(tokio::spawn(async move {
                let settings = TbonSettings {
                    topo: "kary:2".to_string(),
                    ..Default::default()
                };
                provider.bootstrap(&settings).await
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }
        results.sort_by_key(|b| b.rank);

        assert!(results[0].parent_uri.is_none());
        assert_eq!(results[0].hostlist.len(), 3);
        assert_eq!(results[1].parent_uri.as_deref(), Some("tcp://node0:9000"));
        assert_eq!(results[2].parent_uri.as_deref(), Some("tcp://node0:9000"));
        // Both are leaves under kary:2 at size 3, so neither binds.
        assert!(results[1].bind_uri.is_none());
        assert!(results[2].bind_uri.is_none());

        let mut authorized: Vec<u32> = results[0]
            .child_public_keys
            .iter()
            .map(|(rank, _)| *rank)
            .collect();
        authorized.sort_unstable();
        assert_eq!(authorized, vec![1, 2]);
        let key_for_rank1 = &results[0].child_public_keys.iter().find(|(r, _)| *r == 1).unwrap().1;
        assert_eq!(key_for_rank1, results[1].cert.public_key().unwrap());
    }
}
