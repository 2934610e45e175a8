//! In-process simulated network.
//!
//! [`SimulatedNetwork`] generates a population of keypair-backed peers from a
//! seeded RNG, gives every peer a routing table filled with the others
//! (subject to bucket capacity), and answers FIND_NODES from those tables.
//! Per-peer failures and latencies can be injected; calls are counted.
//!
//! Used by the `kadwalk` binary and the integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::debug;

use crate::config::DEFAULT_K;
use crate::identity::{sort_by_distance, Contact, Identity, Keypair};
use crate::protocols::FindNodesRpc;
use crate::routing::RoutingTable;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub nodes: usize,
    /// Bucket size of every peer's routing table, and how many contacts a
    /// peer returns per FIND_NODES.
    pub k: usize,
    /// Fraction of peers (other than peer 0) that fail every RPC.
    pub failure_rate: f64,
    /// Each peer gets a fixed latency drawn uniformly from `[0, max_latency]`.
    pub max_latency: Duration,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            nodes: 200,
            k: DEFAULT_K,
            failure_rate: 0.0,
            max_latency: Duration::ZERO,
            seed: 0,
        }
    }
}

#[derive(Debug)]
pub struct SimPeer {
    pub contact: Contact,
    pub routing: Arc<RwLock<RoutingTable>>,
}

pub struct SimulatedNetwork {
    peers: HashMap<Identity, SimPeer>,
    order: Vec<Identity>,
    k: usize,
    failures: Mutex<HashSet<Identity>>,
    latencies: Mutex<HashMap<Identity, Duration>>,
    calls: AtomicUsize,
}

impl SimulatedNetwork {
    /// Build a network from `config`. The same seed always yields the same
    /// identities, tables, failures and latencies.
    pub fn generate(config: &SimConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);

        let contacts: Vec<Contact> = (0..config.nodes)
            .map(|index| {
                let keypair = Keypair::generate_from(&mut rng);
                keypair.create_contact(sim_addr(index))
            })
            .collect();

        let mut peers = HashMap::with_capacity(contacts.len());
        let mut order = Vec::with_capacity(contacts.len());
        for contact in &contacts {
            let mut table = RoutingTable::new(contact.identity, config.k);
            for other in &contacts {
                table.update(other.clone());
            }
            order.push(contact.identity);
            peers.insert(
                contact.identity,
                SimPeer {
                    contact: contact.clone(),
                    routing: Arc::new(RwLock::new(table)),
                },
            );
        }

        let failure_rate = if config.failure_rate.is_nan() {
            0.0
        } else {
            config.failure_rate.clamp(0.0, 1.0)
        };
        let failures: HashSet<Identity> = order
            .iter()
            .skip(1)
            .filter(|_| rng.gen_bool(failure_rate))
            .copied()
            .collect();

        let max_ms = config.max_latency.as_millis() as u64;
        let latencies: HashMap<Identity, Duration> = if max_ms == 0 {
            HashMap::new()
        } else {
            order
                .iter()
                .map(|id| (*id, Duration::from_millis(rng.gen_range(0..=max_ms))))
                .collect()
        };

        debug!(
            nodes = order.len(),
            failed = failures.len(),
            k = config.k,
            seed = config.seed,
            "simulated network generated"
        );

        Self {
            peers,
            order,
            k: config.k,
            failures: Mutex::new(failures),
            latencies: Mutex::new(latencies),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Peer by generation index.
    pub fn peer(&self, index: usize) -> Option<&SimPeer> {
        self.order.get(index).and_then(|id| self.peers.get(id))
    }

    pub fn get(&self, identity: &Identity) -> Option<&SimPeer> {
        self.peers.get(identity)
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.order
            .iter()
            .filter_map(|id| self.peers.get(id))
            .map(|peer| peer.contact.clone())
            .collect()
    }

    pub async fn set_failure(&self, node: Identity, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(node);
        } else {
            failures.remove(&node);
        }
    }

    pub async fn set_latency(&self, node: Identity, latency: Duration) {
        self.latencies.lock().await.insert(node, latency);
    }

    pub async fn is_failed(&self, node: &Identity) -> bool {
        self.failures.lock().await.contains(node)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// The `count` responsive peers nearest `target`, skipping `exclude`.
    /// This is the answer a perfect lookup would give.
    pub async fn closest_alive(
        &self,
        target: &Identity,
        count: usize,
        exclude: &HashSet<Identity>,
    ) -> Vec<Contact> {
        let failures = self.failures.lock().await;
        let mut alive: Vec<Contact> = self
            .peers
            .values()
            .filter(|peer| {
                !failures.contains(&peer.contact.identity)
                    && !exclude.contains(&peer.contact.identity)
            })
            .map(|peer| peer.contact.clone())
            .collect();
        sort_by_distance(&mut alive, target);
        alive.truncate(count);
        alive
    }
}

#[async_trait]
impl FindNodesRpc for SimulatedNetwork {
    async fn find_nodes(&self, to: &Contact, target: Identity) -> Result<Vec<Contact>> {
        self.calls.fetch_add(1, Ordering::Relaxed);

        let delay = self.latencies.lock().await.get(&to.identity).copied();
        if let Some(delay) = delay
            && !delay.is_zero()
        {
            sleep(delay).await;
        }
        if self.failures.lock().await.contains(&to.identity) {
            return Err(anyhow!("injected network failure"));
        }

        let peer = self
            .peers
            .get(&to.identity)
            .ok_or_else(|| anyhow!("peer not reachable"))?;
        let table = peer
            .routing
            .read()
            .map_err(|_| anyhow!("routing table lock poisoned"))?;
        Ok(table.closest(&target, self.k))
    }
}

fn sim_addr(index: usize) -> String {
    let hi = ((index >> 8) & 0xFF) as u8;
    let lo = (index & 0xFF) as u8;
    format!("10.{hi}.{lo}.1:9001")
}
