// Load-balancing policies
//
// A policy classifies hosts by distance and produces, per request, a lazy
// one-shot iterator of candidate coordinators (the query plan). Plans are
// drained by the executor; replaying a request means asking for a fresh
// plan.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;

use crate::cluster::{Host, HostDistance, HostRegistry, ReplicaOracle, Token};
use crate::error::{DriverError, Result};

/// Routing inputs extracted from one request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestInfo<'a> {
    pub keyspace: Option<&'a str>,
    pub routing_token: Option<Token>,
}

/// A lazy, one-shot iterator of candidate hosts.
pub type QueryPlan = Box<dyn Iterator<Item = Arc<Host>> + Send>;

pub trait LoadBalancingPolicy: Send + Sync {
    /// Called once when the session comes up, before any plan is requested.
    fn init(&self, registry: &Arc<HostRegistry>) -> Result<()>;

    fn distance(&self, host: &Host) -> HostDistance;

    fn new_query_plan(&self, request: &RequestInfo<'_>) -> QueryPlan;
}

fn sorted_up_hosts(registry: &Option<Arc<HostRegistry>>) -> Vec<Arc<Host>> {
    let mut hosts = registry
        .as_ref()
        .map(|r| r.up_hosts())
        .unwrap_or_default();
    hosts.sort_by_key(|host| host.address());
    hosts
}

fn rotate<T>(items: &mut Vec<T>, by: usize) {
    if !items.is_empty() {
        let by = by % items.len();
        items.rotate_left(by);
    }
}

// ---------------------------------------------------------------------------
// Round robin
// ---------------------------------------------------------------------------

/// Cycles through every Up host, no locality.
pub struct RoundRobinPolicy {
    registry: RwLock<Option<Arc<HostRegistry>>>,
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        RoundRobinPolicy {
            registry: RwLock::new(None),
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        RoundRobinPolicy::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn init(&self, registry: &Arc<HostRegistry>) -> Result<()> {
        *self.registry.write() = Some(Arc::clone(registry));
        Ok(())
    }

    fn distance(&self, _host: &Host) -> HostDistance {
        HostDistance::Local
    }

    fn new_query_plan(&self, _request: &RequestInfo<'_>) -> QueryPlan {
        let mut hosts = sorted_up_hosts(&self.registry.read());
        rotate(&mut hosts, self.index.fetch_add(1, Ordering::Relaxed));
        Box::new(hosts.into_iter())
    }
}

// ---------------------------------------------------------------------------
// DC-aware round robin
// ---------------------------------------------------------------------------

/// Local-datacenter hosts first, then up to N hosts from each remote
/// datacenter.
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    used_hosts_per_remote_dc: usize,
    registry: RwLock<Option<Arc<HostRegistry>>>,
    index: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>) -> Self {
        DcAwareRoundRobinPolicy::with_remote_hosts(local_dc, 0)
    }

    pub fn with_remote_hosts(local_dc: impl Into<String>, used_hosts_per_remote_dc: usize) -> Self {
        DcAwareRoundRobinPolicy {
            local_dc: local_dc.into(),
            used_hosts_per_remote_dc,
            registry: RwLock::new(None),
            index: AtomicUsize::new(0),
        }
    }

    /// Remote hosts of a dc, sorted; only the first N count as Remote.
    fn remote_rank(&self, host: &Host) -> Option<usize> {
        let registry = self.registry.read();
        let registry = registry.as_ref()?;
        let dc = host.datacenter()?;
        let mut peers: Vec<SocketAddr> = registry
            .hosts()
            .into_iter()
            .filter(|peer| peer.datacenter().as_deref() == Some(dc.as_str()))
            .map(|peer| peer.address())
            .collect();
        peers.sort();
        peers.iter().position(|addr| *addr == host.address())
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn init(&self, registry: &Arc<HostRegistry>) -> Result<()> {
        if self.local_dc.is_empty() {
            return Err(DriverError::Argument(
                "DcAwareRoundRobinPolicy requires a local datacenter name".to_string(),
            ));
        }
        let mut detected: Vec<String> = registry
            .hosts()
            .iter()
            .filter_map(|host| host.datacenter())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        detected.sort();
        if !detected.iter().any(|dc| dc == &self.local_dc) {
            return Err(DriverError::Argument(format!(
                "local datacenter '{}' does not match any discovered datacenter (found: {})",
                self.local_dc,
                detected.join(", ")
            )));
        }
        *self.registry.write() = Some(Arc::clone(registry));
        Ok(())
    }

    fn distance(&self, host: &Host) -> HostDistance {
        match host.datacenter() {
            Some(dc) if dc == self.local_dc => HostDistance::Local,
            Some(_) if self.used_hosts_per_remote_dc > 0 => {
                match self.remote_rank(host) {
                    Some(rank) if rank < self.used_hosts_per_remote_dc => HostDistance::Remote,
                    _ => HostDistance::Ignored,
                }
            }
            _ => HostDistance::Ignored,
        }
    }

    fn new_query_plan(&self, _request: &RequestInfo<'_>) -> QueryPlan {
        let all = sorted_up_hosts(&self.registry.read());
        let mut local: Vec<Arc<Host>> = Vec::new();
        let mut remote_by_dc: HashMap<String, Vec<Arc<Host>>> = HashMap::new();
        for host in all {
            match host.datacenter() {
                Some(dc) if dc == self.local_dc => local.push(host),
                Some(dc) if self.used_hosts_per_remote_dc > 0 => {
                    let bucket = remote_by_dc.entry(dc).or_default();
                    if bucket.len() < self.used_hosts_per_remote_dc {
                        bucket.push(host);
                    }
                }
                _ => {}
            }
        }
        rotate(&mut local, self.index.fetch_add(1, Ordering::Relaxed));
        let mut remote_dcs: Vec<String> = remote_by_dc.keys().cloned().collect();
        remote_dcs.sort();
        let remote = remote_dcs
            .into_iter()
            .flat_map(move |dc| remote_by_dc.remove(&dc).unwrap_or_default().into_iter());
        Box::new(local.into_iter().chain(remote))
    }
}

// ---------------------------------------------------------------------------
// Token aware
// ---------------------------------------------------------------------------

/// Wraps a child policy; when a request carries a routing token, the
/// keyspace's local replicas are tried first in a randomized order, then
/// the child plan minus the hosts already yielded.
pub struct TokenAwarePolicy {
    child: Arc<dyn LoadBalancingPolicy>,
    oracle: Arc<dyn ReplicaOracle>,
}

impl TokenAwarePolicy {
    pub fn new(child: Arc<dyn LoadBalancingPolicy>, oracle: Arc<dyn ReplicaOracle>) -> Self {
        TokenAwarePolicy { child, oracle }
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn init(&self, registry: &Arc<HostRegistry>) -> Result<()> {
        self.child.init(registry)
    }

    fn distance(&self, host: &Host) -> HostDistance {
        self.child.distance(host)
    }

    fn new_query_plan(&self, request: &RequestInfo<'_>) -> QueryPlan {
        let (Some(keyspace), Some(token)) = (request.keyspace, request.routing_token) else {
            return self.child.new_query_plan(request);
        };
        let mut replicas: Vec<Arc<Host>> = self
            .oracle
            .replicas(keyspace, token)
            .into_iter()
            .filter(|host| host.is_up() && self.child.distance(host) == HostDistance::Local)
            .collect();
        // Randomized but fair: every replica leads an equal share of plans
        replicas.shuffle(&mut rand::thread_rng());

        Box::new(DedupedChain {
            head: replicas.into_iter(),
            yielded: HashSet::new(),
            tail: self.child.new_query_plan(request),
        })
    }
}

/// Emits `head`, then `tail` minus anything already emitted.
struct DedupedChain {
    head: std::vec::IntoIter<Arc<Host>>,
    yielded: HashSet<SocketAddr>,
    tail: QueryPlan,
}

impl Iterator for DedupedChain {
    type Item = Arc<Host>;

    fn next(&mut self) -> Option<Arc<Host>> {
        if let Some(host) = self.head.next() {
            self.yielded.insert(host.address());
            return Some(host);
        }
        loop {
            let host = self.tail.next()?;
            if !self.yielded.contains(&host.address()) {
                return Some(host);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Allow list
// ---------------------------------------------------------------------------

/// Restricts a child policy to an explicit set of endpoints.
pub struct AllowListPolicy {
    child: Arc<dyn LoadBalancingPolicy>,
    allowed: HashSet<SocketAddr>,
}

impl AllowListPolicy {
    pub fn new(child: Arc<dyn LoadBalancingPolicy>, allowed: Vec<SocketAddr>) -> Self {
        AllowListPolicy {
            child,
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl LoadBalancingPolicy for AllowListPolicy {
    fn init(&self, registry: &Arc<HostRegistry>) -> Result<()> {
        if self.allowed.is_empty() {
            return Err(DriverError::Argument(
                "AllowListPolicy requires at least one allowed endpoint".to_string(),
            ));
        }
        self.child.init(registry)
    }

    fn distance(&self, host: &Host) -> HostDistance {
        if self.allowed.contains(&host.address()) {
            self.child.distance(host)
        } else {
            HostDistance::Ignored
        }
    }

    fn new_query_plan(&self, request: &RequestInfo<'_>) -> QueryPlan {
        let allowed = self.allowed.clone();
        Box::new(
            self.child
                .new_query_plan(request)
                .filter(move |host| allowed.contains(&host.address())),
        )
    }
}

// ---------------------------------------------------------------------------
// Default policy
// ---------------------------------------------------------------------------

/// The composed stock policy: local-datacenter only, token aware, with a
/// power-of-two-choices pick among the first replicas so a busy or slow
/// replica is not hammered while an idle one waits.
pub struct DefaultLoadBalancingPolicy {
    configured_dc: Option<String>,
    local_dc: RwLock<Option<String>>,
    oracle: Arc<dyn ReplicaOracle>,
    registry: RwLock<Option<Arc<HostRegistry>>>,
    index: AtomicUsize,
    /// In-flight count above which a replica is considered busy and moved
    /// behind its alternative.
    busy_threshold: usize,
}

impl DefaultLoadBalancingPolicy {
    pub fn new(local_dc: Option<String>, oracle: Arc<dyn ReplicaOracle>) -> Self {
        DefaultLoadBalancingPolicy {
            configured_dc: local_dc,
            local_dc: RwLock::new(None),
            oracle,
            registry: RwLock::new(None),
            index: AtomicUsize::new(0),
            busy_threshold: 32,
        }
    }

    fn host_load(host: &Host) -> usize {
        host.pool().map(|pool| pool.total_in_flight()).unwrap_or(0)
    }

    fn is_local(&self, host: &Host) -> bool {
        match (&*self.local_dc.read(), host.datacenter()) {
            (Some(local), Some(dc)) => *local == dc,
            _ => false,
        }
    }
}

impl LoadBalancingPolicy for DefaultLoadBalancingPolicy {
    fn init(&self, registry: &Arc<HostRegistry>) -> Result<()> {
        let mut detected: Vec<String> = registry
            .hosts()
            .iter()
            .filter_map(|host| host.datacenter())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        detected.sort();

        let local = match &self.configured_dc {
            Some(dc) => {
                if !detected.iter().any(|detected_dc| detected_dc == dc) {
                    return Err(DriverError::Argument(format!(
                        "local datacenter '{dc}' does not match any discovered datacenter (found: {})",
                        detected.join(", ")
                    )));
                }
                dc.clone()
            }
            // Discover: a single-dc cluster needs no configuration
            None => match detected.as_slice() {
                [only] => only.clone(),
                [] => {
                    return Err(DriverError::Argument(
                        "no datacenter information discovered; set the local datacenter explicitly"
                            .to_string(),
                    ))
                }
                many => {
                    return Err(DriverError::Argument(format!(
                        "multiple datacenters discovered ({}); set the local datacenter explicitly",
                        many.join(", ")
                    )))
                }
            },
        };
        *self.local_dc.write() = Some(local);
        *self.registry.write() = Some(Arc::clone(registry));
        Ok(())
    }

    fn distance(&self, host: &Host) -> HostDistance {
        if self.is_local(host) {
            HostDistance::Local
        } else {
            HostDistance::Ignored
        }
    }

    fn new_query_plan(&self, request: &RequestInfo<'_>) -> QueryPlan {
        let mut local: Vec<Arc<Host>> = sorted_up_hosts(&self.registry.read())
            .into_iter()
            .filter(|host| self.is_local(host))
            .collect();
        rotate(&mut local, self.index.fetch_add(1, Ordering::Relaxed));

        let (Some(keyspace), Some(token)) = (request.keyspace, request.routing_token) else {
            return Box::new(local.into_iter());
        };

        let mut replicas: Vec<Arc<Host>> = self
            .oracle
            .replicas(keyspace, token)
            .into_iter()
            .filter(|host| host.is_up() && self.is_local(host))
            .collect();
        replicas.shuffle(&mut rand::thread_rng());

        // Power-of-two choices between the leading replicas, with a busy
        // penalty demoting overloaded ones
        if replicas.len() >= 2 {
            let first_load = Self::host_load(&replicas[0]);
            let second_load = Self::host_load(&replicas[1]);
            if first_load > second_load || first_load > self.busy_threshold {
                replicas.swap(0, 1);
            }
        }

        Box::new(DedupedChain {
            head: replicas.into_iter(),
            yielded: HashSet::new(),
            tail: Box::new(local.into_iter()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StaticReplicaMap;

    fn registry_with(hosts: &[Arc<Host>]) -> Arc<HostRegistry> {
        let (registry, _events) = HostRegistry::new();
        for host in hosts {
            let added = registry.add(host.address());
            added.set_metadata(host.datacenter(), host.rack(), host.tokens(), None);
            registry.set_up(host.address());
        }
        registry
    }

    fn plan_addresses(plan: QueryPlan) -> Vec<SocketAddr> {
        plan.map(|host| host.address()).collect()
    }

    #[test]
    fn test_round_robin_rotates() {
        let hosts = vec![
            Host::for_tests("127.0.0.1:9042", &[]),
            Host::for_tests("127.0.0.2:9042", &[]),
            Host::for_tests("127.0.0.3:9042", &[]),
        ];
        let registry = registry_with(&hosts);
        let policy = RoundRobinPolicy::new();
        policy.init(&registry).unwrap();

        let first = plan_addresses(policy.new_query_plan(&RequestInfo::default()));
        let second = plan_addresses(policy.new_query_plan(&RequestInfo::default()));
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 3);
        // Rotation: the second plan starts where the first plan's second
        // entry was
        assert_eq!(second[0], first[1]);
    }

    #[test]
    fn test_dc_aware_requires_known_dc() {
        let hosts = vec![
            Host::for_tests_in_dc("127.0.0.1:9042", "dc1"),
            Host::for_tests_in_dc("127.0.0.2:9042", "dc2"),
        ];
        let registry = registry_with(&hosts);

        let policy = DcAwareRoundRobinPolicy::new("dc9");
        let error = policy.init(&registry).unwrap_err();
        match error {
            DriverError::Argument(message) => {
                assert!(message.contains("dc9"));
                assert!(message.contains("dc1"));
                assert!(message.contains("dc2"));
            }
            other => panic!("expected argument error, got {other:?}"),
        }
    }

    #[test]
    fn test_dc_aware_orders_local_first() {
        let hosts = vec![
            Host::for_tests_in_dc("127.0.0.1:9042", "dc1"),
            Host::for_tests_in_dc("127.0.0.2:9042", "dc2"),
            Host::for_tests_in_dc("127.0.0.3:9042", "dc1"),
        ];
        let registry = registry_with(&hosts);
        let policy = DcAwareRoundRobinPolicy::with_remote_hosts("dc1", 1);
        policy.init(&registry).unwrap();

        let plan = plan_addresses(policy.new_query_plan(&RequestInfo::default()));
        assert_eq!(plan.len(), 3);
        // Two local hosts lead, the remote host trails
        assert!(plan[..2].contains(&"127.0.0.1:9042".parse().unwrap()));
        assert!(plan[..2].contains(&"127.0.0.3:9042".parse().unwrap()));
        assert_eq!(plan[2], "127.0.0.2:9042".parse().unwrap());
    }

    #[test]
    fn test_dc_aware_distance_without_remote_hosts() {
        let hosts = vec![
            Host::for_tests_in_dc("127.0.0.1:9042", "dc1"),
            Host::for_tests_in_dc("127.0.0.2:9042", "dc2"),
        ];
        let registry = registry_with(&hosts);
        let policy = DcAwareRoundRobinPolicy::new("dc1");
        policy.init(&registry).unwrap();

        let local = registry.get("127.0.0.1:9042".parse().unwrap()).unwrap();
        let remote = registry.get("127.0.0.2:9042".parse().unwrap()).unwrap();
        assert_eq!(policy.distance(&local), HostDistance::Local);
        assert_eq!(policy.distance(&remote), HostDistance::Ignored);
    }

    #[test]
    fn test_token_aware_prefers_replicas() {
        let hosts = vec![
            Host::for_tests("127.0.0.1:9042", &[]),
            Host::for_tests("127.0.0.2:9042", &[]),
            Host::for_tests("127.0.0.3:9042", &[]),
        ];
        let registry = registry_with(&hosts);

        let replicas = StaticReplicaMap::new();
        // key 0 -> replicas {2, 3}; key 3 -> replicas {1, 2}
        replicas.insert(
            "ks1",
            Token(0),
            vec![
                registry.get("127.0.0.2:9042".parse().unwrap()).unwrap(),
                registry.get("127.0.0.3:9042".parse().unwrap()).unwrap(),
            ],
        );
        replicas.insert(
            "ks1",
            Token(3),
            vec![
                registry.get("127.0.0.1:9042".parse().unwrap()).unwrap(),
                registry.get("127.0.0.2:9042".parse().unwrap()).unwrap(),
            ],
        );

        let policy = TokenAwarePolicy::new(
            Arc::new(RoundRobinPolicy::new()),
            Arc::new(replicas),
        );
        policy.init(&registry).unwrap();

        for _ in 0..20 {
            let plan = plan_addresses(policy.new_query_plan(&RequestInfo {
                keyspace: Some("ks1"),
                routing_token: Some(Token(0)),
            }));
            // Coordinator must be one of the expected replicas
            let expected: [SocketAddr; 2] = [
                "127.0.0.2:9042".parse().unwrap(),
                "127.0.0.3:9042".parse().unwrap(),
            ];
            assert!(expected.contains(&plan[0]), "coordinator {}", plan[0]);
            // The full plan still visits every host exactly once
            assert_eq!(plan.len(), 3);
            let unique: HashSet<_> = plan.iter().collect();
            assert_eq!(unique.len(), 3);
        }

        for _ in 0..20 {
            let plan = plan_addresses(policy.new_query_plan(&RequestInfo {
                keyspace: Some("ks1"),
                routing_token: Some(Token(3)),
            }));
            let expected: [SocketAddr; 2] = [
                "127.0.0.1:9042".parse().unwrap(),
                "127.0.0.2:9042".parse().unwrap(),
            ];
            assert!(expected.contains(&plan[0]), "coordinator {}", plan[0]);
        }
    }

    #[test]
    fn test_token_aware_defers_without_token() {
        let hosts = vec![Host::for_tests("127.0.0.1:9042", &[])];
        let registry = registry_with(&hosts);
        let policy = TokenAwarePolicy::new(
            Arc::new(RoundRobinPolicy::new()),
            Arc::new(StaticReplicaMap::new()),
        );
        policy.init(&registry).unwrap();
        let plan = plan_addresses(policy.new_query_plan(&RequestInfo::default()));
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_allow_list_filters() {
        let hosts = vec![
            Host::for_tests("127.0.0.1:9042", &[]),
            Host::for_tests("127.0.0.2:9042", &[]),
        ];
        let registry = registry_with(&hosts);
        let allowed: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let policy = AllowListPolicy::new(Arc::new(RoundRobinPolicy::new()), vec![allowed]);
        policy.init(&registry).unwrap();

        let plan = plan_addresses(policy.new_query_plan(&RequestInfo::default()));
        assert_eq!(plan, vec![allowed]);
        let blocked = registry.get("127.0.0.2:9042".parse().unwrap()).unwrap();
        assert_eq!(policy.distance(&blocked), HostDistance::Ignored);
    }

    #[test]
    fn test_default_policy_requires_unambiguous_dc() {
        let hosts = vec![
            Host::for_tests_in_dc("127.0.0.1:9042", "dc1"),
            Host::for_tests_in_dc("127.0.0.2:9042", "dc2"),
        ];
        let registry = registry_with(&hosts);
        let policy = DefaultLoadBalancingPolicy::new(None, Arc::new(StaticReplicaMap::new()));
        assert!(matches!(
            policy.init(&registry),
            Err(DriverError::Argument(_))
        ));

        let policy =
            DefaultLoadBalancingPolicy::new(Some("dc1".into()), Arc::new(StaticReplicaMap::new()));
        policy.init(&registry).unwrap();
        let remote = registry.get("127.0.0.2:9042".parse().unwrap()).unwrap();
        assert_eq!(policy.distance(&remote), HostDistance::Ignored);
    }

    #[test]
    fn test_default_policy_single_dc_discovery() {
        let hosts = vec![
            Host::for_tests_in_dc("127.0.0.1:9042", "dc1"),
            Host::for_tests_in_dc("127.0.0.2:9042", "dc1"),
        ];
        let registry = registry_with(&hosts);
        let policy = DefaultLoadBalancingPolicy::new(None, Arc::new(StaticReplicaMap::new()));
        policy.init(&registry).unwrap();
        let plan = plan_addresses(policy.new_query_plan(&RequestInfo::default()));
        assert_eq!(plan.len(), 2);
    }
}
