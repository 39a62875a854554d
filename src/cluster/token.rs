// Tokens and replica lookup
//
// Partition keys hash into a signed 64-bit token space. The core does not
// compute replication strategies itself: a replica oracle answers "which
// hosts hold this token for this keyspace", fed by whatever schema reader
// the application wires in. The ring implementation here consumes per-host
// token assignments and per-keyspace replication counts as opaque inputs.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::host::Host;

/// A position in the token ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub i64);

impl Token {
    /// Murmur3 x64 128-bit finalizer over the routing key, truncated to the
    /// 64-bit token the partitioner uses.
    pub fn from_routing_key(key: &[u8]) -> Token {
        Token(murmur3_64(key))
    }

    pub fn parse(text: &str) -> Option<Token> {
        text.trim().parse::<i64>().ok().map(Token)
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A half-open range (start, end] on the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenRange {
    pub start: Token,
    pub end: Token,
}

impl TokenRange {
    pub fn contains(&self, token: Token) -> bool {
        if self.start < self.end {
            token > self.start && token <= self.end
        } else {
            // wrapping range
            token > self.start || token <= self.end
        }
    }
}

/// Answers replica sets for (keyspace, token) pairs. The driver treats the
/// mapping as opaque.
pub trait ReplicaOracle: Send + Sync {
    fn replicas(&self, keyspace: &str, token: Token) -> Vec<Arc<Host>>;
}

/// Ring-walk oracle: owns the sorted (token, host) ring and per-keyspace
/// replica counts supplied by the schema reader.
pub struct TokenRing {
    ring: RwLock<Vec<(Token, Arc<Host>)>>,
    replication: RwLock<HashMap<String, usize>>,
}

impl TokenRing {
    pub fn new() -> TokenRing {
        TokenRing {
            ring: RwLock::new(Vec::new()),
            replication: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the ring from the hosts' token assignments.
    pub fn rebuild(&self, hosts: &[Arc<Host>]) {
        let mut ring: Vec<(Token, Arc<Host>)> = Vec::new();
        for host in hosts {
            for token in host.tokens() {
                ring.push((token, Arc::clone(host)));
            }
        }
        ring.sort_by_key(|(token, _)| *token);
        *self.ring.write() = ring;
    }

    /// Record the replica count for a keyspace (opaque input).
    pub fn set_replication(&self, keyspace: &str, replicas: usize) {
        self.replication
            .write()
            .insert(keyspace.to_string(), replicas.max(1));
    }

    fn replica_count(&self, keyspace: &str) -> usize {
        self.replication.read().get(keyspace).copied().unwrap_or(1)
    }
}

impl Default for TokenRing {
    fn default() -> Self {
        TokenRing::new()
    }
}

impl ReplicaOracle for TokenRing {
    fn replicas(&self, keyspace: &str, token: Token) -> Vec<Arc<Host>> {
        let ring = self.ring.read();
        if ring.is_empty() {
            return Vec::new();
        }
        let count = self.replica_count(keyspace).min(ring.len());
        // First entry with ring token >= the lookup token, wrapping
        let start = ring.partition_point(|(ring_token, _)| *ring_token < token);
        let mut replicas: Vec<Arc<Host>> = Vec::with_capacity(count);
        for offset in 0..ring.len() {
            let (_, host) = &ring[(start + offset) % ring.len()];
            if !replicas.iter().any(|r| r.address() == host.address()) {
                replicas.push(Arc::clone(host));
                if replicas.len() == count {
                    break;
                }
            }
        }
        replicas
    }
}

/// Fixture oracle with an explicit (keyspace, token) -> replicas table.
pub struct StaticReplicaMap {
    entries: RwLock<HashMap<(String, i64), Vec<Arc<Host>>>>,
}

impl StaticReplicaMap {
    pub fn new() -> StaticReplicaMap {
        StaticReplicaMap {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, keyspace: &str, token: Token, replicas: Vec<Arc<Host>>) {
        self.entries
            .write()
            .insert((keyspace.to_string(), token.0), replicas);
    }
}

impl Default for StaticReplicaMap {
    fn default() -> Self {
        StaticReplicaMap::new()
    }
}

impl ReplicaOracle for StaticReplicaMap {
    fn replicas(&self, keyspace: &str, token: Token) -> Vec<Arc<Host>> {
        self.entries
            .read()
            .get(&(keyspace.to_string(), token.0))
            .cloned()
            .unwrap_or_default()
    }
}

/// Murmur3 128-bit x64 hash, first 64 bits, with the partitioner's
/// signed-byte quirk preserved.
fn murmur3_64(data: &[u8]) -> i64 {
    const C1: i64 = 0x87c3_7b91_1142_53d5_u64 as i64;
    const C2: i64 = 0x4cf5_ad43_2745_937f_u64 as i64;

    let length = data.len();
    let n_blocks = length / 16;
    let mut h1: i64 = 0;
    let mut h2: i64 = 0;

    for block in 0..n_blocks {
        let mut k1 = read_i64_le(data, block * 16);
        let mut k2 = read_i64_le(data, block * 16 + 8);

        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27);
        h1 = h1.wrapping_add(h2);
        h1 = h1.wrapping_mul(5).wrapping_add(0x52dce729);

        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31);
        h2 = h2.wrapping_add(h1);
        h2 = h2.wrapping_mul(5).wrapping_add(0x38495ab5);
    }

    let tail = &data[n_blocks * 16..];
    let mut k1: i64 = 0;
    let mut k2: i64 = 0;
    // Bytes are sign-extended, matching the reference partitioner
    for i in (8..tail.len()).rev() {
        k2 ^= (tail[i] as i8 as i64) << ((i - 8) * 8);
    }
    if tail.len() > 8 {
        k2 = k2.wrapping_mul(C2);
        k2 = k2.rotate_left(33);
        k2 = k2.wrapping_mul(C1);
        h2 ^= k2;
    }
    for i in (0..tail.len().min(8)).rev() {
        k1 ^= (tail[i] as i8 as i64) << (i * 8);
    }
    if !tail.is_empty() {
        k1 = k1.wrapping_mul(C1);
        k1 = k1.rotate_left(31);
        k1 = k1.wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= length as i64;
    h2 ^= length as i64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h1
}

fn read_i64_le(data: &[u8], offset: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    i64::from_le_bytes(raw)
}

fn fmix64(mut k: i64) -> i64 {
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53_u64 as i64);
    k ^= ((k as u64) >> 33) as i64;
    k
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_murmur3_reference_value() {
        // Matches the reference partitioner: token('123')
        assert_eq!(murmur3_64(b"123"), -7468325962851647638);
    }

    #[test]
    fn test_murmur3_is_stable_across_block_boundaries() {
        let long: Vec<u8> = (0..64).collect();
        assert_eq!(murmur3_64(&long), murmur3_64(&long.clone()));
        // 15, 16 and 17 bytes exercise the tail/block split
        for len in [15usize, 16, 17] {
            let a = murmur3_64(&long[..len]);
            let b = murmur3_64(&long[..len]);
            assert_eq!(a, b);
            assert_ne!(a, murmur3_64(&long[..len - 1]));
        }
    }

    #[test]
    fn test_token_parse() {
        assert_eq!(Token::parse("42"), Some(Token(42)));
        assert_eq!(Token::parse(" -9223372036854775808 "), Some(Token(i64::MIN)));
        assert_eq!(Token::parse("abc"), None);
    }

    #[test]
    fn test_range_contains_wrapping() {
        let range = TokenRange {
            start: Token(100),
            end: Token(-100),
        };
        assert!(range.contains(Token(i64::MAX)));
        assert!(range.contains(Token(-100)));
        assert!(!range.contains(Token(0)));

        let plain = TokenRange {
            start: Token(0),
            end: Token(10),
        };
        assert!(plain.contains(Token(5)));
        assert!(!plain.contains(Token(0)));
        assert!(plain.contains(Token(10)));
    }

    #[test]
    fn test_ring_walk() {
        let h1 = Host::for_tests("127.0.0.1:9042", &["0"]);
        let h2 = Host::for_tests("127.0.0.2:9042", &["100"]);
        let h3 = Host::for_tests("127.0.0.3:9042", &["200"]);
        let ring = TokenRing::new();
        ring.rebuild(&[Arc::clone(&h1), Arc::clone(&h2), Arc::clone(&h3)]);
        ring.set_replication("ks1", 2);

        // token 50 lands on owner 100, next distinct host 200
        let replicas = ring.replicas("ks1", Token(50));
        let addrs: Vec<_> = replicas.iter().map(|h| h.address()).collect();
        assert_eq!(
            addrs,
            vec![
                "127.0.0.2:9042".parse().unwrap(),
                "127.0.0.3:9042".parse().unwrap()
            ]
        );

        // wrapping: token above every ring token goes to the first owner
        let replicas = ring.replicas("ks1", Token(1000));
        assert_eq!(replicas[0].address(), "127.0.0.1:9042".parse().unwrap());

        // unknown keyspace defaults to one replica
        assert_eq!(ring.replicas("nope", Token(50)).len(), 1);
    }
}
