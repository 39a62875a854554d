// Address translation
//
// Translates the node addresses reported by the peers catalogue into the
// addresses the client should actually dial. The default is identity; the
// EC2 multi-region variant resolves through reverse-then-forward DNS so
// clients in the same region get the private address.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tracing::debug;

use crate::error::{DriverError, Result};

#[async_trait::async_trait]
pub trait AddressTranslator: Send + Sync {
    async fn translate(&self, address: SocketAddr) -> SocketAddr;
}

/// Returns the address unchanged.
pub struct IdentityTranslator;

#[async_trait::async_trait]
impl AddressTranslator for IdentityTranslator {
    async fn translate(&self, address: SocketAddr) -> SocketAddr {
        address
    }
}

/// DNS operations the EC2 translator needs, injectable for tests and for
/// environments with custom resolvers.
#[async_trait::async_trait]
pub trait DnsResolver: Send + Sync {
    async fn reverse(&self, ip: IpAddr) -> Result<String>;
    async fn forward(&self, name: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's stub resolver. Reverse lookups are not
/// portably available, so this resolver only supports the forward step;
/// the translator falls back to identity when reverse resolution fails.
pub struct SystemDnsResolver;

#[async_trait::async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn reverse(&self, ip: IpAddr) -> Result<String> {
        Err(DriverError::IoMessage(format!(
            "reverse DNS for {ip} is not available through the system resolver"
        )))
    }

    async fn forward(&self, name: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((name, 0))
            .await?
            .map(|addr| addr.ip())
            .collect();
        Ok(addrs)
    }
}

/// EC2 multi-region translation: reverse-resolve the IP to its public DNS
/// name, forward-resolve that name, and use the first answer. Amazon's
/// split-horizon DNS then yields the private address inside the region and
/// the public one outside it. Any resolution failure falls back to the
/// original address.
pub struct Ec2MultiRegionTranslator {
    resolver: Arc<dyn DnsResolver>,
}

impl Ec2MultiRegionTranslator {
    pub fn new() -> Self {
        Ec2MultiRegionTranslator {
            resolver: Arc::new(SystemDnsResolver),
        }
    }

    pub fn with_resolver(resolver: Arc<dyn DnsResolver>) -> Self {
        Ec2MultiRegionTranslator { resolver }
    }
}

impl Default for Ec2MultiRegionTranslator {
    fn default() -> Self {
        Ec2MultiRegionTranslator::new()
    }
}

#[async_trait::async_trait]
impl AddressTranslator for Ec2MultiRegionTranslator {
    async fn translate(&self, address: SocketAddr) -> SocketAddr {
        let name = match self.resolver.reverse(address.ip()).await {
            Ok(name) => name,
            Err(error) => {
                debug!(%address, %error, "reverse DNS failed, keeping address");
                return address;
            }
        };
        match self.resolver.forward(&name).await {
            Ok(ips) => match ips.first() {
                Some(ip) => SocketAddr::new(*ip, address.port()),
                None => address,
            },
            Err(error) => {
                debug!(%address, %name, %error, "forward DNS failed, keeping address");
                address
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity() {
        let address: SocketAddr = "10.1.2.3:9042".parse().unwrap();
        assert_eq!(IdentityTranslator.translate(address).await, address);
    }

    struct FakeResolver;

    #[async_trait::async_trait]
    impl DnsResolver for FakeResolver {
        async fn reverse(&self, _ip: IpAddr) -> Result<String> {
            Ok("ec2-54-1-2-3.compute.amazonaws.com".to_string())
        }

        async fn forward(&self, _name: &str) -> Result<Vec<IpAddr>> {
            Ok(vec!["172.16.0.9".parse().unwrap()])
        }
    }

    #[tokio::test]
    async fn test_ec2_reverse_then_forward() {
        let translator = Ec2MultiRegionTranslator::with_resolver(Arc::new(FakeResolver));
        let address: SocketAddr = "54.1.2.3:9042".parse().unwrap();
        let translated = translator.translate(address).await;
        assert_eq!(translated, "172.16.0.9:9042".parse().unwrap());
    }

    #[tokio::test]
    async fn test_ec2_falls_back_on_failure() {
        let translator = Ec2MultiRegionTranslator::new();
        let address: SocketAddr = "54.1.2.3:9042".parse().unwrap();
        // The system resolver cannot reverse-resolve, so identity applies
        assert_eq!(translator.translate(address).await, address);
    }
}
