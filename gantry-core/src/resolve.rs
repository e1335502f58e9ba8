//! Hostname resolution.
//!
//! The platform resolver blocks, so every lookup runs on the shared
//! runtime's bounded blocking pool and reports back through a callback. IP
//! literals skip the pool.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use tracing::{debug, trace};

use crate::addr::{Candidates, FamilyPolicy};
use crate::error::{GantryError, Result};
use crate::runtime;

/// Resolves hostnames into candidate lists ordered by a [`FamilyPolicy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver {
    policy: FamilyPolicy,
}

impl Resolver {
    #[must_use]
    pub const fn new(policy: FamilyPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> &FamilyPolicy {
        &self.policy
    }

    /// Parse `host` as an IP literal (brackets around IPv6 are accepted).
    #[must_use]
    pub fn literal(host: &str, port: u16) -> Option<SocketAddr> {
        host.trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, port))
    }

    /// Resolve on the calling thread.
    pub fn resolve_blocking(&self, host: &str, port: u16) -> Result<Candidates> {
        let host = host.trim();
        if host.is_empty() {
            return Err(GantryError::resolve(host, "empty host name"));
        }
        let found: Vec<SocketAddr> = match Self::literal(host, port) {
            Some(addr) => vec![addr],
            None => (host, port)
                .to_socket_addrs()
                .map_err(|e| GantryError::resolve(host, e.to_string()))?
                .collect(),
        };
        let ordered = self.policy.order(found);
        if ordered.is_empty() {
            return Err(GantryError::resolve(host, "no address in an enabled family"));
        }
        trace!("[RESOLVE] {} -> {:?}", host, ordered);
        Ok(ordered)
    }

    /// Resolve without blocking the caller.
    ///
    /// `done` runs on the runtime's blocking pool, or on the calling thread
    /// when `host` is an IP literal or the runtime is unavailable.
    pub fn resolve<F>(&self, host: &str, port: u16, done: F)
    where
        F: FnOnce(Result<Candidates>) + Send + 'static,
    {
        if Self::literal(host, port).is_some() || host.trim().is_empty() {
            done(self.resolve_blocking(host, port));
            return;
        }

        let Some(rt) = runtime::handle() else {
            debug!("[RESOLVE] No blocking pool for lookup of {}", host);
            done(Err(GantryError::resolve(host, "runtime unavailable")));
            return;
        };
        let resolver = *self;
        let owned = host.to_owned();
        rt.spawn_blocking(move || done(resolver.resolve_blocking(&owned, port)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::FamilyPreference;
    use std::time::Duration;

    #[test]
    fn test_literal_fast_path() {
        let resolver = Resolver::default();
        let out = resolver.resolve_blocking("[::1]", 443).unwrap();
        assert_eq!(out.as_slice(), &["[::1]:443".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_literal_in_disabled_family() {
        let resolver = Resolver::new(FamilyPolicy {
            ipv6_enabled: false,
            ..FamilyPolicy::default()
        });
        assert!(matches!(
            resolver.resolve_blocking("::1", 80),
            Err(GantryError::Resolve { .. })
        ));
    }

    #[test]
    fn test_localhost_async() {
        let resolver = Resolver::new(FamilyPolicy {
            preference: FamilyPreference::PreferV4,
            ipv6_enabled: false,
            ..FamilyPolicy::default()
        });
        let (tx, rx) = flume::bounded(1);
        resolver.resolve("localhost", 7, move |r| {
            let _ = tx.send(r);
        });
        let out = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(out.iter().all(SocketAddr::is_ipv4));
        assert_eq!(out[0].port(), 7);
    }

    #[test]
    fn test_empty_host() {
        assert!(Resolver::default().resolve_blocking("  ", 1).is_err());
    }
}
