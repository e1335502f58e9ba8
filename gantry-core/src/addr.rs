//! Address families, family preference and local interface selection.
//!
//! An address is a plain `std::net::SocketAddr`: immutable, family tagged,
//! numeric host plus port. This module adds the dual-stack policy on top.

use smallvec::SmallVec;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{GantryError, Result};

/// Candidate list produced by resolution. Most hosts resolve to a handful.
pub type Candidates = SmallVec<[SocketAddr; 4]>;

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// Family of a socket address.
    #[must_use]
    pub const fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self::V4,
            SocketAddr::V6(_) => Self::V6,
        }
    }

    #[must_use]
    pub const fn domain(self) -> socket2::Domain {
        match self {
            Self::V4 => socket2::Domain::IPV4,
            Self::V6 => socket2::Domain::IPV6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "IPv4"),
            Self::V6 => write!(f, "IPv6"),
        }
    }
}

/// Which family wins when a host resolves to both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FamilyPreference {
    /// IPv4 candidates first (default)
    #[default]
    PreferV4,
    /// IPv6 candidates first
    PreferV6,
    /// Keep the resolver's natural order
    Neutral,
}

/// Which families a socket may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyPolicy {
    pub preference: FamilyPreference,
    pub ipv4_enabled: bool,
    pub ipv6_enabled: bool,
}

impl Default for FamilyPolicy {
    fn default() -> Self {
        Self {
            preference: FamilyPreference::default(),
            ipv4_enabled: true,
            ipv6_enabled: true,
        }
    }
}

impl FamilyPolicy {
    /// Check that at least one family is usable.
    pub fn validate(&self) -> Result<()> {
        if !self.ipv4_enabled && !self.ipv6_enabled {
            return Err(GantryError::config("both IPv4 and IPv6 are disabled"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn allows(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.ipv4_enabled,
            Family::V6 => self.ipv6_enabled,
        }
    }

    /// Drop disabled families and order the rest by preference.
    ///
    /// The sort is stable, so addresses within one family keep the
    /// resolver's order, and `Neutral` keeps the whole list untouched.
    #[must_use]
    pub fn order<I>(&self, addrs: I) -> Candidates
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        let mut out: Candidates = addrs
            .into_iter()
            .filter(|a| self.allows(Family::of(a)))
            .collect();
        let rank = |a: &SocketAddr| match (self.preference, Family::of(a)) {
            (FamilyPreference::PreferV4, Family::V4) | (FamilyPreference::PreferV6, Family::V6) => 0,
            (FamilyPreference::Neutral, _) => 0,
            _ => 1,
        };
        out.sort_by_key(rank);
        out
    }

    /// Pick the single best address, used where only one can be committed.
    #[must_use]
    pub fn pick<I>(&self, addrs: I) -> Option<SocketAddr>
    where
        I: IntoIterator<Item = SocketAddr>,
    {
        self.order(addrs).into_iter().next()
    }
}

/// Local addresses to bind, one slot per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalBinding {
    pub v4: Option<SocketAddr>,
    pub v6: Option<SocketAddr>,
}

impl LocalBinding {
    /// Resolve an interface description into bind addresses.
    ///
    /// Accepted forms:
    /// - `None` or `""`: the wildcard address of every enabled family
    /// - `"localhost"` / `"loopback"`: the loopback address of every enabled family
    /// - an IP literal such as `"192.168.1.4"` or `"fe80::1"`
    pub fn for_interface(interface: Option<&str>, port: u16, policy: &FamilyPolicy) -> Result<Self> {
        policy.validate()?;
        let (v4, v6) = match interface.map(str::trim) {
            None | Some("") => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
            Some(name) if name.eq_ignore_ascii_case("localhost") || name.eq_ignore_ascii_case("loopback") => {
                (IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST))
            }
            Some(literal) => {
                let ip: IpAddr = literal
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .parse()
                    .map_err(|_| GantryError::config(format!("unknown interface: {literal}")))?;
                let binding = Self::for_addr(SocketAddr::new(ip, port));
                if !policy.allows(Family::of(&SocketAddr::new(ip, port))) {
                    return Err(GantryError::config(format!(
                        "interface {literal} uses a disabled address family"
                    )));
                }
                return Ok(binding);
            }
        };
        Ok(Self {
            v4: policy.ipv4_enabled.then(|| SocketAddr::new(v4, port)),
            v6: policy.ipv6_enabled.then(|| SocketAddr::new(v6, port)),
        })
    }

    /// Binding for one explicit address.
    #[must_use]
    pub const fn for_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Self { v4: Some(addr), v6: None },
            SocketAddr::V6(_) => Self { v4: None, v6: Some(addr) },
        }
    }

    #[must_use]
    pub const fn get(&self, family: Family) -> Option<SocketAddr> {
        match family {
            Family::V4 => self.v4,
            Family::V6 => self.v6,
        }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}
