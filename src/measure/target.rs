//! Target resolution with a process-lifetime cache.
//!
//! Every configured target is resolved once per `(name, ip_version)` pair. The
//! resolver hands out a stable lookup index per pair, which travels with each
//! probe request so completions can be attributed back to their destination.

use crate::measure::kind::{IpVersion, MeasurementKind};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

/// A configured destination paired with its resolved probe address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    destination: String,
    party: String,
    address: IpAddr,
    lookup_index: usize,
    detail: TargetDetail,
}

/// Kind-specific data derived from the raw target string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetDetail {
    Host,
    Service { port: u16 },
    Web { url: String },
    Nameserver { query_name: String },
}

impl Target {
    pub fn new(
        destination: impl Into<String>,
        party: impl Into<String>,
        address: IpAddr,
        lookup_index: usize,
        detail: TargetDetail,
    ) -> Self {
        Self {
            destination: destination.into(),
            party: party.into(),
            address,
            lookup_index,
            detail,
        }
    }

    /// Name results are reported under.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn party(&self) -> &str {
        &self.party
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    pub fn lookup_index(&self) -> usize {
        self.lookup_index
    }

    pub fn detail(&self) -> &TargetDetail {
        &self.detail
    }

    pub fn port(&self) -> Option<u16> {
        match &self.detail {
            TargetDetail::Service { port } => Some(*port),
            _ => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match &self.detail {
            TargetDetail::Web { url } => Some(url),
            _ => None,
        }
    }

    pub fn query_name(&self) -> Option<&str> {
        match &self.detail {
            TargetDetail::Nameserver { query_name } => Some(query_name),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("{name} has no {ip_version} address")]
    NoAddress { name: String, ip_version: IpVersion },
    #[error("failed to resolve {name}: {source}")]
    LookupError {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("target `{raw}` is malformed: {reason}")]
    Malformed { raw: String, reason: &'static str },
}

/// Host name lookup backend.
pub trait HostLookup: Send + Sync {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>>;
}

/// Resolves through the operating system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    fn lookup<'a>(&'a self, host: &'a str) -> BoxFuture<'a, io::Result<Vec<IpAddr>>> {
        Box::pin(async move {
            let addresses = tokio::net::lookup_host((host, 0)).await?;
            Ok(addresses.map(|address| address.ip()).collect())
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedAddress {
    address: IpAddr,
    index: usize,
}

/// Owned resolution cache. Entries are only ever appended.
pub struct TargetResolver {
    lookup: Arc<dyn HostLookup>,
    cache: HashMap<(String, IpVersion), CachedAddress>,
    names: Vec<(String, IpVersion)>,
}

impl TargetResolver {
    pub fn new(lookup: Arc<dyn HostLookup>) -> Self {
        Self {
            lookup,
            cache: HashMap::new(),
            names: Vec::new(),
        }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemLookup))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Name cached under `index`, if any.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(|(name, _)| name.as_str())
    }

    /// Resolves one raw configured target for `kind` over `ip_version`.
    pub async fn resolve(
        &mut self,
        kind: MeasurementKind,
        raw: &str,
        party: &str,
        ip_version: IpVersion,
    ) -> Result<Target, ResolutionError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(malformed(raw, "empty target"));
        }

        match kind {
            MeasurementKind::HttpGet => self.resolve_web(raw, party, ip_version).await,
            MeasurementKind::Dns => {
                let query_name = second_level_domain(raw)
                    .ok_or_else(|| malformed(raw, "nameserver needs at least two labels"))?;
                let cached = self.resolve_name(raw, raw, ip_version).await?;
                Ok(Target::new(
                    raw,
                    party,
                    cached.address,
                    cached.index,
                    TargetDetail::Nameserver { query_name },
                ))
            }
            MeasurementKind::Ping | MeasurementKind::Ntp | MeasurementKind::Smtp => {
                let (host, port) = split_host_port(raw)?;
                let cached = self.resolve_name(raw, host, ip_version).await?;
                let detail = match port {
                    Some(port) => TargetDetail::Service { port },
                    None => TargetDetail::Host,
                };
                Ok(Target::new(raw, party, cached.address, cached.index, detail))
            }
        }
    }

    async fn resolve_web(
        &mut self,
        raw: &str,
        party: &str,
        ip_version: IpVersion,
    ) -> Result<Target, ResolutionError> {
        let cached = match raw.split_once('!') {
            Some((url, literal)) => {
                let address: IpAddr = literal
                    .trim()
                    .parse()
                    .map_err(|_| malformed(raw, "override after `!` is not an IP address"))?;
                if !ip_version.matches(&address) {
                    return Err(ResolutionError::NoAddress {
                        name: raw.to_owned(),
                        ip_version,
                    });
                }
                let cached = self.register(url, ip_version, address);
                return Ok(Target::new(
                    url,
                    party,
                    cached.address,
                    cached.index,
                    TargetDetail::Web { url: url.into() },
                ));
            }
            None => {
                let parsed = Url::parse(raw).map_err(|_| malformed(raw, "invalid url"))?;
                let host = parsed
                    .host_str()
                    .ok_or_else(|| malformed(raw, "url has no host"))?
                    .trim_start_matches('[')
                    .trim_end_matches(']')
                    .to_owned();
                self.resolve_name(&host, &host, ip_version).await?
            }
        };

        Ok(Target::new(
            raw,
            party,
            cached.address,
            cached.index,
            TargetDetail::Web { url: raw.into() },
        ))
    }

    async fn resolve_name(
        &mut self,
        name: &str,
        host: &str,
        ip_version: IpVersion,
    ) -> Result<CachedAddress, ResolutionError> {
        if let Some(cached) = self.cache.get(&(name.to_owned(), ip_version)) {
            return Ok(*cached);
        }

        let address = match host.parse::<IpAddr>() {
            Ok(literal) if ip_version.matches(&literal) => literal,
            Ok(_) => {
                return Err(ResolutionError::NoAddress {
                    name: name.to_owned(),
                    ip_version,
                })
            }
            Err(_) => {
                let candidates = self.lookup.lookup(host).await.map_err(|source| {
                    ResolutionError::LookupError {
                        name: name.to_owned(),
                        source,
                    }
                })?;
                candidates
                    .into_iter()
                    .find(|candidate| ip_version.matches(candidate))
                    .ok_or_else(|| ResolutionError::NoAddress {
                        name: name.to_owned(),
                        ip_version,
                    })?
            }
        };

        tracing::debug!(name, %address, %ip_version, "resolved target");
        Ok(self.register(name, ip_version, address))
    }

    fn register(&mut self, name: &str, ip_version: IpVersion, address: IpAddr) -> CachedAddress {
        let key = (name.to_owned(), ip_version);
        if let Some(cached) = self.cache.get(&key) {
            return *cached;
        }
        let cached = CachedAddress {
            address,
            index: self.names.len(),
        };
        self.names.push(key.clone());
        self.cache.insert(key, cached);
        cached
    }
}

fn malformed(raw: &str, reason: &'static str) -> ResolutionError {
    ResolutionError::Malformed {
        raw: raw.to_owned(),
        reason,
    }
}

/// Splits `host:port`, `[v6]:port`, bare hosts and bare IPv6 literals.
fn split_host_port(raw: &str) -> Result<(&str, Option<u16>), ResolutionError> {
    if raw.parse::<IpAddr>().is_ok() {
        return Ok((raw, None));
    }

    if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| malformed(raw, "unterminated IPv6 bracket"))?;
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host, Some(parse_port(raw, port)?))),
            None if tail.is_empty() => Ok((host, None)),
            None => Err(malformed(raw, "unexpected text after IPv6 bracket")),
        };
    }

    match raw.split_once(':') {
        Some((host, port)) => Ok((host, Some(parse_port(raw, port)?))),
        None => Ok((raw, None)),
    }
}

fn parse_port(raw: &str, port: &str) -> Result<u16, ResolutionError> {
    port.parse()
        .map_err(|_| malformed(raw, "port is not a number between 0 and 65535"))
}

/// `ns1.dns.example.com` -> `example.com`.
fn second_level_domain(host: &str) -> Option<String> {
    let mut labels = host.trim_end_matches('.').rsplit('.');
    let tld = labels.next().filter(|label| !label.is_empty())?;
    let sld = labels.next().filter(|label| !label.is_empty())?;
    Some(format!("{sld}.{tld}"))
}
