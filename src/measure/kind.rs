use crate::dispatch::aggregate::ResultRecord;
use crate::measure::job::MeasurementJob;
use crate::measure::target::Target;
use crate::probe::service::{Correlation, ProbeRequest, RawBody, RawResult, RequestBody};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const SMTP_DEFAULT_PORT: u16 = 25;
pub const NTP_PORT: u16 = 123;
pub const NTP_PACKET_LEN: usize = 48;

const PING_WAIT: Duration = Duration::from_secs(10);
const TCP_WAIT: Duration = Duration::from_secs(10);
const HTTP_TIME_LIMIT: Duration = Duration::from_secs(10);
const DNS_WAIT: Duration = Duration::from_secs(5);
const NTP_WAIT: Duration = Duration::from_secs(5);

/// Seconds between the NTP era (1900-01-01) and the Unix epoch.
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Address family a job probes over. Resolution never falls back to the other family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub const ALL: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];

    /// Digit used in series names and in the management API (`4` or `6`).
    pub fn digit(self) -> char {
        match self {
            IpVersion::V4 => '4',
            IpVersion::V6 => '6',
        }
    }

    pub fn from_digit(digit: char) -> Option<Self> {
        match digit {
            '4' => Some(IpVersion::V4),
            '6' => Some(IpVersion::V6),
            _ => None,
        }
    }

    pub fn matches(self, address: &IpAddr) -> bool {
        matches!(
            (self, address),
            (IpVersion::V4, IpAddr::V4(_)) | (IpVersion::V6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.digit())
    }
}

/// The probe kinds the fleet knows how to issue and decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeasurementKind {
    Ping,
    HttpGet,
    Dns,
    Ntp,
    Smtp,
}

#[derive(Debug, Error)]
#[error("unknown measurement kind `{0}`")]
pub struct UnknownKind(pub String);

/// A raw result that cannot be attributed to any target of the job.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeMismatch {
    #[error("no target registered under lookup index {0}")]
    UnknownIndex(usize),
    #[error("no target registered for url {0}")]
    UnknownUrl(String),
    #[error("{kind} decoder cannot handle a {found} result")]
    UnexpectedBody {
        kind: MeasurementKind,
        found: &'static str,
    },
}

impl MeasurementKind {
    pub const ALL: [MeasurementKind; 5] = [
        MeasurementKind::Ping,
        MeasurementKind::HttpGet,
        MeasurementKind::Dns,
        MeasurementKind::Ntp,
        MeasurementKind::Smtp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MeasurementKind::Ping => "ping",
            MeasurementKind::HttpGet => "httpget",
            MeasurementKind::Dns => "dns",
            MeasurementKind::Ntp => "ntp",
            MeasurementKind::Smtp => "smtp",
        }
    }

    /// Series name used as configuration key and metrics measurement, e.g. `ping4`.
    pub fn series(self, ip_version: IpVersion) -> String {
        format!("{}{}", self.as_str(), ip_version.digit())
    }

    /// Inverse of [`MeasurementKind::series`].
    pub fn parse_series(series: &str) -> Option<(Self, IpVersion)> {
        let digit = series.chars().last()?;
        let ip_version = IpVersion::from_digit(digit)?;
        let kind = series[..series.len() - 1].parse().ok()?;
        Some((kind, ip_version))
    }

    /// Builds the kind-specific request for one target, tagged with the
    /// correlation data the decoder needs to map the result back.
    pub fn build_request(self, target: &Target, now: SystemTime) -> ProbeRequest {
        let dst = target.address();
        let body = match self {
            MeasurementKind::Ping => RequestBody::Ping {
                dst,
                wait: PING_WAIT,
            },
            MeasurementKind::Smtp => RequestBody::TcpSyn {
                dst,
                port: target.port().unwrap_or(SMTP_DEFAULT_PORT),
                wait: TCP_WAIT,
            },
            MeasurementKind::HttpGet => RequestBody::HttpGet {
                url: target.url().unwrap_or(target.destination()).to_owned(),
                dst,
                limit: HTTP_TIME_LIMIT,
            },
            MeasurementKind::Dns => RequestBody::DnsNs {
                server: dst,
                query: target.query_name().unwrap_or_default().to_owned(),
                wait: DNS_WAIT,
            },
            MeasurementKind::Ntp => RequestBody::Udp {
                dst,
                port: NTP_PORT,
                payload: ntp_request_payload(now).to_vec(),
                wait: NTP_WAIT,
            },
        };

        ProbeRequest {
            correlation: Correlation {
                lookup_index: target.lookup_index(),
                query_name: target.query_name().map(str::to_owned),
            },
            body,
        }
    }

    /// Decodes one completed exchange into a record. Missing timing values
    /// decode as a failed record; unattributable results are rejected.
    pub fn decode(
        self,
        completed_at: SystemTime,
        raw: &RawResult,
        job: &MeasurementJob,
    ) -> Result<ResultRecord, DecodeMismatch> {
        let index = raw.correlation.lookup_index;
        let by_index = |index: usize| {
            job.target_by_index(index)
                .ok_or(DecodeMismatch::UnknownIndex(index))
        };

        let (target, elapsed) = match (self, &raw.body) {
            (MeasurementKind::Ping | MeasurementKind::Smtp, RawBody::Ping { min_rtt }) => {
                (by_index(index)?, *min_rtt)
            }
            (MeasurementKind::Dns, RawBody::Dns { rtt }) => (by_index(index)?, *rtt),
            (MeasurementKind::HttpGet, RawBody::Http { url, started_at }) => {
                let target = job
                    .target_by_url(url)
                    .ok_or_else(|| DecodeMismatch::UnknownUrl(url.clone()))?;
                (target, elapsed_since(*started_at, completed_at))
            }
            (MeasurementKind::Ntp, RawBody::Udp { started_at }) => {
                (by_index(index)?, elapsed_since(*started_at, completed_at))
            }
            (kind, body) => {
                return Err(DecodeMismatch::UnexpectedBody {
                    kind,
                    found: body.label(),
                })
            }
        };

        Ok(match elapsed {
            Some(elapsed) => ResultRecord::success(
                target.destination(),
                target.party(),
                &raw.node,
                round_millis(elapsed),
            ),
            None => ResultRecord::failure(target.destination(), target.party(), &raw.node),
        })
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementKind {
    type Err = UnknownKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        MeasurementKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| UnknownKind(value.to_owned()))
    }
}

fn elapsed_since(started_at: Option<SystemTime>, completed_at: SystemTime) -> Option<Duration> {
    started_at.and_then(|start| completed_at.duration_since(start).ok())
}

/// Milliseconds rounded half-to-even.
pub fn round_millis(elapsed: Duration) -> u64 {
    (elapsed.as_secs_f64() * 1000.0).round_ties_even() as u64
}

/// 48-byte NTPv4 client request carrying `now` as its transmit timestamp.
///
/// The fraction field holds the sub-second part in units of 10 ns, which is
/// what the agents expect rather than the RFC 5905 binary fraction.
pub fn ntp_request_payload(now: SystemTime) -> [u8; NTP_PACKET_LEN] {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = (since_epoch.as_secs() + NTP_UNIX_OFFSET_SECS) as u32;
    let fraction = since_epoch.subsec_nanos() / 10;

    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[..4].copy_from_slice(&[0xE3, 0x00, 0x03, 0xFA]);
    packet[4..12].copy_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]);
    packet[40..44].copy_from_slice(&seconds.to_be_bytes());
    packet[44..48].copy_from_slice(&fraction.to_be_bytes());
    packet
}
