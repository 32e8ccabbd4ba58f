//! Device discovery via SSDP multicast and mDNS.
//!
//! Both probes run concurrently for one bounded response window and their
//! results are merged, deduplicated by IP, and upserted into the registry.
//! An SSDP socket failure retries the whole pass a fixed number of times;
//! an mDNS failure only costs the mDNS results. Zero replies after a full
//! window is a successful, empty discovery.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use mdns_sd::{ResolvedService, ScopedIp, ServiceDaemon, ServiceEvent};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::device::Device;
use crate::errors::Error;
use crate::registry::DeviceRegistry;
use crate::session::CONTROL_PORT;
use crate::types::FeatureSet;

type Result<T> = std::result::Result<T, Error>;

/// SSDP search address used by the bulbs (not the standard UPnP port).
const MULTICAST_ADDR: &str = "239.255.255.250:1982";

/// SSDP search target identifying the bulbs.
const SEARCH_TARGET: &str = "wifi_bulb";

/// mDNS service type (trailing dot required by mdns-sd).
const MDNS_SERVICE: &str = "_yeelight._tcp.local.";

/// Build the M-SEARCH request.
fn build_search_request() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {MULTICAST_ADDR}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         ST: {SEARCH_TARGET}\r\n\r\n"
    )
}

/// Checks if `s` starts with `prefix` (ASCII case-insensitive, no allocation).
#[inline]
fn starts_with_ignore_ascii_case(s: &str, prefix: &str) -> bool {
    s.len() >= prefix.len() && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Extract one HTTP-style header value from a reply. Header names are
/// matched case-insensitively; `header` must include the trailing colon.
fn header_value<'a>(response: &'a str, header: &str) -> Option<&'a str> {
    response
        .lines()
        .find(|l| starts_with_ignore_ascii_case(l, header))
        .and_then(|l| l.find(':').map(|idx| l[idx + 1..].trim()))
}

/// An advertisement heard during one discovery pass.
///
/// Ephemeral: consumed immediately to create or refresh [`Device`] entries.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub ip: IpAddr,
    pub port: u16,
    /// Vendor-assigned id from the `id:` header (hex on the wire).
    pub id: Option<u64>,
    pub model: Option<String>,
    pub fw_version: Option<String>,
    pub support: Option<String>,
    pub name: Option<String>,
}

impl DiscoveryResult {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Build the registry record for this advertisement. State stays
    /// `Unknown` until the first `props` push arrives over a session.
    pub fn into_device(self, seen_at: SystemTime) -> Device {
        let mut device = Device::new(self.addr(), seen_at);
        device.id = self.id;
        device.name = self.name.filter(|n| !n.is_empty());
        device.model = self.model;
        device.fw_version = self.fw_version;
        if let Some(support) = &self.support {
            device.features = FeatureSet::from_support(support);
        }
        device
    }
}

/// Parse a unicast M-SEARCH reply. Returns None for anything that is not a
/// well-formed bulb advertisement.
fn parse_search_reply(response: &str) -> Option<DiscoveryResult> {
    let status = response.lines().next()?;
    if !starts_with_ignore_ascii_case(status, "HTTP/1.1") || !status.contains("200") {
        return None;
    }

    let (ip, port) = parse_location(header_value(response, "location:")?)?;

    let id = header_value(response, "id:")
        .and_then(|v| u64::from_str_radix(v.trim_start_matches("0x"), 16).ok());

    Some(DiscoveryResult {
        ip,
        port,
        id,
        model: header_value(response, "model:").map(String::from),
        fw_version: header_value(response, "fw_ver:").map(String::from),
        support: header_value(response, "support:").map(String::from),
        name: header_value(response, "name:").map(String::from),
    })
}

/// Parse a `yeelight://<ip>:<port>` location.
fn parse_location(location: &str) -> Option<(IpAddr, u16)> {
    let addr: SocketAddr = location.strip_prefix("yeelight://")?.parse().ok()?;
    Some((addr.ip(), addr.port()))
}

/// Tunables for a discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// How long each probe listens for replies.
    pub response_window: Duration,
    /// Attempts when the SSDP socket fails outright.
    pub attempts: u32,
    /// Fixed delay between attempts.
    pub retry_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            response_window: Duration::from_secs(5),
            attempts: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Locates bulbs on the local network and feeds them into a registry.
#[derive(Debug)]
pub struct Discovery {
    registry: DeviceRegistry,
    config: DiscoveryConfig,
}

impl Discovery {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self::with_config(registry, DiscoveryConfig::default())
    }

    pub fn with_config(registry: DeviceRegistry, config: DiscoveryConfig) -> Self {
        Self { registry, config }
    }

    /// Run one discovery pass (with internal retries) and return the devices
    /// found, already upserted into the registry.
    ///
    /// Cancelling mid-window stops both probes and returns whatever was
    /// gathered so far; cancelling during a retry delay returns
    /// [`Error::Cancelled`]. Exhausting every attempt returns
    /// [`Error::DiscoveryExhausted`] wrapping the last cause.
    pub async fn discover(&self, cancel: &CancellationToken) -> Result<Vec<Device>> {
        let mut last_error = None;

        for attempt in 0..self.config.attempts.max(1) {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }
            match self.run_pass(cancel).await {
                Ok(results) => return Ok(apply_results(&self.registry, results)),
                Err(err) => {
                    warn!("discovery attempt {} failed: {err}", attempt + 1);
                    last_error = Some(err);
                }
            }
        }

        Err(Error::DiscoveryExhausted {
            attempts: self.config.attempts.max(1),
            source: Box::new(last_error.unwrap_or(Error::Cancelled)),
        })
    }

    async fn run_pass(&self, cancel: &CancellationToken) -> Result<Vec<DiscoveryResult>> {
        let window = self.config.response_window;
        let (ssdp, mdns) = tokio::join!(ssdp_probe(window, cancel), mdns_probe(window, cancel));

        // An SSDP failure fails the pass; an mDNS failure only costs its results.
        let results = ssdp?;
        let extra = match mdns {
            Ok(extra) => extra,
            Err(err) => {
                warn!("mdns probe failed: {err}");
                Vec::new()
            }
        };
        Ok(merge_results(results, extra))
    }
}

/// Deduplicate by IP across both probes; the first sighting wins.
fn merge_results(
    ssdp: Vec<DiscoveryResult>,
    mdns: Vec<DiscoveryResult>,
) -> Vec<DiscoveryResult> {
    let mut seen: HashSet<IpAddr> = HashSet::new();
    ssdp.into_iter()
        .chain(mdns)
        .filter(|r| seen.insert(r.ip))
        .collect()
}

fn apply_results(registry: &DeviceRegistry, results: Vec<DiscoveryResult>) -> Vec<Device> {
    let now = SystemTime::now();
    results
        .into_iter()
        .filter_map(|result| {
            let addr = result.addr();
            registry.upsert(result.into_device(now));
            registry.get(addr)
        })
        .collect()
}

/// Send one M-SEARCH and collect unicast replies for the window.
async fn ssdp_probe(
    window: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<DiscoveryResult>> {
    let socket = create_search_socket().map_err(|e| Error::discovery_socket("bind", e))?;
    let request = build_search_request();
    socket
        .send_to(request.as_bytes(), MULTICAST_ADDR)
        .await
        .map_err(|e| Error::discovery_socket("send_to", e))?;

    let mut results = Vec::new();
    let mut seen: HashSet<IpAddr> = HashSet::new();
    let mut buf = [0u8; 2048];
    let start = tokio::time::Instant::now();

    while start.elapsed() < window {
        let remaining = window.saturating_sub(start.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("ssdp probe cancelled after {} replies", results.len());
                break;
            }
            recv = timeout(remaining, socket.recv_from(&mut buf)) => match recv {
                Ok(Ok((amt, src))) => {
                    let reply = String::from_utf8_lossy(&buf[..amt]);
                    match parse_search_reply(&reply) {
                        Some(result) if seen.insert(result.ip) => {
                            debug!("ssdp reply from {}: {}:{}", src, result.ip, result.port);
                            results.push(result);
                        }
                        // Duplicate or malformed: silently dropped.
                        _ => {}
                    }
                }
                Ok(Err(err)) => warn!("ssdp recv error: {err}"),
                Err(_) => break, // window elapsed
            }
        }
    }

    Ok(results)
}

/// UDP socket for the search. Reuse flags let a rapid second pass coexist
/// with a lingering socket from the previous one.
fn create_search_socket() -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(err) = socket.set_reuse_address(true) {
        debug!("set_reuse_address failed: {err}");
    }
    #[cfg(unix)]
    if let Err(err) = socket.set_reuse_port(true) {
        debug!("set_reuse_port failed: {err}");
    }
    if let Err(err) = socket.set_multicast_ttl_v4(4) {
        debug!("set_multicast_ttl_v4 failed: {err}");
    }
    socket.set_nonblocking(true)?;
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], 0));
    socket.bind(&bind_addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Browse for the bulbs' mDNS service within the window.
async fn mdns_probe(
    window: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<DiscoveryResult>> {
    let daemon = ServiceDaemon::new().map_err(|e| Error::MdnsDaemon(e.to_string()))?;
    let receiver = daemon
        .browse(MDNS_SERVICE)
        .map_err(|e| Error::MdnsDaemon(e.to_string()))?;

    let mut results = Vec::new();
    let mut seen: HashSet<IpAddr> = HashSet::new();
    let start = tokio::time::Instant::now();

    while start.elapsed() < window {
        let remaining = window.saturating_sub(start.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("mdns probe cancelled after {} services", results.len());
                break;
            }
            event = timeout(remaining, receiver.recv_async()) => match event {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    if let Some(result) = parse_mdns_service(&info)
                        && seen.insert(result.ip)
                    {
                        debug!("mdns service at {}:{}", result.ip, result.port);
                        results.push(result);
                    }
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    debug!("mdns receiver closed: {err:?}");
                    break;
                }
                Err(_) => break, // window elapsed
            }
        }
    }

    if let Err(err) = daemon.stop_browse(MDNS_SERVICE) {
        debug!("mdns stop_browse failed: {err:?}");
    }
    let _ = daemon.shutdown();

    Ok(results)
}

fn parse_mdns_service(info: &ResolvedService) -> Option<DiscoveryResult> {
    // Prefer IPv4; the control protocol is only advertised over it.
    let ip = info.addresses.iter().find_map(|addr| match addr {
        ScopedIp::V4(v4) => Some(IpAddr::V4(v4.addr().to_owned())),
        _ => None,
    })?;

    let port = if info.port > 0 { info.port } else { CONTROL_PORT };
    let name = info
        .fullname
        .strip_suffix(&format!(".{MDNS_SERVICE}"))
        .or_else(|| info.fullname.split('.').next())
        .map(String::from);

    Some(DiscoveryResult {
        ip,
        port,
        id: None,
        model: None,
        fw_version: None,
        support: None,
        name,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceState, Feature};

    const REPLY_10: &str = "HTTP/1.1 200 OK\r\n\
        Cache-Control: max-age=3600\r\n\
        Location: yeelight://192.168.1.10:55443\r\n\
        id: 0x0000000002dfb19a\r\n\
        model: color\r\n\
        fw_ver: 18\r\n\
        support: get_prop set_default set_power toggle set_bright start_cf stop_cf set_ct_abx set_rgb set_name\r\n\
        power: on\r\n\
        bright: 100\r\n\r\n";

    const REPLY_11: &str = "HTTP/1.1 200 OK\r\n\
        LOCATION: yeelight://192.168.1.11:55443\r\n\
        model: mono\r\n\
        support: get_prop set_power set_bright\r\n\r\n";

    #[test]
    fn test_build_search_request() {
        let request = build_search_request();
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("HOST: 239.255.255.250:1982\r\n"));
        assert!(request.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(request.contains("ST: wifi_bulb\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_parse_search_reply() {
        let result = parse_search_reply(REPLY_10).unwrap();
        assert_eq!(result.ip, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(result.port, 55443);
        assert_eq!(result.id, Some(0x2dfb19a));
        assert_eq!(result.model.as_deref(), Some("color"));
        assert_eq!(result.fw_version.as_deref(), Some("18"));
    }

    #[test]
    fn test_parse_search_reply_case_insensitive_headers() {
        let result = parse_search_reply(REPLY_11).unwrap();
        assert_eq!(result.ip, "192.168.1.11".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_search_reply_rejects_malformed() {
        assert!(parse_search_reply("NOTIFY * HTTP/1.1\r\nLocation: yeelight://1.2.3.4:55443\r\n\r\n").is_none());
        assert!(parse_search_reply("HTTP/1.1 200 OK\r\nServer: POSIX\r\n\r\n").is_none());
        assert!(parse_search_reply("HTTP/1.1 200 OK\r\nLocation: http://192.168.1.10:80\r\n\r\n").is_none());
    }

    #[test]
    fn test_merge_results_dedups_by_ip() {
        let a = parse_search_reply(REPLY_10).unwrap();
        let b = parse_search_reply(REPLY_10).unwrap();
        let c = parse_search_reply(REPLY_11).unwrap();
        let merged = merge_results(vec![a, b], vec![c]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_into_device_parses_features() {
        let device = parse_search_reply(REPLY_10)
            .unwrap()
            .into_device(SystemTime::now());
        assert!(device.features().contains(Feature::Color));
        assert!(device.features().contains(Feature::Flow));
        assert!(!device.features().contains(Feature::MusicMode));
        assert_eq!(device.state(), DeviceState::Unknown);
    }

    #[test]
    fn test_zero_replies_is_a_successful_empty_result() {
        let registry = DeviceRegistry::new();
        let devices = apply_results(&registry, merge_results(Vec::new(), Vec::new()));
        assert!(devices.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_two_replies_populate_registry_with_unknown_state() {
        let registry = DeviceRegistry::new();
        let results = merge_results(
            vec![
                parse_search_reply(REPLY_10).unwrap(),
                parse_search_reply(REPLY_11).unwrap(),
            ],
            Vec::new(),
        );
        let devices = apply_results(&registry, results);

        assert_eq!(devices.len(), 2);
        assert_eq!(registry.len(), 2);
        for addr in ["192.168.1.10:55443", "192.168.1.11:55443"] {
            let device = registry.get(addr.parse().unwrap()).unwrap();
            assert_eq!(device.state(), DeviceState::Unknown);
        }
    }
}
