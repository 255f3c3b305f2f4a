//! Single-shot latency probe.
//!
//! Sends one ICMP echo over a raw socket when the process is allowed to open
//! one (CAP_NET_RAW or root), otherwise runs the system `ping` command with a
//! single echo request.

use crate::error::ProbeError;
use crate::model::Target;
use async_trait::async_trait;
use pnet_packet::icmp::IcmpTypes;
use socket2::{Domain, Protocol, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Round-trip time in milliseconds.
    async fn measure(&self, target: &Target) -> Result<f64, ProbeError>;
}

/// Latency probe against the target's bare hostname.
pub struct PingProbe {
    timeout: Duration,
}

impl PingProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl LatencyProbe for PingProbe {
    async fn measure(&self, target: &Target) -> Result<f64, ProbeError> {
        let host = extract_hostname(target.as_str())
            .ok_or_else(|| ProbeError::MalformedTarget(target.to_string()))?;
        log::debug!("Pinging hostname: {}", host);

        // DNS and the echo share one budget
        let deadline = Instant::now() + self.timeout;
        match tokio::time::timeout(self.timeout, echo_host(&host, deadline)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::unreachable(&host, "ping timed out")),
        }
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

async fn echo_host(host: &str, deadline: Instant) -> Result<f64, ProbeError> {
    let ip = resolve_host(host, remaining(deadline)).await?;

    if let IpAddr::V4(v4) = ip {
        let budget = remaining(deadline);
        let attempt = tokio::task::spawn_blocking(move || icmp_echo_v4(v4, budget))
            .await
            .map_err(|e| ProbeError::unreachable(host, e.to_string()))?;
        match attempt {
            Ok(Some(ms)) => return Ok(ms),
            Ok(None) => return Err(ProbeError::unreachable(host, "no echo reply before timeout")),
            Err(e) => {
                log::debug!("Raw ICMP unavailable ({}), using system ping", e);
            }
        }
    }

    run_system_ping(host, remaining(deadline)).await
}

/// Extract the bare hostname from a target: scheme, userinfo, port and path are
/// dropped. Targets without a scheme are read as `host[:port][/path]`.
pub fn extract_hostname(target: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(target)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| reqwest::Url::parse(&format!("http://{}", target)).ok())?;
    let host = parsed.host_str()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

async fn resolve_host(host: &str, timeout: Duration) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let lookup = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
        .await
        .map_err(|_| ProbeError::unreachable(host, "DNS lookup timed out"))?
        .map_err(|e| ProbeError::unreachable(host, format!("DNS lookup failed: {}", e)))?;
    let addrs: Vec<SocketAddr> = lookup.collect();
    // Prefer IPv4 so the raw socket path can be used
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip())
        .ok_or_else(|| ProbeError::unreachable(host, "no addresses found"))
}

/// Send one echo request and wait for the matching reply.
///
/// `Err` means the raw socket could not be set up at all; `Ok(None)` means the
/// probe went out but nothing came back in time.
fn icmp_echo_v4(dest: Ipv4Addr, timeout: Duration) -> std::io::Result<Option<f64>> {
    if timeout.is_zero() {
        return Ok(None);
    }
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_nonblocking(false)?;

    let icmp_id = std::process::id() as u16;
    let icmp_seq = rand::random::<u16>();
    let packet = build_icmp_packet(icmp_id, icmp_seq);
    let dest_addr = SocketAddr::new(IpAddr::V4(dest), 0);

    let start = Instant::now();
    if socket.send_to(&packet, &dest_addr.into()).is_err() {
        return Ok(None);
    }

    // A raw socket sees every ICMP packet on the host; skip the ones that are not ours.
    while start.elapsed() < timeout {
        let remaining = timeout.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        socket.set_read_timeout(Some(remaining))?;

        let mut recv_buf = [MaybeUninit::<u8>::uninit(); 512];
        let (len, from) = match socket.recv_from(&mut recv_buf) {
            Ok(r) => r,
            Err(_) => return Ok(None),
        };
        // Safe: the kernel initialised the first `len` bytes.
        let data: Vec<u8> = recv_buf[..len]
            .iter()
            .map(|b| unsafe { b.assume_init() })
            .collect();

        let from_ip = from.as_socket().map(|a| a.ip());
        if from_ip == Some(IpAddr::V4(dest)) && is_echo_reply_for(&data, icmp_id, icmp_seq) {
            return Ok(Some(start.elapsed().as_secs_f64() * 1000.0));
        }
    }
    Ok(None)
}

/// Check an IPv4 datagram for an echo reply carrying our identifier and sequence.
fn is_echo_reply_for(datagram: &[u8], id: u16, seq: u16) -> bool {
    let Some(first) = datagram.first() else {
        return false;
    };
    let ihl = ((first & 0x0f) as usize) * 4;
    if datagram.len() < ihl + 8 {
        return false;
    }
    let icmp = &datagram[ihl..];
    icmp[0] == IcmpTypes::EchoReply.0
        && u16::from_be_bytes([icmp[4], icmp[5]]) == id
        && u16::from_be_bytes([icmp[6], icmp[7]]) == seq
}

/// Build an ICMP echo request packet.
fn build_icmp_packet(id: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = IcmpTypes::EchoRequest.0;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&id.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    for (i, b) in packet.iter_mut().enumerate().skip(8) {
        *b = (i - 8) as u8;
    }

    let checksum = calculate_icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

fn calculate_icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !sum as u16
}

/// Arguments for a single echo request bounded by `timeout`.
fn ping_args(host: &str, timeout: Duration) -> Vec<String> {
    let wait = if cfg!(target_os = "windows") || cfg!(target_os = "macos") {
        // -w / -W take milliseconds here
        timeout.as_millis().max(1).to_string()
    } else {
        // iputils takes fractional seconds
        format!("{:.3}", timeout.as_secs_f64().max(0.001))
    };
    let (count_flag, wait_flag) = if cfg!(target_os = "windows") {
        ("-n", "-w")
    } else {
        ("-c", "-W")
    };
    vec![
        count_flag.to_string(),
        "1".to_string(),
        wait_flag.to_string(),
        wait,
        host.to_string(),
    ]
}

/// Fall back to the system ping command with a single echo request.
async fn run_system_ping(host: &str, timeout: Duration) -> Result<f64, ProbeError> {
    if timeout.is_zero() {
        return Err(ProbeError::unreachable(host, "ping timed out"));
    }

    let child = tokio::process::Command::new("ping")
        .args(ping_args(host, timeout))
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| ProbeError::unreachable(host, "ping timed out"))?
        .map_err(|e| ProbeError::unreachable(host, format!("failed to run ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    match parse_ping_rtt(&stdout) {
        Some(ms) if output.status.success() => Ok(ms),
        _ => Err(ProbeError::unreachable(host, "no echo reply")),
    }
}

/// Pull the round-trip time out of ping output.
///
/// Linux/macOS: `64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=12.3 ms`
/// Windows: `Reply from 1.1.1.1: bytes=32 time=12ms TTL=57` or `time<1ms`
fn parse_ping_rtt(output: &str) -> Option<f64> {
    for line in output.lines() {
        let Some(pos) = line.find("time=").or_else(|| line.find("time<")) else {
            continue;
        };
        let rest = &line[pos + 5..];
        let num: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(ms) = num.parse::<f64>() {
            return Some(ms);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_hostname() {
        assert_eq!(
            extract_hostname("https://speed.example.net"),
            Some("speed.example.net".to_string())
        );
        assert_eq!(
            extract_hostname("https://example.com:8080/path/file.bin"),
            Some("example.com".to_string())
        );
        assert_eq!(
            extract_hostname("ftp.example.org:2121/pub"),
            Some("ftp.example.org".to_string())
        );
        assert_eq!(
            extract_hostname("http://user:pw@10.0.0.1:81/"),
            Some("10.0.0.1".to_string())
        );
        assert_eq!(extract_hostname("http://[::1]:8080/x"), Some("::1".to_string()));
        assert_eq!(extract_hostname("not a url"), None);
    }

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_icmp_packet(0x1234, 7);
        assert_eq!(packet[0], IcmpTypes::EchoRequest.0);
        // Summing a packet including its checksum yields zero.
        assert_eq!(calculate_icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_echo_reply_matching() {
        let mut datagram = vec![0u8; 20];
        datagram[0] = 0x45;
        let mut icmp = build_icmp_packet(42, 9);
        icmp[0] = IcmpTypes::EchoReply.0;
        datagram.extend_from_slice(&icmp);

        assert!(is_echo_reply_for(&datagram, 42, 9));
        assert!(!is_echo_reply_for(&datagram, 43, 9));
        assert!(!is_echo_reply_for(&datagram, 42, 10));
        assert!(!is_echo_reply_for(&datagram[..24], 42, 9));
        assert!(!is_echo_reply_for(&[], 42, 9));
    }

    #[test]
    fn test_parse_ping_rtt() {
        let linux = "PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.\n\
                     64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=12.3 ms\n";
        assert_eq!(parse_ping_rtt(linux), Some(12.3));

        let windows = "Reply from 1.1.1.1: bytes=32 time=8ms TTL=57";
        assert_eq!(parse_ping_rtt(windows), Some(8.0));

        let windows_fast = "Reply from 192.168.1.1: bytes=32 time<1ms TTL=64";
        assert_eq!(parse_ping_rtt(windows_fast), Some(1.0));

        assert_eq!(parse_ping_rtt("Request timed out."), None);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_ping_args_keep_sub_second_wait() {
        assert_eq!(
            ping_args("10.0.0.1", Duration::from_millis(300)),
            vec!["-c", "1", "-W", "0.300", "10.0.0.1"]
        );
        assert_eq!(ping_args("h", Duration::from_millis(2500))[3], "2.500");
    }

    #[tokio::test]
    async fn test_blackholed_host_returns_within_timeout() {
        let timeout = Duration::from_millis(300);
        let probe = PingProbe::new(timeout);
        // Unrouted private address, nothing answers
        let target = Target::new("http://10.255.255.1/file").unwrap();

        let start = Instant::now();
        let result = probe.measure(&target).await;
        let elapsed = start.elapsed();

        assert!(result.is_err());
        assert!(
            elapsed < timeout + Duration::from_millis(200),
            "took {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_system_ping() {
        let err = run_system_ping("10.255.255.1", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::UnreachableHost { .. }));
        assert_eq!(icmp_echo_v4(Ipv4Addr::LOCALHOST, Duration::ZERO).unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_target_is_not_fatal() {
        let probe = PingProbe::new(Duration::from_millis(200));
        let target = Target::new("not a url").unwrap();
        let err = probe.measure(&target).await.unwrap_err();
        assert!(matches!(err, ProbeError::MalformedTarget(_)));
    }
}
