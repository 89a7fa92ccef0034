//! Network collection: periodic connection snapshots into a flow table,
//! with traffic, suspicious-destination, and port-scan analysis.
//!
//! Three periodic tasks share the flow table behind a readers/writer lock:
//! the monitor upserts flows (write), the analyzer evicts stale flows and
//! emits traffic/port findings (write), the scan detector groups flows by
//! source (read).

use crate::collectors::emit;
use crate::event::{Category, Event, Severity};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::info;

const MONITOR_INTERVAL_SECS: u64 = 5;
const ANALYZER_INTERVAL_SECS: u64 = 30;
const SCAN_DETECTOR_INTERVAL_SECS: u64 = 15;
const STALE_FLOW_MINUTES: i64 = 5;
const HIGH_TRAFFIC_PACKETS: i64 = 100;
const PORT_SCAN_UNIQUE_PORTS: usize = 20;
const SCAN_SAMPLE_PORTS: usize = 10;

/// Destination ports commonly tied to backdoors, C2, and proxy abuse.
const SUSPICIOUS_PORTS: &[u16] = &[1080, 4444, 5555, 6666, 6667, 12345, 27374, 31337];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: String,
    pub dst_ip: String,
    pub dst_port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct FlowStats {
    pub packets: i64,
    pub bytes: i64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub local_addr: String,
    pub remote_addr: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: String,
    pub state: String,
}

pub struct NetworkCollector {
    interface: String,
    flows: Arc<RwLock<HashMap<FlowKey, FlowStats>>>,
    tx: mpsc::Sender<Event>,
}

impl NetworkCollector {
    pub fn new(interface: String, tx: mpsc::Sender<Event>) -> Self {
        Self {
            interface,
            flows: Arc::new(RwLock::new(HashMap::new())),
            tx,
        }
    }

    pub fn name(&self) -> &'static str {
        "network"
    }

    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "network collector: monitoring connections on interface {}",
            if self.interface.is_empty() { "(all)" } else { &self.interface }
        );

        let monitor = tokio::spawn(run_ticker(
            MONITOR_INTERVAL_SECS,
            shutdown.clone(),
            {
                let flows = self.flows.clone();
                move || {
                    let connections = system_connections();
                    for conn in connections {
                        record_flow(&flows, &conn);
                    }
                }
            },
        ));

        let analyzer = tokio::spawn(run_ticker(
            ANALYZER_INTERVAL_SECS,
            shutdown.clone(),
            {
                let flows = self.flows.clone();
                let tx = self.tx.clone();
                move || analyze_flows(&flows, &tx)
            },
        ));

        let scanner = tokio::spawn(run_ticker(
            SCAN_DETECTOR_INTERVAL_SECS,
            shutdown.clone(),
            {
                let flows = self.flows.clone();
                let tx = self.tx.clone();
                move || detect_port_scans(&flows, &tx)
            },
        ));

        let _ = monitor.await;
        let _ = analyzer.await;
        let _ = scanner.await;
        Ok(())
    }

    pub fn flow_count(&self) -> usize {
        self.flows.read().unwrap().len()
    }

    /// Deep copy of the flow table.
    pub fn get_flows(&self) -> HashMap<FlowKey, FlowStats> {
        self.flows.read().unwrap().clone()
    }

    pub fn inject_flow(&self, key: FlowKey, stats: FlowStats) {
        self.flows.write().unwrap().insert(key, stats);
    }

    /// Run one analyzer pass immediately (stale eviction + flow findings).
    pub fn analyze_now(&self) {
        analyze_flows(&self.flows, &self.tx);
    }

    /// Run one scan-detector pass immediately.
    pub fn detect_scans_now(&self) {
        detect_port_scans(&self.flows, &self.tx);
    }
}

async fn run_ticker<F: FnMut() + Send + 'static>(
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so passes are spaced out
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = interval.tick() => tick(),
        }
    }
}

fn record_flow(flows: &RwLock<HashMap<FlowKey, FlowStats>>, conn: &ConnectionInfo) {
    let key = FlowKey {
        src_ip: conn.local_addr.clone(),
        dst_ip: conn.remote_addr.clone(),
        dst_port: conn.remote_port,
        protocol: conn.protocol.clone(),
    };

    let now = Utc::now();
    let mut flows = flows.write().unwrap();
    match flows.get_mut(&key) {
        Some(flow) => {
            flow.packets += 1;
            flow.last_seen = now;
        }
        None => {
            flows.insert(
                key,
                FlowStats {
                    packets: 1,
                    bytes: 0,
                    first_seen: now,
                    last_seen: now,
                },
            );
        }
    }
}

fn analyze_flows(flows: &RwLock<HashMap<FlowKey, FlowStats>>, tx: &mpsc::Sender<Event>) {
    let now = Utc::now();
    let stale_cutoff = now - ChronoDuration::minutes(STALE_FLOW_MINUTES);

    let mut flows = flows.write().unwrap();
    flows.retain(|_, flow| flow.last_seen >= stale_cutoff);

    for (key, flow) in flows.iter() {
        if flow.packets > HIGH_TRAFFIC_PACKETS {
            let event = Event::new(
                "network",
                Category::HighTraffic,
                Severity::Medium,
                format!(
                    "High traffic flow: {} -> {}:{} ({} packets)",
                    key.src_ip, key.dst_ip, key.dst_port, flow.packets
                ),
            )
            .with_time(now)
            .with_payload("src_ip", key.src_ip.clone())
            .with_payload("dst_ip", key.dst_ip.clone())
            .with_payload("dst_port", key.dst_port)
            .with_payload("protocol", key.protocol.clone())
            .with_payload("packets", flow.packets)
            .with_payload("bytes", flow.bytes)
            .with_payload(
                "duration",
                (flow.last_seen - flow.first_seen).num_milliseconds() as f64 / 1000.0,
            );
            emit(tx, "network", event);
        }

        if SUSPICIOUS_PORTS.contains(&key.dst_port) {
            let event = Event::new(
                "network",
                Category::SuspiciousPort,
                Severity::High,
                format!(
                    "Connection to suspicious port: {} -> {}:{}",
                    key.src_ip, key.dst_ip, key.dst_port
                ),
            )
            .with_time(now)
            .with_payload("src_ip", key.src_ip.clone())
            .with_payload("dst_ip", key.dst_ip.clone())
            .with_payload("dst_port", key.dst_port)
            .with_payload("protocol", key.protocol.clone());
            emit(tx, "network", event);
        }
    }
}

fn detect_port_scans(flows: &RwLock<HashMap<FlowKey, FlowStats>>, tx: &mpsc::Sender<Event>) {
    let flows = flows.read().unwrap();

    let mut ports_by_source: HashMap<&str, HashSet<u16>> = HashMap::new();
    for key in flows.keys() {
        ports_by_source
            .entry(key.src_ip.as_str())
            .or_default()
            .insert(key.dst_port);
    }

    for (src_ip, ports) in ports_by_source {
        if ports.len() > PORT_SCAN_UNIQUE_PORTS {
            let sample: Vec<u16> = ports.iter().copied().take(SCAN_SAMPLE_PORTS).collect();
            let event = Event::new(
                "network",
                Category::PortScan,
                Severity::High,
                format!(
                    "Potential port scan from {}: {} unique ports contacted",
                    src_ip,
                    ports.len()
                ),
            )
            .with_payload("src_ip", src_ip)
            .with_payload("unique_ports", ports.len())
            .with_payload(
                "sample_ports",
                sample.iter().map(|p| serde_json::Value::from(*p)).collect::<Vec<_>>(),
            );
            emit(tx, "network", event);
        }
    }
}

/// Snapshot the OS connection table, dropping rows with an unset remote
/// address.
fn system_connections() -> Vec<ConnectionInfo> {
    #[cfg(target_os = "linux")]
    {
        let mut connections = parse_proc_net_file("/proc/net/tcp", "tcp");
        connections.extend(parse_proc_net_file("/proc/net/udp", "udp"));
        connections
    }
    #[cfg(not(target_os = "linux"))]
    {
        netstat_connections()
    }
}

#[cfg(target_os = "linux")]
fn parse_proc_net_file(path: &str, protocol: &str) -> Vec<ConnectionInfo> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_proc_net(&content, protocol),
        Err(_) => Vec::new(),
    }
}

/// Parse `/proc/net/tcp`-format content. Addresses are hex-encoded
/// little-endian IPv4 and the port is big-endian, a Linux quirk that must
/// be matched exactly.
fn parse_proc_net(content: &str, protocol: &str) -> Vec<ConnectionInfo> {
    let mut connections = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let Some((local_addr, local_port)) = parse_hex_addr(fields[1]) else {
            continue;
        };
        let Some((remote_addr, remote_port)) = parse_hex_addr(fields[2]) else {
            continue;
        };

        if remote_addr == "0.0.0.0" || remote_addr == "::" {
            continue;
        }

        connections.push(ConnectionInfo {
            local_addr,
            remote_addr,
            local_port,
            remote_port,
            protocol: protocol.to_string(),
            state: decode_conn_state(fields[3]).to_string(),
        });
    }

    connections
}

fn parse_hex_addr(s: &str) -> Option<(String, u16)> {
    let (addr_hex, port_hex) = s.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;

    if addr_hex.len() == 8 {
        let addr_u32 = u32::from_str_radix(addr_hex, 16).ok()?;
        let addr = std::net::Ipv4Addr::from(addr_u32.swap_bytes());
        return Some((addr.to_string(), port));
    }

    Some((addr_hex.to_string(), port))
}

fn decode_conn_state(hex: &str) -> &'static str {
    match hex {
        "01" => "ESTABLISHED",
        "02" => "SYN_SENT",
        "03" => "SYN_RECV",
        "04" => "FIN_WAIT1",
        "05" => "FIN_WAIT2",
        "06" => "TIME_WAIT",
        "07" => "CLOSE",
        "08" => "CLOSE_WAIT",
        "09" => "LAST_ACK",
        "0A" => "LISTEN",
        "0B" => "CLOSING",
        _ => "UNKNOWN",
    }
}

#[cfg(not(target_os = "linux"))]
fn netstat_connections() -> Vec<ConnectionInfo> {
    let args: &[&str] = if cfg!(target_os = "windows") {
        &["-n", "-o"]
    } else {
        &["-n", "-p", "tcp"]
    };
    match std::process::Command::new("netstat").args(args).output() {
        Ok(out) => parse_netstat(&String::from_utf8_lossy(&out.stdout)),
        Err(_) => Vec::new(),
    }
}

/// Tokenize `netstat -n` output on platforms without /proc.
#[allow(dead_code)]
fn parse_netstat(output: &str) -> Vec<ConnectionInfo> {
    let mut connections = Vec::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }

        let proto = fields[0].to_lowercase();
        if proto != "tcp" && proto != "udp" {
            continue;
        }

        let (local_addr, local_port) = split_addr_port(fields[1]);
        let (remote_addr, remote_port) = split_addr_port(fields[2]);

        if remote_addr == "0.0.0.0" || remote_addr == "*" || remote_addr == "::" {
            continue;
        }

        connections.push(ConnectionInfo {
            local_addr,
            remote_addr,
            local_port,
            remote_port,
            protocol: proto,
            state: fields[3].to_string(),
        });
    }

    connections
}

#[allow(dead_code)]
fn split_addr_port(s: &str) -> (String, u16) {
    match s.rsplit_once([':', '.']) {
        Some((addr, port)) => (addr.to_string(), port.parse().unwrap_or(0)),
        None => (s.to_string(), 0),
    }
}
