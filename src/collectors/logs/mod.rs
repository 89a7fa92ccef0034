//! Log collection: a UDP syslog listener plus file tailing, parsed into
//! normalized events.

mod parsers;

pub use parsers::{detect_parser, parse_auth_log, parse_nginx_access, parse_syslog};

use crate::collectors::emit;
use crate::event::Event;
use anyhow::Result;
use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const SYSLOG_READ_BUF: usize = 65536;
const TAIL_READ_BUF: usize = 4096;
const TAIL_IDLE_MS: u64 = 100;

pub struct LogCollector {
    sources: Vec<String>,
    syslog_addr: String,
    tx: mpsc::Sender<Event>,
}

impl LogCollector {
    pub fn new(sources: Vec<String>, syslog_addr: String, tx: mpsc::Sender<Event>) -> Self {
        let syslog_addr = if syslog_addr.is_empty() {
            "0.0.0.0:1514".to_string()
        } else {
            syslog_addr
        };
        Self {
            sources,
            syslog_addr,
            tx,
        }
    }

    pub fn name(&self) -> &'static str {
        "logs"
    }

    /// Spawn one task per source and wait for all of them. With no sources
    /// configured, a default syslog listener is started.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut handles = Vec::new();

        for src in &self.sources {
            if let Some(addr) = src.strip_prefix("syslog://") {
                let addr = if addr.is_empty() {
                    self.syslog_addr.clone()
                } else {
                    addr.to_string()
                };
                handles.push(tokio::spawn(run_syslog_listener(
                    addr,
                    self.tx.clone(),
                    shutdown.clone(),
                )));
            } else if let Some(path) = src.strip_prefix("file://") {
                handles.push(tokio::spawn(tail_file(
                    path.to_string(),
                    self.tx.clone(),
                    shutdown.clone(),
                )));
            } else if std::path::Path::new(src).exists() {
                handles.push(tokio::spawn(tail_file(
                    src.clone(),
                    self.tx.clone(),
                    shutdown.clone(),
                )));
            } else {
                warn!("log collector: unknown source {:?}", src);
            }
        }

        if self.sources.is_empty() {
            handles.push(tokio::spawn(run_syslog_listener(
                self.syslog_addr.clone(),
                self.tx.clone(),
                shutdown.clone(),
            )));
        }

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn run_syslog_listener(
    addr: String,
    tx: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let socket = match UdpSocket::bind(&addr).await {
        Ok(s) => s,
        Err(e) => {
            error!("log collector: failed to start syslog listener on {}: {}", addr, e);
            return;
        }
    };

    info!("log collector: syslog listener started on {}", addr);

    let mut buf = vec![0u8; SYSLOG_READ_BUF];
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            res = socket.recv_from(&mut buf) => {
                let n = match res {
                    Ok((n, _)) => n,
                    Err(e) => {
                        warn!("log collector: syslog read error: {}", e);
                        continue;
                    }
                };

                let line = String::from_utf8_lossy(&buf[..n]);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                emit(&tx, "logs", parse_syslog(line));
            }
        }
    }
}

async fn tail_file(path: String, tx: mpsc::Sender<Event>, mut shutdown: watch::Receiver<bool>) {
    let parser = detect_parser(&path);

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            error!("log collector: cannot open {}: {}", path, e);
            return;
        }
    };

    if let Err(e) = file.seek(SeekFrom::End(0)).await {
        error!("log collector: cannot seek {}: {}", path, e);
        return;
    }

    info!("log collector: tailing {}", path);

    let mut partial: Vec<u8> = Vec::new();
    let mut buf = [0u8; TAIL_READ_BUF];

    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => return,
            res = file.read(&mut buf) => match res {
                Ok(n) => n,
                Err(e) => {
                    error!("log collector: read error on {}: {}", path, e);
                    return;
                }
            }
        };

        if n == 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(TAIL_IDLE_MS)).await;
            continue;
        }

        partial.extend_from_slice(&buf[..n]);

        while let Some(idx) = partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = partial.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            emit(&tx, "logs", parser(line));
        }
    }
}
