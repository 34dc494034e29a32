//! Request/response access to the monitored host.
//!
//! [`TelemetrySource`] is the seam the refresh engine polls through. The base
//! address is passed per call so one source can serve whichever target the
//! engine was started for.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};
use crate::types::{
    CoreStats, CpuResponse, CpuStats, CpuUsage, ExternalTemperature, KillRequest, MemoryResponse,
    ProcessInfo, ProcessList,
};

#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    async fn cpu(&self, base: &Url) -> Result<CpuResponse>;
    async fn memory(&self, base: &Url) -> Result<MemoryResponse>;
    async fn processes(&self, base: &Url) -> Result<ProcessList>;
    async fn external_temperature(&self, base: &Url) -> Result<ExternalTemperature>;
    async fn kill_process(&self, base: &Url, pid: u32) -> Result<()>;
}

/// Plain HTTP/JSON client for the host's status API.
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent(concat!("pimon/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn get_json<T: DeserializeOwned>(&self, base: &Url, path: &str) -> Result<T> {
        let url = base.join(path)?;
        debug!(%url, "GET");
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl TelemetrySource for HttpSource {
    async fn cpu(&self, base: &Url) -> Result<CpuResponse> {
        self.get_json(base, "cpu").await
    }

    async fn memory(&self, base: &Url) -> Result<MemoryResponse> {
        self.get_json(base, "memory").await
    }

    async fn processes(&self, base: &Url) -> Result<ProcessList> {
        self.get_json(base, "processes").await
    }

    async fn external_temperature(&self, base: &Url) -> Result<ExternalTemperature> {
        self.get_json(base, "ext_temp").await
    }

    async fn kill_process(&self, base: &Url, pid: u32) -> Result<()> {
        let url = base.join("control/process/kill")?;
        debug!(%url, pid, "POST");
        let resp = self
            .client
            .post(url)
            .json(&KillRequest { pid })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

// --- Demo host ---

struct DemoState {
    tick: u64,
    counters: CpuStats,
    used_ram: u64,
    processes: Vec<ProcessInfo>,
}

/// In-process synthetic host: counters only ever grow, killed pids disappear
/// from the next process list.
pub struct DemoSource {
    state: Mutex<DemoState>,
}

const DEMO_TOTAL_RAM: u64 = 3_882_924;

impl DemoSource {
    pub fn new() -> Self {
        let names = ["systemd", "kworker/0:1", "irq/51", "node", "sshd", "pimon-agent"];
        let processes = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let i = i as u64;
                ProcessInfo {
                    pid: i as u32 + 1,
                    name: (*name).to_string(),
                    state_code: "S".into(),
                    state_description: "sleeping".into(),
                    user: "1000".into(),
                    group: "1000".into(),
                    memory_rss: 80_000 + i * 13_000,
                    memory_virt: 200_000 + i * 17_000,
                    swap: 0,
                    threads: 1 + (i as u32 % 6),
                    utime: 0,
                }
            })
            .collect();
        Self {
            state: Mutex::new(DemoState {
                tick: 0,
                counters: CpuStats {
                    user_norm: 100,
                    kernel: 200,
                    idle: 3000,
                    ..CpuStats::default()
                },
                used_ram: 1_500_000,
                processes,
            }),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DemoState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}

impl Default for DemoSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetrySource for DemoSource {
    async fn cpu(&self, _base: &Url) -> Result<CpuResponse> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(self.with_state(|s| {
            s.tick += 1;
            let t = s.tick;
            s.counters.user_norm += 1 + (t * 7) % 5;
            s.counters.kernel += 2 + (t * 3) % 5;
            s.counters.idle += 8 + (t * 11) % 13;
            let full = s.counters;
            CpuResponse {
                cpu_temperature: Some(20.0 + ((t * 12) % 68) as f32),
                cpu_usage: CpuUsage {
                    full,
                    cores: vec![CoreStats {
                        core_id: 0,
                        stats: full,
                    }],
                },
            }
        }))
    }

    async fn memory(&self, _base: &Url) -> Result<MemoryResponse> {
        Ok(self.with_state(|s| {
            let swing = (s.tick * 37_000) % 600_000;
            let used = (s.used_ram + swing).min(DEMO_TOTAL_RAM);
            MemoryResponse {
                total: DEMO_TOTAL_RAM,
                available: DEMO_TOTAL_RAM - used,
                free: (DEMO_TOTAL_RAM - used) / 2,
            }
        }))
    }

    async fn processes(&self, _base: &Url) -> Result<ProcessList> {
        Ok(self.with_state(|s| {
            let t = s.tick;
            for (i, p) in s.processes.iter_mut().enumerate() {
                p.utime += t % (i as u64 + 2);
            }
            ProcessList {
                processes: s.processes.clone(),
            }
        }))
    }

    async fn external_temperature(&self, _base: &Url) -> Result<ExternalTemperature> {
        Ok(self.with_state(|s| ExternalTemperature {
            temperature: 21.5 + (s.tick % 7) as f32 * 0.5,
        }))
    }

    async fn kill_process(&self, _base: &Url, pid: u32) -> Result<()> {
        self.with_state(|s| {
            let before = s.processes.len();
            s.processes.retain(|p| p.pid != pid);
            if s.processes.len() == before {
                Err(Error::Status {
                    status: 404,
                    body: format!("no process {pid}"),
                })
            } else {
                Ok(())
            }
        })
    }
}
