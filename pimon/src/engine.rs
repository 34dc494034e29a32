//! Refresh engine: polls the four telemetry facets on a timer and keeps derived metrics.
//!
//! Every run is tagged with a generation number stored in the published
//! [`Telemetry`] value. Writes compare their generation under the watch lock,
//! so a fetch that completes after `stop()` or a restart changes nothing.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::metrics::{cpu_percent, memory_gb_pair, memory_percent};
use crate::source::TelemetrySource;
use crate::targets::Target;
use crate::types::{
    CpuResponse, CpuStats, ExternalTemperature, MemoryResponse, ProcessList, Resource,
};

/// Current state of all facets plus the numbers derived from them.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    pub generation: u64,
    pub target: Option<Target>,

    pub cpu: Resource<CpuResponse>,
    pub memory: Resource<MemoryResponse>,
    pub processes: Resource<ProcessList>,
    pub ext_temp: Resource<ExternalTemperature>,

    /// Pids with an accepted kill request that are still listed by the host.
    pub killing: BTreeSet<u32>,

    pub cpu_percent_used: Option<f32>,
    pub cpu_temperature: Option<f32>,
    pub external_temperature: Option<f32>,
    pub used_ram_percent: Option<f32>,
    pub used_ram_gb: Option<(f32, f32)>,

    prev_cpu: Option<CpuStats>,
}

impl Telemetry {
    fn fresh(generation: u64, target: Target) -> Self {
        Self {
            generation,
            target: Some(target),
            ..Self::default()
        }
    }

    pub fn is_loading(&self) -> bool {
        self.cpu.is_loading()
            || self.memory.is_loading()
            || self.processes.is_loading()
            || self.ext_temp.is_loading()
    }

    pub fn is_error(&self) -> bool {
        self.cpu.is_error()
            || self.memory.is_error()
            || self.processes.is_error()
            || self.ext_temp.is_error()
    }
}

/// One-shot outcomes of kill requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEffect {
    KillSucceeded { pid: u32 },
    KillFailed { pid: u32, message: String },
}

struct Shared {
    source: Arc<dyn TelemetrySource>,
    state: watch::Sender<Telemetry>,
    effects: mpsc::UnboundedSender<EngineEffect>,
    live_loops: AtomicUsize,
}

impl Shared {
    /// Apply `f` only if `generation` is still the published one.
    fn publish(&self, generation: u64, f: impl FnOnce(&mut Telemetry)) -> bool {
        self.state.send_if_modified(|t| {
            if t.generation != generation {
                return false;
            }
            f(t);
            true
        })
    }
}

struct Run {
    base: Url,
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct RefreshEngine {
    shared: Arc<Shared>,
    interval: Duration,
    run: Mutex<Option<Run>>,
}

impl RefreshEngine {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<EngineEffect>) {
        let (state, _) = watch::channel(Telemetry::default());
        let (effects, effects_rx) = mpsc::unbounded_channel();
        let engine = Self {
            shared: Arc::new(Shared {
                source,
                state,
                effects,
                live_loops: AtomicUsize::new(0),
            }),
            interval,
            run: Mutex::new(None),
        };
        (engine, effects_rx)
    }

    /// Start polling `target`, cancelling any previous run first.
    /// Must be called from within a tokio runtime.
    pub fn start(&self, target: Target) -> Result<()> {
        let base = target.http_base()?;
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = run.take() {
            prev.handle.abort();
        }

        let mut generation = 0;
        self.shared.state.send_modify(|t| {
            generation = t.generation + 1;
            *t = Telemetry::fresh(generation, target.clone());
        });
        info!(%target, generation, "refresh loop starting");

        let handle = tokio::spawn(refresh_loop(
            self.shared.clone(),
            base.clone(),
            generation,
            self.interval,
        ));
        *run = Some(Run {
            base,
            generation,
            handle,
        });
        Ok(())
    }

    /// Cancel the active loop. Idempotent.
    pub fn stop(&self) {
        let mut run = self.run.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(prev) = run.take() {
            // Invalidate before aborting so nothing in flight can land.
            self.shared.state.send_modify(|t| t.generation += 1);
            prev.handle.abort();
            info!(generation = prev.generation, "refresh loop stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Number of loop tasks still alive (an aborted loop counts until the runtime drops it).
    pub fn live_loops(&self) -> usize {
        self.shared.live_loops.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<Telemetry> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> Telemetry {
        self.shared.state.borrow().clone()
    }

    /// Fire-and-forget kill; the outcome arrives as an [`EngineEffect`].
    pub fn kill_process(&self, pid: u32) -> JoinHandle<()> {
        let current = {
            let run = self.run.lock().unwrap_or_else(|e| e.into_inner());
            run.as_ref().map(|r| (r.base.clone(), r.generation))
        };
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let Some((base, generation)) = current else {
                let _ = shared.effects.send(EngineEffect::KillFailed {
                    pid,
                    message: Error::NotStarted.to_string(),
                });
                return;
            };
            match shared.source.kill_process(&base, pid).await {
                Ok(()) => {
                    shared.publish(generation, |t| {
                        t.killing.insert(pid);
                    });
                    let _ = shared.effects.send(EngineEffect::KillSucceeded { pid });
                }
                Err(e) => {
                    warn!(pid, error = %e, "kill request failed");
                    let _ = shared.effects.send(EngineEffect::KillFailed {
                        pid,
                        message: e.to_string(),
                    });
                }
            }
        })
    }
}

impl Drop for RefreshEngine {
    fn drop(&mut self) {
        if let Some(run) = self.run.get_mut().ok().and_then(Option::take) {
            run.handle.abort();
        }
    }
}

// Counts live loops; decremented when the loop future is dropped (finished or aborted).
struct LoopGuard(Arc<Shared>);

impl LoopGuard {
    fn new(shared: Arc<Shared>) -> Self {
        shared.live_loops.fetch_add(1, Ordering::SeqCst);
        Self(shared)
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.live_loops.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn refresh_loop(shared: Arc<Shared>, base: Url, generation: u64, interval: Duration) {
    let _guard = LoopGuard::new(shared.clone());
    let mut initial = true;
    loop {
        fetch_round(&shared, &base, generation, initial).await;
        if !initial {
            sleep(interval).await;
        }
        initial = false;
    }
}

/// All four facets concurrently; each one only ever touches its own resource.
async fn fetch_round(shared: &Shared, base: &Url, generation: u64, show_loading: bool) {
    tokio::join!(
        fetch_cpu(shared, base, generation, show_loading),
        fetch_memory(shared, base, generation, show_loading),
        fetch_processes(shared, base, generation, show_loading),
        fetch_ext_temp(shared, base, generation, show_loading),
    );
    debug!(generation, "refresh round done");
}

fn error_message(e: &Error) -> String {
    format!("Error: {e}")
}

async fn fetch_cpu(shared: &Shared, base: &Url, generation: u64, show_loading: bool) {
    if show_loading {
        shared.publish(generation, |t| t.cpu = Resource::Loading);
    }
    match shared.source.cpu(base).await {
        Ok(resp) => {
            shared.publish(generation, |t| {
                let full = resp.cpu_usage.full;
                t.cpu_percent_used = Some(cpu_percent(t.prev_cpu.as_ref(), &full));
                t.cpu_temperature = resp.cpu_temperature;
                t.prev_cpu = Some(full);
                t.cpu = Resource::Success(resp);
            });
        }
        Err(e) => {
            warn!(facet = "cpu", error = %e, "fetch failed");
            shared.publish(generation, |t| t.cpu = Resource::Error(error_message(&e)));
        }
    }
}

async fn fetch_memory(shared: &Shared, base: &Url, generation: u64, show_loading: bool) {
    if show_loading {
        shared.publish(generation, |t| t.memory = Resource::Loading);
    }
    let result = shared.source.memory(base).await.and_then(|m| {
        if m.total == 0 {
            Err(Error::malformed("memory total is zero"))
        } else {
            Ok(m)
        }
    });
    match result {
        Ok(m) => {
            shared.publish(generation, |t| {
                t.used_ram_percent = Some(memory_percent(&m));
                t.used_ram_gb = Some(memory_gb_pair(&m));
                t.memory = Resource::Success(m);
            });
        }
        Err(e) => {
            warn!(facet = "memory", error = %e, "fetch failed");
            shared.publish(generation, |t| t.memory = Resource::Error(error_message(&e)));
        }
    }
}

async fn fetch_processes(shared: &Shared, base: &Url, generation: u64, show_loading: bool) {
    if show_loading {
        shared.publish(generation, |t| t.processes = Resource::Loading);
    }
    match shared.source.processes(base).await {
        Ok(list) => {
            shared.publish(generation, |t| {
                t.killing.retain(|pid| list.contains(*pid));
                t.processes = Resource::Success(list);
            });
        }
        Err(e) => {
            warn!(facet = "processes", error = %e, "fetch failed");
            shared.publish(generation, |t| {
                t.processes = Resource::Error(error_message(&e))
            });
        }
    }
}

async fn fetch_ext_temp(shared: &Shared, base: &Url, generation: u64, show_loading: bool) {
    if show_loading {
        shared.publish(generation, |t| t.ext_temp = Resource::Loading);
    }
    match shared.source.external_temperature(base).await {
        Ok(v) => {
            shared.publish(generation, |t| {
                t.external_temperature = Some(v.temperature);
                t.ext_temp = Resource::Success(v);
            });
        }
        Err(e) => {
            warn!(facet = "ext_temp", error = %e, "fetch failed");
            shared.publish(generation, |t| t.ext_temp = Resource::Error(error_message(&e)));
        }
    }
}
