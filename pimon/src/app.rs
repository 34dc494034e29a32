//! App loops: line-oriented monitor and terminal front ends over the engine and session.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use pimon::config::Settings;
use pimon::engine::{EngineEffect, RefreshEngine, Telemetry};
use pimon::metrics::{human, truncate_middle};
use pimon::session::{Connection, Submit, TerminalSession};
use pimon::source::{DemoSource, HttpSource, TelemetrySource};
use pimon::targets::{save_targets, Target, TargetsFile};
use pimon::transport::WsTransport;
use pimon::types::Resource;

#[derive(Debug, PartialEq, Eq)]
pub enum MonitorCommand {
    Kill(u32),
    Target(usize),
    Procs,
    Quit,
    Unknown(String),
}

pub fn parse_monitor_command(line: &str) -> Option<MonitorCommand> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?;
    let arg = parts.next();
    Some(match (cmd, arg) {
        ("kill" | "k", Some(pid)) => match pid.parse() {
            Ok(pid) => MonitorCommand::Kill(pid),
            Err(_) => MonitorCommand::Unknown(line.trim().to_string()),
        },
        ("target" | "t", Some(i)) => match i.parse() {
            Ok(i) => MonitorCommand::Target(i),
            Err(_) => MonitorCommand::Unknown(line.trim().to_string()),
        },
        ("procs" | "p", None) => MonitorCommand::Procs,
        ("quit" | "q" | "exit", None) => MonitorCommand::Quit,
        _ => MonitorCommand::Unknown(line.trim().to_string()),
    })
}

pub struct App {
    settings: Settings,
    store: TargetsFile,
}

impl App {
    pub fn new(settings: Settings, store: TargetsFile) -> Self {
        Self { settings, store }
    }

    pub async fn run_monitor(mut self, target: Target) -> anyhow::Result<()> {
        let source = Arc::new(HttpSource::new(self.settings.http_timeout));
        self.monitor(source, target, true).await
    }

    pub async fn run_demo(mut self) -> anyhow::Result<()> {
        let source = Arc::new(DemoSource::new());
        self.monitor(source, Target::new("demo.local", 0), false).await
    }

    async fn monitor(
        &mut self,
        source: Arc<dyn TelemetrySource>,
        target: Target,
        switchable: bool,
    ) -> anyhow::Result<()> {
        let (engine, mut effects) = RefreshEngine::new(source, self.settings.refresh_interval);
        engine.start(target).context("start refresh loop")?;
        eprintln!("commands: kill <pid> | target <n> | procs | quit");

        let mut state_rx = engine.subscribe();
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let mut last_line = String::new();

        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let t = state_rx.borrow_and_update().clone();
                    let line = summary_line(&t);
                    if line != last_line {
                        println!("[{}] {line}", chrono::Local::now().format("%H:%M:%S"));
                        last_line = line;
                    }
                }
                effect = effects.recv() => match effect {
                    Some(EngineEffect::KillSucceeded { pid }) => println!("kill {pid}: accepted"),
                    Some(EngineEffect::KillFailed { pid, message }) => {
                        println!("kill {pid}: failed ({message})")
                    }
                    None => break,
                },
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(l)) => match parse_monitor_command(&l) {
                        Some(MonitorCommand::Quit) => break,
                        Some(MonitorCommand::Kill(pid)) => {
                            engine.kill_process(pid);
                        }
                        Some(MonitorCommand::Procs) => print_processes(&engine.snapshot()),
                        Some(MonitorCommand::Target(i)) if switchable => {
                            match self.switch_target(i) {
                                Ok(next) => {
                                    engine.stop();
                                    engine.start(next).context("restart refresh loop")?;
                                    last_line.clear();
                                }
                                Err(msg) => eprintln!("{msg}"),
                            }
                        }
                        Some(MonitorCommand::Target(_)) => eprintln!("demo mode has a single target"),
                        Some(MonitorCommand::Unknown(s)) => eprintln!("unknown command: {s}"),
                        None => {}
                    },
                    Ok(None) | Err(_) => stdin_open = false,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        engine.stop();
        Ok(())
    }

    /// Persist the new selection and resolve it.
    fn switch_target(&mut self, index: usize) -> Result<Target, String> {
        if !self.store.select(index) {
            return Err(format!(
                "no target {index}; {} known",
                self.store.targets.len()
            ));
        }
        if let Err(e) = save_targets(&self.store) {
            tracing::warn!(error = %e, "could not persist selected target");
        }
        let address = self.store.targets[index].clone();
        Target::parse(&address, self.settings.default_port).map_err(|e| e.to_string())
    }

    pub async fn run_terminal(self, target: Target) -> anyhow::Result<()> {
        let url = target.terminal_url()?;
        let session = TerminalSession::new(Arc::new(WsTransport::new(self.settings.keepalive)));
        let mut state_rx = session.subscribe();
        let mut status_rx = session.subscribe_status();
        session.connect(url.clone());
        eprintln!("commands: /reconnect | /ctrl-c | /bs | /quit");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        let mut epoch = session.epoch();
        let mut printed = 0usize;

        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let s = state_rx.borrow_and_update().clone();
                    if s.epoch != epoch {
                        epoch = s.epoch;
                        printed = 0;
                    }
                    if s.transcript.len() > printed {
                        let mut out = io::stdout().lock();
                        let _ = out.write_all(s.transcript[printed..].as_bytes());
                        let _ = out.flush();
                        printed = s.transcript.len();
                    }
                }
                status = status_rx.recv() => match status {
                    Ok(Connection::Connecting) => eprintln!("-- connecting to {url}"),
                    Ok(Connection::Open) => eprintln!("-- connected to {target}"),
                    Ok(Connection::Closed { code, reason }) if reason.is_empty() => {
                        eprintln!("-- disconnected ({code})")
                    }
                    Ok(Connection::Closed { code, reason }) => {
                        eprintln!("-- disconnected ({code}: {reason})")
                    }
                    Ok(Connection::Failed(m)) => eprintln!("-- connection failed: {m}"),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
                line = lines.next_line(), if stdin_open => match line {
                    Ok(Some(l)) => match l.trim() {
                        "/quit" => break,
                        "/reconnect" => session.reconnect(url.clone()),
                        "/ctrl-c" => {
                            if !session.send_interrupt() {
                                eprintln!("-- not connected");
                            }
                        }
                        "/bs" => {
                            if !session.send_backspace() {
                                eprintln!("-- not connected");
                            }
                        }
                        _ => {
                            if session.submit(&l) == Submit::NotConnected {
                                eprintln!("-- not connected");
                            }
                        }
                    },
                    Ok(None) | Err(_) => stdin_open = false,
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        session.close();
        Ok(())
    }
}

fn resource_tag<T>(name: &str, r: &Resource<T>) -> Option<String> {
    match r {
        Resource::Loading => Some(format!("{name}: loading")),
        Resource::Error(e) => Some(format!("{name}: {e}")),
        Resource::Success(_) => None,
    }
}

pub fn summary_line(t: &Telemetry) -> String {
    let target = t
        .target
        .as_ref()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".into());
    let cpu = match (t.cpu_percent_used, t.cpu_temperature) {
        (Some(p), Some(c)) => format!("cpu {p:.1}% {c:.1}°C"),
        (Some(p), None) => format!("cpu {p:.1}%"),
        _ => "cpu --".into(),
    };
    let ram = match (t.used_ram_percent, t.used_ram_gb) {
        (Some(p), Some((used, total))) => format!("ram {p:.1}% ({used:.2}/{total:.2} GB)"),
        _ => "ram --".into(),
    };
    let ext = t
        .external_temperature
        .map(|c| format!("ext {c:.1}°C"))
        .unwrap_or_else(|| "ext --".into());
    let procs = t
        .processes
        .success()
        .map(|p| format!("procs {}", p.processes.len()))
        .unwrap_or_else(|| "procs --".into());

    let mut line = format!("{target}  {cpu} | {ram} | {ext} | {procs}");
    let notes: Vec<String> = [
        resource_tag("cpu", &t.cpu),
        resource_tag("memory", &t.memory),
        resource_tag("processes", &t.processes),
        resource_tag("ext_temp", &t.ext_temp),
    ]
    .into_iter()
    .flatten()
    .collect();
    if !notes.is_empty() {
        line.push_str("  [");
        line.push_str(&notes.join("; "));
        line.push(']');
    }
    line
}

fn print_processes(t: &Telemetry) {
    let Some(list) = t.processes.success() else {
        println!("processes unavailable");
        return;
    };
    println!(
        "{:>7} {:<20} {:<12} {:<8} {:>9} {:>9} {:>4}",
        "PID", "NAME", "STATE", "USER", "RSS", "VIRT", "THR"
    );
    for p in &list.processes {
        let mark = if t.killing.contains(&p.pid) { "*" } else { " " };
        println!(
            "{:>6}{mark} {:<20} {:<12} {:<8} {:>9} {:>9} {:>4}",
            p.pid,
            truncate_middle(&p.name, 20),
            truncate_middle(&p.state_description, 12),
            truncate_middle(&p.user, 8),
            human(p.memory_rss.saturating_mul(1024)),
            human(p.memory_virt.saturating_mul(1024)),
            p.threads
        );
    }
}
