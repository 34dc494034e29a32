//! Entry point for the pimon CLI. Parses args, resolves the target and runs the App.

mod app;

use std::env;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use app::App;
use pimon::config::Settings;
use pimon::targets::{
    load_targets, save_targets, ResolveTarget, Target, TargetRequest, TargetsFile,
};

const USAGE_TAIL: &str = "[--target N|-T N] [--add HOST] [--interval SECS|-i SECS] [--terminal] [--demo] [--dry-run] [HOST[:PORT]]";

#[derive(Debug, Default)]
struct ParsedArgs {
    address: Option<String>,
    target: Option<usize>,
    add: Option<String>,
    interval: Option<u64>,
    terminal: bool,
    demo: bool,
    dry_run: bool,
}

fn parse_number<T: std::str::FromStr>(flag: &str, v: Option<String>) -> Result<T, String> {
    let v = v.ok_or_else(|| format!("{flag} needs a value"))?;
    v.parse()
        .map_err(|_| format!("{flag}: '{v}' is not a valid number"))
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<ParsedArgs, String> {
    let mut it = args.into_iter();
    let prog = it.next().unwrap_or_else(|| "pimon".into());
    let mut out = ParsedArgs::default();

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                return Err(format!("Usage: {prog} {USAGE_TAIL}"));
            }
            "--target" | "-T" => {
                out.target = Some(parse_number(&arg, it.next())?);
            }
            "--interval" | "-i" => {
                out.interval = Some(parse_number(&arg, it.next())?);
            }
            "--add" => {
                out.add = it.next();
            }
            "--terminal" => out.terminal = true,
            "--demo" => out.demo = true,
            "--dry-run" => out.dry_run = true,
            _ if arg.starts_with("--target=") => {
                if let Some((flag, v)) = arg.split_once('=') {
                    out.target = Some(parse_number(flag, Some(v.to_string()))?);
                }
            }
            _ if arg.starts_with("--interval=") => {
                if let Some((flag, v)) = arg.split_once('=') {
                    out.interval = Some(parse_number(flag, Some(v.to_string()))?);
                }
            }
            _ if arg.starts_with("--add=") => {
                if let Some((_, v)) = arg.split_once('=') {
                    if !v.is_empty() {
                        out.add = Some(v.to_string());
                    }
                }
            }
            _ if arg.starts_with('-') => {
                return Err(format!("Unknown option '{arg}'. Usage: {prog} {USAGE_TAIL}"));
            }
            _ => {
                if out.address.is_none() {
                    out.address = Some(arg);
                } else {
                    return Err(format!("Unexpected argument. Usage: {prog} {USAGE_TAIL}"));
                }
            }
        }
    }
    Ok(out)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn persist(store: &TargetsFile) {
    if let Err(e) = save_targets(store) {
        tracing::warn!(error = %e, "could not save targets");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let parsed = match parse_args(env::args()) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            return Ok(());
        }
    };
    init_tracing();

    let mut settings = Settings::from_env();
    if let Some(secs) = parsed.interval {
        settings.refresh_interval = Duration::from_secs(secs.max(1));
    }

    if parsed.demo {
        return App::new(settings, TargetsFile::default()).run_demo().await;
    }

    let mut store = load_targets();
    if let Some(address) = parsed.add.as_deref() {
        Target::parse(address, settings.default_port)
            .with_context(|| format!("invalid host '{address}'"))?;
        let i = store.add(address);
        persist(&store);
        eprintln!("target {i}: {}", address.trim());
    }

    let req = TargetRequest {
        address: parsed.address.clone(),
        index: parsed.target,
    };
    let (index, address) = match req.resolve(&store) {
        ResolveTarget::Direct(address) => {
            Target::parse(&address, settings.default_port)
                .with_context(|| format!("invalid host '{address}'"))?;
            let i = store.add(&address);
            store.select(i);
            persist(&store);
            (i, address)
        }
        ResolveTarget::Selected(i, address) => {
            if store.selected != i {
                store.select(i);
                persist(&store);
            }
            (i, address)
        }
        ResolveTarget::OutOfRange(i) => {
            eprintln!("No target {i}; {} known.", store.targets.len());
            return Ok(());
        }
        ResolveTarget::None => {
            eprintln!("No host given and no saved targets. Usage: pimon {USAGE_TAIL}");
            return Ok(());
        }
    };

    let target = Target::parse(&address, settings.default_port)
        .with_context(|| format!("invalid host '{address}'"))?;

    if parsed.dry_run {
        println!("target {index}: {target}");
        println!("http: {}", target.http_base()?);
        println!("terminal: {}", target.terminal_url()?);
        return Ok(());
    }

    let app = App::new(settings, store);
    if parsed.terminal {
        app.run_terminal(target).await
    } else {
        app.run_monitor(target).await
    }
}
