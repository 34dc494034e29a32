//! Derived metrics: CPU load from counter snapshots, memory usage, human-readable sizes.
//!
//! CPU load is delta-based: the active share of ticks elapsed between two
//! consecutive snapshots. Without a previous snapshot (first poll after a
//! start) the since-boot ratio of the current snapshot is used instead, so the
//! first round still produces a number.

use crate::types::{CpuStats, MemoryResponse};

/// Active CPU share in percent, 0..=100. Never NaN.
pub fn cpu_percent(prev: Option<&CpuStats>, curr: &CpuStats) -> f32 {
    match prev {
        Some(prev) => cpu_percent_delta(prev, curr),
        None => cpu_percent_cumulative(curr),
    }
}

/// Since-boot active ratio of a single snapshot.
pub fn cpu_percent_cumulative(stats: &CpuStats) -> f32 {
    let total = stats.total();
    if total == 0 {
        return 0.0;
    }
    let active = total.saturating_sub(stats.idle);
    (active as f64 / total as f64 * 100.0).clamp(0.0, 100.0) as f32
}

/// Active ratio of the ticks elapsed between `prev` and `curr`.
/// A counter reset (host reboot) or a stalled clock yields 0.
pub fn cpu_percent_delta(prev: &CpuStats, curr: &CpuStats) -> f32 {
    let d_total = curr.total() as i128 - prev.total() as i128;
    if d_total <= 0 {
        return 0.0;
    }
    let d_idle = (curr.idle as i128 - prev.idle as i128).clamp(0, d_total);
    let d_active = d_total - d_idle;
    (d_active as f64 / d_total as f64 * 100.0).clamp(0.0, 100.0) as f32
}

pub fn memory_percent(m: &MemoryResponse) -> f32 {
    if m.total == 0 {
        return 0.0;
    }
    let used = m.total.saturating_sub(m.available);
    (used as f64 / m.total as f64 * 100.0) as f32
}

/// (used, total) scaled down twice by 1024 for display.
pub fn memory_gb_pair(m: &MemoryResponse) -> (f32, f32) {
    const MB: f64 = 1024.0 * 1024.0;
    let used = m.total.saturating_sub(m.available);
    ((used as f64 / MB) as f32, (m.total as f64 / MB) as f32)
}

pub fn human(b: u64) -> String {
    const K: f64 = 1024.0;
    let b = b as f64;
    if b < K {
        return format!("{b:.0}B");
    }
    let kb = b / K;
    if kb < K {
        return format!("{kb:.1}KB");
    }
    let mb = kb / K;
    if mb < K {
        return format!("{mb:.1}MB");
    }
    let gb = mb / K;
    if gb < K {
        return format!("{gb:.1}GB");
    }
    let tb = gb / K;
    format!("{tb:.2}TB")
}

pub fn truncate_middle(s: &str, max: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max {
        return s.to_string();
    }
    if max <= 3 {
        return "...".into();
    }
    let keep = max - 3;
    let left = keep / 2;
    let right = keep - left;
    let head: String = chars[..left].iter().collect();
    let tail: String = chars[chars.len() - right..].iter().collect();
    format!("{head}...{tail}")
}
