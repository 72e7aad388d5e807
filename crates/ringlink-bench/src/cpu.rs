//! Process CPU usage from `/proc`, sampled around a measurement.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

/// Jiffy counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSample {
    /// user + nice + system + idle over all CPUs.
    pub global: f64,
    /// User time of this process.
    pub user: f64,
    /// System time of this process.
    pub system: f64,
}

/// Share of the machine's CPU time spent by this process, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CpuUsage {
    pub user_pct: f64,
    pub system_pct: f64,
    pub total_pct: f64,
}

/// Reads `/proc/stat` and `/proc/self/stat`.
pub fn sample() -> Result<CpuSample> {
    let global = std::fs::read_to_string("/proc/stat").context("reading /proc/stat")?;
    let own = std::fs::read_to_string("/proc/self/stat").context("reading /proc/self/stat")?;
    let (user, system) = parse_own_stat(&own)?;
    Ok(CpuSample {
        global: parse_global_stat(&global)?,
        user,
        system,
    })
}

/// Sum of the user, nice, system and idle columns of the aggregate `cpu` line.
pub fn parse_global_stat(contents: &str) -> Result<f64> {
    let line = contents
        .lines()
        .find(|l| l.starts_with("cpu "))
        .ok_or_else(|| anyhow!("no aggregate cpu line in /proc/stat"))?;
    let fields = line
        .split_whitespace()
        .skip(1)
        .take(4)
        .map(|f| f.parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .context("malformed cpu line in /proc/stat")?;
    if fields.len() < 4 {
        return Err(anyhow!("short cpu line in /proc/stat"));
    }
    Ok(fields.iter().sum())
}

/// `utime` and `stime` of a `/proc/<pid>/stat` line.
pub fn parse_own_stat(contents: &str) -> Result<(f64, f64)> {
    // The command name may contain spaces; fields are counted after its closing ')'.
    let rest = contents
        .rsplit_once(')')
        .map(|(_, rest)| rest)
        .ok_or_else(|| anyhow!("malformed /proc/self/stat"))?;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let field = |i: usize| -> Result<f64> {
        fields
            .get(i)
            .ok_or_else(|| anyhow!("short /proc/self/stat"))?
            .parse::<f64>()
            .context("malformed /proc/self/stat")
    };
    // utime and stime are fields 14 and 15; the first field after ')' is field 3.
    Ok((field(11)?, field(12)?))
}

impl CpuUsage {
    pub fn between(before: &CpuSample, after: &CpuSample) -> Self {
        let elapsed = after.global - before.global;
        if elapsed <= 0.0 {
            return Self::default();
        }
        let user_pct = (after.user - before.user) / elapsed * 100.0;
        let system_pct = (after.system - before.system) / elapsed * 100.0;
        Self {
            user_pct,
            system_pct,
            total_pct: user_pct + system_pct,
        }
    }
}
