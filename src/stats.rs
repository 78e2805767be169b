/*!
 # Battery and CPU statistics

 Background logging of battery readings to a CSV file, alongside a CPU
 load figure derived from `/proc/stat`.
*/

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::time;
use tracing::{info, warn};

use crate::device::PowerController;
use crate::{Error, Result};

const BATTERY_CSV_FILE: &str = "/var/log/battery.csv";
const BATTERY_READING_INTERVAL: Duration = Duration::from_secs(10 * 60);
const SYSTEM_STAT_FILE: &str = "/proc/stat";
const CPU_SAMPLE_GAP: Duration = Duration::from_secs(3);

/// Average busy fraction across all CPUs, from two `/proc/stat`
/// samples taken a few seconds apart.
pub async fn cpu_usage() -> Result<f64> {
    let first = read_cpu_ticks(SYSTEM_STAT_FILE).await?;
    time::sleep(CPU_SAMPLE_GAP).await;
    let second = read_cpu_ticks(SYSTEM_STAT_FILE).await?;

    if first.is_empty() || first.len() != second.len() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "bad stat file readings",
        )));
    }

    let mut busy_total = 0.0;
    for (a, b) in first.iter().zip(&second) {
        let total = b.total.saturating_sub(a.total) as f64;
        let idle = b.idle.saturating_sub(a.idle) as f64;
        if total > 0.0 {
            busy_total += (total - idle) / total;
        }
    }
    Ok(busy_total / first.len() as f64)
}

struct CpuTicks {
    total: u64,
    idle: u64,
}

async fn read_cpu_ticks(path: &str) -> Result<Vec<CpuTicks>> {
    let buf = tokio::fs::read_to_string(path).await?;
    Ok(parse_cpu_ticks(&buf))
}

/// Parses the per-CPU lines ("cpu0", "cpu1", ...) of /proc/stat; the
/// aggregate "cpu" line is skipped.
fn parse_cpu_ticks(stat: &str) -> Vec<CpuTicks> {
    let mut out = Vec::new();
    for line in stat.lines() {
        let mut fields = line.split_whitespace();
        let Some(name) = fields.next() else { continue };
        if !name.starts_with("cpu") || name == "cpu" {
            continue;
        }
        let ticks: Vec<u64> = fields.filter_map(|f| f.parse().ok()).collect();
        if ticks.len() < 8 {
            continue;
        }
        // user nice system idle iowait irq softirq steal
        let idle = ticks[3] + ticks[4];
        let total = idle + ticks[0] + ticks[1] + ticks[2] + ticks[5] + ticks[6] + ticks[7];
        out.push(CpuTicks { total, idle });
    }
    out
}

/// Appends a battery reading alongside the CPU load every few minutes.
/// A failed battery read skips the cycle; filesystem or stat errors
/// end the task (the rest of the daemon keeps running).
pub async fn battery_log_loop(controller: Arc<PowerController>) {
    loop {
        let cpu = match cpu_usage().await {
            Ok(v) => v,
            Err(err) => {
                warn!("error getting cpu usage: {err}");
                return;
            }
        };

        match controller.read_battery_level().await {
            Ok(battery) => {
                info!("battery reading: {battery}");
                let line = format!(
                    "{}, {cpu:.6}, {battery}\n",
                    Local::now().format("%Y-%m-%d %H:%M:%S")
                );
                if let Err(err) = append_to_file(BATTERY_CSV_FILE, &line).await {
                    warn!("error logging battery value: {err}");
                    return;
                }
            }
            Err(err) => warn!("error reading battery value: {err}"),
        }

        time::sleep(BATTERY_READING_INTERVAL).await;
    }
}

async fn append_to_file(path: &str, text: &str) -> Result<()> {
    let mut f = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .await?;
    f.write_all(text.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "\
cpu  100 0 100 800 0 0 0 0 0 0
cpu0 50 0 50 400 0 0 0 0 0 0
cpu1 50 0 50 400 0 0 0 0 0 0
intr 12345
ctxt 6789
";

    #[test]
    fn parses_per_cpu_lines_only() {
        let ticks = parse_cpu_ticks(STAT);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].total, 500);
        assert_eq!(ticks[0].idle, 400);
    }

    #[test]
    fn ignores_garbage() {
        assert!(parse_cpu_ticks("nonsense\n").is_empty());
        assert!(parse_cpu_ticks("cpu0 1 2\n").is_empty());
    }
}
