//! RTT measurement over the system `ping` binary.
//!
//! One concurrent probe task per configured host; each host's mean
//! RTT is parsed from the textual summary with a tolerant regex.
//! With three or more hosts the cross-host aggregate is the median of
//! the successes (even count: mean of the middle two); with fewer it
//! is the first success. All hosts failing yields `None` and the
//! caller's fallback policy takes over.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;

use crate::config::PingConfig;

/// Measure the aggregate RTT across all configured hosts, in ms.
pub async fn measure(cfg: &PingConfig) -> Option<f64> {
    let mut tasks = Vec::with_capacity(cfg.hosts.len());
    for host in &cfg.hosts {
        let host = host.clone();
        let count = cfg.count;
        let timeout = cfg.timeout;
        tasks.push(tokio::spawn(async move {
            ping_host(&host, count, timeout).await
        }));
    }

    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        results.push(task.await.ok().flatten());
    }

    aggregate(&results, cfg.hosts.len())
}

/// Probe one host: `count` ICMP echoes, mean RTT from the summary line.
async fn ping_host(host: &str, count: u32, timeout: Duration) -> Option<f64> {
    let deadline_s = timeout.as_secs().max(1);
    let mut cmd = Command::new("ping");
    cmd.arg("-n")
        .arg("-q")
        .arg("-c")
        .arg(count.to_string())
        .arg("-W")
        .arg(deadline_s.to_string())
        .arg(host)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    // Grace on top of the per-reply deadline: count echoes at 1 s pacing.
    let budget = timeout + Duration::from_secs(count as u64);
    let output = match tokio::time::timeout(budget, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            tracing::debug!(host, error = %e, "ping spawn failed");
            return None;
        }
        Err(_) => {
            tracing::debug!(host, "ping timed out");
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }
    parse_ping_output(&String::from_utf8_lossy(&output.stdout))
}

/// Extract the mean RTT in ms from ping's textual output.
///
/// Prefers the `rtt min/avg/max` (or BSD `round-trip`) summary; falls
/// back to averaging individual `time=... ms` reply lines.
pub fn parse_ping_output(text: &str) -> Option<f64> {
    static SUMMARY: OnceLock<Regex> = OnceLock::new();
    static REPLY: OnceLock<Regex> = OnceLock::new();

    let summary = SUMMARY
        .get_or_init(|| Regex::new(r"(?m)=\s*[0-9.]+/([0-9.]+)/[0-9.]+").expect("static regex"));
    if let Some(caps) = summary.captures(text) {
        if let Ok(avg) = caps[1].parse::<f64>() {
            if avg.is_finite() && avg > 0.0 {
                return Some(avg);
            }
        }
    }

    let reply =
        REPLY.get_or_init(|| Regex::new(r"time[=<]\s*([0-9.]+)\s*ms").expect("static regex"));
    let times: Vec<f64> = reply
        .captures_iter(text)
        .filter_map(|c| c[1].parse::<f64>().ok())
        .filter(|t| t.is_finite() && *t > 0.0)
        .collect();
    if times.is_empty() {
        None
    } else {
        Some(times.iter().sum::<f64>() / times.len() as f64)
    }
}

/// Cross-host aggregation: median when >= 3 hosts were configured,
/// first success otherwise.
fn aggregate(results: &[Option<f64>], hosts_configured: usize) -> Option<f64> {
    let mut successes: Vec<f64> = results.iter().filter_map(|r| *r).collect();
    if successes.is_empty() {
        return None;
    }
    if hosts_configured >= 3 {
        median(&mut successes)
    } else {
        successes.first().copied()
    }
}

/// Median; even counts take the mean of the middle two.
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).expect("finite RTTs"));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINUX_OUTPUT: &str = "\
PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.

--- 1.1.1.1 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 2003ms
rtt min/avg/max/mdev = 11.123/12.456/14.789/1.234 ms
";

    const BSD_OUTPUT: &str = "\
PING 1.1.1.1 (1.1.1.1): 56 data bytes

--- 1.1.1.1 ping statistics ---
3 packets transmitted, 3 packets received, 0.0% packet loss
round-trip min/avg/max/stddev = 20.1/22.5/25.0/2.0 ms
";

    const REPLY_ONLY: &str = "\
64 bytes from 1.1.1.1: icmp_seq=1 ttl=57 time=10.0 ms
64 bytes from 1.1.1.1: icmp_seq=2 ttl=57 time=14.0 ms
";

    #[test]
    fn parses_linux_summary() {
        assert_eq!(parse_ping_output(LINUX_OUTPUT), Some(12.456));
    }

    #[test]
    fn parses_bsd_summary() {
        assert_eq!(parse_ping_output(BSD_OUTPUT), Some(22.5));
    }

    #[test]
    fn falls_back_to_reply_lines() {
        assert_eq!(parse_ping_output(REPLY_ONLY), Some(12.0));
    }

    #[test]
    fn garbage_yields_none() {
        assert_eq!(parse_ping_output("destination host unreachable"), None);
        assert_eq!(parse_ping_output(""), None);
    }

    #[test]
    fn median_odd_count_picks_middle() {
        let mut v = vec![30.0, 10.0, 20.0];
        assert_eq!(median(&mut v), Some(20.0));
    }

    #[test]
    fn median_even_count_means_middle_two() {
        // Pinned convention: mean of the middle pair.
        let mut v = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(median(&mut v), Some(25.0));
    }

    #[test]
    fn median_two_values_is_their_mean() {
        let mut v = vec![10.0, 20.0];
        assert_eq!(median(&mut v), Some(15.0));
    }

    #[test]
    fn aggregate_single_host_uses_value_directly() {
        assert_eq!(aggregate(&[Some(18.0)], 1), Some(18.0));
    }

    #[test]
    fn aggregate_three_hosts_takes_median() {
        assert_eq!(aggregate(&[Some(30.0), Some(10.0), Some(20.0)], 3), Some(20.0));
    }

    #[test]
    fn aggregate_three_hosts_two_successes_means_them() {
        assert_eq!(aggregate(&[Some(10.0), None, Some(20.0)], 3), Some(15.0));
    }

    #[test]
    fn aggregate_all_failed_is_none() {
        assert_eq!(aggregate(&[None, None, None], 3), None);
    }
}
