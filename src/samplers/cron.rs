use std::time::Duration;

use regex::Regex;

use crate::config::{CronConfig, TimingConfig};
use crate::datapoint::Datapoint;
use crate::durable_tail::DurableTailer;
use crate::tail::{TailEvent, TailerOptions};

use super::Sampler;

/// Wraps a durable tailer over the cron event log. See spec §4.5; the
/// `duration` event's value extraction reproduces a quirk of the original
/// implementation rather than "fixing" it (see the module-level note in
/// `process_line`).
pub struct CronJobsSampler {
    tailer: Option<DurableTailer>,
    events: Vec<(String, Regex)>,
    aliases: Vec<(String, Regex)>,
    sanitize_re: Regex,
}

impl CronJobsSampler {
    pub fn new(cfg: &CronConfig, timing: &TimingConfig) -> Self {
        let events = cfg
            .events
            .iter()
            .filter_map(|(name, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((name.clone(), re)),
                Err(err) => {
                    log::warn!("invalid cron event regex {name:?}: {err}");
                    None
                }
            })
            .collect();

        let aliases = cfg
            .aliases
            .iter()
            .filter_map(|(alias, pattern)| match Regex::new(pattern) {
                Ok(re) => Some((alias.clone(), re)),
                Err(err) => {
                    log::warn!("invalid cron alias regex {pattern:?}: {err}");
                    None
                }
            })
            .collect();

        let tail_opts = TailerOptions {
            open_tail: true,
            read_interval_min: None,
            read_interval_max: Duration::from_millis(timing.read_interval_max_ms),
            read_interval_mul: timing.read_interval_mul,
            rotation_check_interval: Duration::from_secs(timing.rotation_check_interval_secs),
        };
        let tailer = match DurableTailer::open(
            &cfg.log_path,
            &cfg.xattr_name,
            tail_opts,
            Duration::from_secs(timing.min_dump_interval_secs),
        ) {
            Ok(t) => Some(t),
            Err(err) => {
                log::warn!("cron log {} unavailable: {err}", cfg.log_path);
                None
            }
        };

        Self {
            tailer,
            events,
            aliases,
            sanitize_re: Regex::new(r"\s+|-").unwrap(),
        }
    }
}

impl Sampler for CronJobsSampler {
    fn read(&mut self) -> Vec<Datapoint> {
        let Some(tailer) = &mut self.tailer else {
            return Vec::new();
        };
        let mut out = Vec::new();
        loop {
            match tailer.poll() {
                Ok(TailEvent::Line(line)) => {
                    out.extend(process_line(&line, &self.events, &self.aliases, &self.sanitize_re));
                }
                Ok(TailEvent::NoData | TailEvent::Stopped) => break,
                Err(err) => {
                    log::warn!("cron tailer error: {err}");
                    break;
                }
            }
        }
        out
    }

    fn stop(&mut self) {
        if let Some(tailer) = &mut self.tailer {
            tailer.stop();
        }
    }
}

fn process_line(line: &str, events: &[(String, Regex)], aliases: &[(String, Regex)], sanitize_re: &Regex) -> Vec<Datapoint> {
    let line = line.trim();
    let Some((ts_str, rest)) = line.split_once(char::is_whitespace) else {
        return Vec::new();
    };
    let Some(ts) = parse_ts(ts_str) else {
        log::warn!("unparseable cron log timestamp: {ts_str:?}");
        return Vec::new();
    };

    let mut out = Vec::new();
    for (ev, regex) in events {
        let Some(caps) = regex.captures(rest) else { continue };
        let Some(job_raw) = caps.name("job").map(|m| m.as_str()) else {
            continue;
        };

        let mut resolved = None;
        for (alias, alias_re) in aliases {
            let Some(alias_caps) = alias_re.captures(job_raw) else {
                continue;
            };
            let job_name = if let Some(group) = alias.strip_prefix('_') {
                match alias_caps.name(group) {
                    Some(m) => sanitize_re.replace_all(m.as_str(), "_").into_owned(),
                    None => continue,
                }
            } else {
                alias.clone()
            };
            // Historical quirk, preserved deliberately: the value is pulled
            // from the alias match, not the event-line match, so it is only
            // ever non-default if an alias regex itself defines `val`.
            let value = alias_caps
                .name("val")
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(1.0);
            resolved = Some((job_name, value));
            break;
        }

        let Some((job_name, value)) = resolved else {
            log::warn!("no alias for cron job: {line:?}, skipping");
            continue;
        };
        out.push(Datapoint::gauge(format!("cron.tasks.{job_name}.{ev}"), value).with_ts(ts));
    }
    out
}

fn parse_ts(s: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|ndt| ndt.and_utc().timestamp())
}
