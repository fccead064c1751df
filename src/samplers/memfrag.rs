use std::fs;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::datapoint::Datapoint;

use super::{page_size, Sampler};

const BUDDYINFO_PATH: &str = "/proc/buddyinfo";
const PAGETYPEINFO_PATH: &str = "/proc/pagetypeinfo";

static BUDDYINFO_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*Node\s+(?P<node>\d+),\s+zone\s+(?P<zone>\S+)\s+(?P<counts>.*)$").unwrap());
static PAGETYPEINFO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*Node\s+(?P<node>\d+),\s+zone\s+(?P<zone>\S+),\s+type\s+(?P<mtype>\S+)\s+(?P<counts>.*)$").unwrap()
});

struct FragEntry {
    node: u32,
    zone: String,
    mtype: String,
    counts: Vec<(String, u64)>,
}

/// Parses `/proc/buddyinfo` and the `Free pages count` block of
/// `/proc/pagetypeinfo`. See spec §4.5.
#[derive(Default)]
pub struct MemfragSampler;

impl Sampler for MemfragSampler {
    fn read(&mut self) -> Vec<Datapoint> {
        let page_size_kb = page_size() / 1024;

        let mut entries = Vec::new();
        match fs::read_to_string(BUDDYINFO_PATH) {
            Ok(content) => entries.extend(parse_buddyinfo(&content, page_size_kb)),
            Err(err) => log::debug!("failed to read {BUDDYINFO_PATH}: {err}"),
        }
        match fs::read_to_string(PAGETYPEINFO_PATH) {
            Ok(content) => entries.extend(parse_pagetypeinfo(&content, page_size_kb)),
            Err(err) => log::debug!("failed to read {PAGETYPEINFO_PATH}: {err}"),
        }

        let mut out = Vec::new();
        for entry in entries {
            let total: u64 = entry.counts.iter().map(|(_, c)| *c).sum();
            if total == 0 {
                continue;
            }
            for (size, count) in entry.counts {
                out.push(Datapoint::gauge(
                    format!(
                        "memory.fragmentation.node_{}.{}.{}.{}",
                        entry.node, entry.zone, entry.mtype, size
                    ),
                    count as f64,
                ));
            }
        }
        out
    }
}

fn parse_counts(counts_str: &str, page_size_kb: u64) -> Vec<(String, u64)> {
    counts_str
        .split_whitespace()
        .enumerate()
        .filter_map(|(order, c)| {
            let count: u64 = c.parse().ok()?;
            let size = page_size_kb * (1u64 << order);
            Some((format!("{size}k"), count))
        })
        .collect()
}

fn parse_buddyinfo(content: &str, page_size_kb: u64) -> Vec<FragEntry> {
    let mut out = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some(caps) = BUDDYINFO_RE.captures(line) else {
            log::warn!("unrecognized line in /proc/buddyinfo, skipping: {line:?}");
            continue;
        };
        out.push(FragEntry {
            node: caps["node"].parse().unwrap_or(0),
            zone: caps["zone"].to_lowercase(),
            mtype: "available".to_string(),
            counts: parse_counts(&caps["counts"], page_size_kb),
        });
    }
    out
}

fn parse_pagetypeinfo(content: &str, page_size_kb: u64) -> Vec<FragEntry> {
    let lines: Vec<&str> = content.lines().collect();
    let mut out = Vec::new();
    let mut i = 0;
    let mut found = false;

    while i < lines.len() {
        if !lines[i].contains("Free pages count") {
            i += 1;
            while i < lines.len() && !lines[i].trim().is_empty() {
                i += 1;
            }
            i += 1;
            continue;
        }
        if found {
            log::warn!("more than one free pages counters section found in /proc/pagetypeinfo");
            i += 1;
            continue;
        }
        found = true;
        i += 1;
        while i < lines.len() {
            let l = lines[i].trim();
            if l.is_empty() {
                break;
            }
            match PAGETYPEINFO_RE.captures(l) {
                Some(caps) => out.push(FragEntry {
                    node: caps["node"].parse().unwrap_or(0),
                    zone: caps["zone"].to_lowercase(),
                    mtype: caps["mtype"].to_lowercase(),
                    counts: parse_counts(&caps["counts"], page_size_kb),
                }),
                None => log::warn!("unrecognized line in /proc/pagetypeinfo, skipping: {l:?}"),
            }
            i += 1;
        }
    }
    if !found {
        log::warn!("failed to find free pages counters in /proc/pagetypeinfo");
    }
    out
}
