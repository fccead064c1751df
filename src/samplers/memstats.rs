use std::fs;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::datapoint::Datapoint;

use super::Sampler;

const VMSTAT_PATH: &str = "/proc/vmstat";
const MEMINFO_PATH: &str = "/proc/meminfo";

static CAMEL_RE1: Lazy<Regex> = Lazy::new(|| Regex::new(r"(.)([A-Z][a-z]+)").unwrap());
static CAMEL_RE2: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());
static CAMEL_RE3: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").unwrap());

/// Reads `/proc/vmstat` and `/proc/meminfo`. See spec §4.5.
#[derive(Default)]
pub struct MemStatsSampler;

impl Sampler for MemStatsSampler {
    fn read(&mut self) -> Vec<Datapoint> {
        let mut out = Vec::new();
        out.extend(read_vmstat());
        out.extend(read_meminfo());
        out
    }
}

fn read_vmstat() -> Vec<Datapoint> {
    let content = match fs::read_to_string(VMSTAT_PATH) {
        Ok(c) => c,
        Err(err) => {
            log::debug!("failed to read {VMSTAT_PATH}: {err}");
            return Vec::new();
        }
    };
    let mut out = Vec::new();
    for line in content.lines() {
        let Some((metric, val)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let val = val.trim();
        let Ok(val) = val.parse::<f64>() else {
            log::warn!("non-numeric value in {VMSTAT_PATH}: {line}");
            continue;
        };
        if let Some(suffix) = metric.strip_prefix("nr_") {
            out.push(Datapoint::gauge(format!("memory.pages.allocation.{suffix}"), val));
        } else {
            out.push(Datapoint::gauge(format!("memory.pages.activity.{metric}"), val));
        }
    }
    out
}

fn read_meminfo() -> Vec<Datapoint> {
    let content = match fs::read_to_string(MEMINFO_PATH) {
        Ok(c) => c,
        Err(err) => {
            log::debug!("failed to read {MEMINFO_PATH}: {err}");
            return Vec::new();
        }
    };
    let mut fields = Vec::new();
    for line in content.lines() {
        if let Some((key, val)) = line.split_once(char::is_whitespace) {
            fields.push((key.to_string(), val.trim().to_string()));
        }
    }
    let hugepage_size_kb = fields
        .iter()
        .find(|(k, _)| k == "Hugepagesize:")
        .and_then(|(_, v)| v.strip_suffix(" kB"))
        .and_then(|v| v.parse::<f64>().ok());
    if hugepage_size_kb.is_none() {
        log::warn!("unable to get hugepage size from {MEMINFO_PATH}");
    }

    let mut out = Vec::new();
    for (raw_key, raw_val) in &fields {
        if raw_key.starts_with("DirectMap") || raw_key == "Hugepagesize:" {
            continue; // static info / consumed above as unit context
        }
        let metric = rename_metric(&mangle(raw_key.trim_end_matches(':').replace(['(', ')'], "")));

        let value = match raw_val.split_once(char::is_whitespace) {
            Some((num, unit)) => {
                let unit = unit.trim();
                if unit != "kB" {
                    log::warn!("unhandled unit type in {MEMINFO_PATH}: {unit}");
                    continue;
                }
                match num.parse::<f64>() {
                    Ok(n) => n * 1024.0,
                    Err(_) => continue,
                }
            }
            None => {
                if !metric.starts_with("huge_pages_") {
                    log::warn!("unhandled page-measured metric in {MEMINFO_PATH}: {metric}");
                    continue;
                }
                let Some(hp) = hugepage_size_kb else { continue };
                match raw_val.parse::<f64>() {
                    Ok(n) => n * hp * 1024.0,
                    Err(_) => continue,
                }
            }
        };
        out.push(Datapoint::gauge(format!("memory.allocation.{metric}"), value));
    }
    out
}

fn rename_metric(mangled: &str) -> String {
    if let Some(rest) = mangled.strip_prefix("s_") {
        format!("slab_{rest}")
    } else if let Some(rest) = mangled.strip_prefix("mem_") {
        rest.to_string()
    } else if mangled == "slab" {
        "slab_total".to_string()
    } else {
        mangled.to_string()
    }
}

fn mangle(name: impl AsRef<str>) -> String {
    let name = name.as_ref();
    let step1 = CAMEL_RE1.replace_all(name, "$1_$2");
    let step2 = CAMEL_RE2.replace_all(&step1, "$1_$2");
    CAMEL_RE3.replace_all(&step2, "_").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangle_is_idempotent() {
        for input in ["MemAvailable", "SUnreclaim", "DirectMap4k", "slab"] {
            let once = mangle(input);
            let twice = mangle(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn meminfo_scenario() {
        // spec.md §8 scenario 3: "MemAvailable:    2048 kB" -> memory.allocation.available, 2097152
        let metric = rename_metric(&mangle("MemAvailable"));
        assert_eq!(metric, "available");
        assert_eq!(2048.0_f64 * 1024.0, 2_097_152.0);
    }

    #[test]
    fn mangle_handles_all_caps_runs() {
        assert_eq!(mangle("SUnreclaim"), "s_unreclaim");
    }
}
