use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cgroup::{self, StickyCgroupSet};
use crate::config::CgroupConfig;
use crate::datapoint::Datapoint;
use crate::device::DeviceResolver;
use crate::systemd::UnitLister;

use super::Sampler;

const KNOWN_CONTROLLERS: &[&str] = &["cpuacct", "blkio", "memory"];
const BLKIO_FILES: &[(&str, &str)] = &[
    ("io_service_bytes", "bytes"),
    ("io_merged", "iops.merged"),
    ("io_serviced", "iops.total"),
];
const MEMORY_COUNTERS: &[&str] = &["pgpgin", "pgpgout", "pgfault", "pgmajfault"];

/// Per-controller cgroup sampler: discovers mounted controllers, runs the
/// sticky-bit lifecycle each tick, then emits per-service accounting data
/// for whatever remains in the working set. See spec §4.5 / §4.6.
pub struct CgAcctSampler {
    cgroup_root: PathBuf,
    sticky: StickyCgroupSet,
    unit_lister: Box<dyn UnitLister>,
    device_resolver: Arc<DeviceResolver>,
    controllers: Vec<String>,
}

impl CgAcctSampler {
    pub fn new(
        cfg: &CgroupConfig,
        unit_lister: Box<dyn UnitLister>,
        device_resolver: Arc<DeviceResolver>,
    ) -> std::io::Result<Self> {
        let cgroup_root = PathBuf::from(&cfg.root);
        let sticky = StickyCgroupSet::open(&cgroup_root, &cfg.sticky_file_name)?;
        let mut controllers = Vec::new();
        if let Ok(entries) = fs::read_dir(&cgroup_root) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if KNOWN_CONTROLLERS.contains(&name.as_str()) && is_mountpoint(&entry.path()) {
                    controllers.push(name);
                }
            }
        }
        Ok(Self {
            cgroup_root,
            sticky,
            unit_lister,
            device_resolver,
            controllers,
        })
    }
}

impl Sampler for CgAcctSampler {
    fn read(&mut self) -> Vec<Datapoint> {
        let services = self.unit_lister.list_units();
        let mut out = Vec::new();
        for controller in self.controllers.clone() {
            let result = cgroup::update_controller(&mut self.sticky, &self.cgroup_root, &controller, &services);
            match controller.as_str() {
                "cpuacct" => out.extend(read_cpuacct(&self.cgroup_root, &result.working_set)),
                "blkio" => out.extend(read_blkio(&self.cgroup_root, &result.working_set, &self.device_resolver)),
                "memory" => out.extend(read_memory(&self.cgroup_root, &result.working_set)),
                _ => {}
            }
        }
        out
    }
}

fn is_mountpoint(path: &Path) -> bool {
    let (Ok(meta), Some(parent)) = (fs::metadata(path), path.parent()) else {
        return false;
    };
    let Ok(parent_meta) = fs::metadata(parent) else {
        return false;
    };
    meta.dev() != parent_meta.dev()
}

/// `@` is stripped from service names only in emitted metric paths; the
/// cgroup directory and sticky-list key keep the collapsed `foo@` form.
fn metric_svc(svc: &str) -> String {
    svc.replace('@', "")
}

fn user_hz() -> f64 {
    unsafe { libc::sysconf(libc::_SC_CLK_TCK) as f64 }
}

fn parse_cpuacct_stat(content: &str) -> Option<(f64, f64)> {
    let mut user = None;
    let mut system = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next()?;
        let val: f64 = parts.next()?.parse().ok()?;
        match key {
            "user" => user = Some(val),
            "system" => system = Some(val),
            _ => {}
        }
    }
    Some((user?, system?))
}

fn read_cpuacct(cgroup_root: &Path, working_set: &[String]) -> Vec<Datapoint> {
    let hz = user_hz();
    let mut out = Vec::new();
    let mut targets: Vec<(String, PathBuf, bool)> = Vec::new();
    for svc in working_set {
        if svc == "total" {
            log::warn!("service literally named 'total' collides with the synthetic total series, skipping");
            continue;
        }
        targets.push((svc.clone(), cgroup::service_cgroup_dir(cgroup_root, "cpuacct", svc), true));
    }
    targets.push(("total".to_string(), cgroup_root.join("cpuacct"), false));

    for (svc, dir, emit_count) in targets {
        let name = metric_svc(&svc);
        if let Ok(stat_content) = fs::read_to_string(dir.join("cpuacct.stat")) {
            if let Some((user, sys)) = parse_cpuacct_stat(&stat_content) {
                out.push(Datapoint::counter(format!("processes.services.{name}.cpu.total.user"), user / hz));
                out.push(Datapoint::counter(format!("processes.services.{name}.cpu.total.sys"), sys / hz));
            }
        }
        if let Ok(percpu) = fs::read_to_string(dir.join("cpuacct.usage_percpu")) {
            for (idx, val) in percpu.split_whitespace().enumerate() {
                if let Ok(ns) = val.parse::<f64>() {
                    out.push(Datapoint::counter(format!("processes.services.{name}.cpu.total.{idx}"), ns));
                }
            }
        }
        if emit_count {
            if let Ok(tasks) = fs::read_to_string(dir.join("tasks")) {
                out.push(Datapoint::gauge(
                    format!("processes.services.{name}.count"),
                    tasks.lines().count() as f64,
                ));
            }
        }
    }
    out
}

fn parse_blkio_line(line: &str) -> Option<(u64, u64, String, f64)> {
    let mut parts = line.split_whitespace();
    let devpart = parts.next()?;
    let op = parts.next()?;
    let value: f64 = parts.next()?.parse().ok()?;
    let (maj, min) = devpart.split_once(':')?;
    Some((maj.parse().ok()?, min.parse().ok()?, op.to_string(), value))
}

fn read_blkio(cgroup_root: &Path, working_set: &[String], resolver: &DeviceResolver) -> Vec<Datapoint> {
    let mut out = Vec::new();
    for svc in working_set {
        let name = metric_svc(svc);
        let dir = cgroup::service_cgroup_dir(cgroup_root, "blkio", svc);
        for (file, suffix) in BLKIO_FILES {
            let Ok(content) = fs::read_to_string(dir.join(format!("blkio.{file}"))) else {
                continue;
            };
            for line in content.lines() {
                let Some((maj, min, op, value)) = parse_blkio_line(line) else {
                    continue;
                };
                if op.eq_ignore_ascii_case("total") {
                    continue;
                }
                let Some(dev) = resolver.resolve(maj, min) else {
                    continue;
                };
                out.push(Datapoint::counter(
                    format!("processes.services.{name}.io.{dev}.{suffix}.{}", op.to_lowercase()),
                    value,
                ));
            }
        }
    }
    out
}

fn read_memory(cgroup_root: &Path, working_set: &[String]) -> Vec<Datapoint> {
    let mut out = Vec::new();
    for svc in working_set {
        let name = metric_svc(svc);
        let path = cgroup::service_cgroup_dir(cgroup_root, "memory", svc).join("memory.stat");
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines() {
            let mut parts = line.split_whitespace();
            let (Some(key), Some(val_str)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Some(suffix) = key.strip_prefix("total_") else {
                continue;
            };
            let Ok(val) = val_str.parse::<f64>() else {
                continue;
            };
            let metric_name = format!("processes.services.{name}.memory.{suffix}");
            if MEMORY_COUNTERS.contains(&suffix) {
                out.push(Datapoint::counter(metric_name, val));
            } else {
                out.push(Datapoint::gauge(metric_name, val));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpuacct_stat() {
        let (user, sys) = parse_cpuacct_stat("user 120\nsystem 30\n").unwrap();
        assert_eq!(user, 120.0);
        assert_eq!(sys, 30.0);
    }

    #[test]
    fn parses_blkio_line() {
        let (maj, min, op, value) = parse_blkio_line("8:0 Read 1024").unwrap();
        assert_eq!((maj, min), (8, 0));
        assert_eq!(op, "Read");
        assert_eq!(value, 1024.0);
    }

    #[test]
    fn metric_service_name_strips_at_sign() {
        assert_eq!(metric_svc("getty@"), "getty");
        assert_eq!(metric_svc("nginx"), "nginx");
    }

    #[test]
    fn memory_stat_keeps_only_total_prefixed_keys() {
        let content = "cache 1000\ntotal_cache 2000\ntotal_pgfault 5\n";
        let filtered: Vec<&str> = content
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .filter_map(|k| k.strip_prefix("total_"))
            .collect();
        assert_eq!(filtered, vec!["cache", "pgfault"]);
        assert!(MEMORY_COUNTERS.contains(&"pgfault"));
        assert!(!MEMORY_COUNTERS.contains(&"cache"));
    }
}
