use std::collections::HashMap;
use std::fs;

use crate::config::SlabConfig;
use crate::datapoint::Datapoint;

use super::{page_size, Sampler};

const SLABINFO_PATH: &str = "/proc/slabinfo";

struct SlabRecord {
    name: String,
    active_objs: u64,
    objsize: u64,
    pagesperslab: u64,
    active_slabs: u64,
    num_slabs: u64,
}

/// Parses `/proc/slabinfo`. See spec §4.5.
pub struct SlabInfoSampler {
    include_prefixes: Vec<String>,
    exclude_prefixes: Vec<String>,
    pass_zeroes: bool,
    version_check: Option<String>,
    field_indices: Option<HashMap<String, usize>>,
}

impl SlabInfoSampler {
    pub fn new(cfg: &SlabConfig) -> Self {
        let mut sampler = Self {
            include_prefixes: cfg.include_prefixes.clone(),
            exclude_prefixes: cfg.exclude_prefixes.clone(),
            pass_zeroes: cfg.pass_zeroes,
            version_check: cfg.version_check.clone(),
            field_indices: None,
        };
        sampler.init();
        sampler
    }

    fn init(&mut self) {
        let content = match fs::read_to_string(SLABINFO_PATH) {
            Ok(c) => c,
            Err(err) => {
                log::warn!("failed to read {SLABINFO_PATH}: {err}");
                return;
            }
        };
        let mut lines = content.lines();
        let Some(header1) = lines.next() else { return };
        let version = header1.rsplit(':').next().unwrap_or("").trim().to_string();
        if let Some(expected) = &self.version_check {
            if &version != expected {
                log::warn!(
                    "slabinfo header indicates different schema version (expecting {expected}): {header1}"
                );
            }
        }
        let Some(header2) = lines.next() else { return };
        match parse_header(header2) {
            Some(h) => self.field_indices = Some(h),
            None => log::error!("unexpected slabinfo format, not processing it"),
        }
    }
}

impl Sampler for SlabInfoSampler {
    fn read(&mut self) -> Vec<Datapoint> {
        let Some(headers) = &self.field_indices else {
            return Vec::new();
        };
        let content = match fs::read_to_string(SLABINFO_PATH) {
            Ok(c) => c,
            Err(err) => {
                log::debug!("failed to read {SLABINFO_PATH}: {err}");
                return Vec::new();
            }
        };
        let ps = page_size();
        let mut out = Vec::new();
        for line in content.lines().skip(2) {
            let Some(record) = parse_record(line, headers) else {
                continue;
            };
            let force_include = !self.include_prefixes.is_empty()
                && self.include_prefixes.iter().any(|p| record.name.starts_with(p.as_str()));
            if !force_include && self.exclude_prefixes.iter().any(|p| record.name.starts_with(p.as_str())) {
                continue;
            }
            let obj_active = record.active_objs * record.objsize;
            let slab_active = record.active_slabs * record.pagesperslab * ps;
            let slab_allocated = record.num_slabs * record.pagesperslab * ps;
            if !self.pass_zeroes && obj_active + slab_active + slab_allocated == 0 {
                continue;
            }
            out.push(Datapoint::gauge(
                format!("memory.slabs.{}.bytes_obj_active", record.name),
                obj_active as f64,
            ));
            out.push(Datapoint::gauge(
                format!("memory.slabs.{}.bytes_slab_active", record.name),
                slab_active as f64,
            ));
            out.push(Datapoint::gauge(
                format!("memory.slabs.{}.bytes_slab_allocated", record.name),
                slab_allocated as f64,
            ));
        }
        out
    }
}

fn parse_header(line: &str) -> Option<HashMap<String, usize>> {
    let tokens: Vec<&str> = line.trim().split_whitespace().collect();
    if tokens.len() < 2 || tokens[0] != "#" || tokens[1] != "name" {
        return None;
    }
    let mut headers = HashMap::new();
    headers.insert("name".to_string(), 0);
    for (idx, header) in tokens[2..].iter().enumerate() {
        if header.starts_with('<') && header.ends_with('>') {
            headers.insert(header[1..header.len() - 1].to_string(), idx + 1);
        }
    }
    Some(headers)
}

fn parse_record(line: &str, headers: &HashMap<String, usize>) -> Option<SlabRecord> {
    let tokens: Vec<&str> = line.trim().split_whitespace().collect();
    if tokens.is_empty() {
        return None;
    }
    let get = |key: &str| -> Option<&str> { headers.get(key).and_then(|&idx| tokens.get(idx).copied()) };
    Some(SlabRecord {
        name: get("name")?.to_string(),
        active_objs: get("active_objs")?.parse().ok()?,
        objsize: get("objsize")?.parse().ok()?,
        pagesperslab: get("pagesperslab")?.parse().ok()?,
        active_slabs: get("active_slabs")?.parse().ok()?,
        num_slabs: get("num_slabs")?.parse().ok()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "# name            <active_objs> <num_objs> <objsize> <objperslab> <pagesperslab> : tunables <limit> <batchcount> <sharedfactor> : slabdata <active_slabs> <num_slabs> <sharedavail>";

    #[test]
    fn parses_header_indices() {
        let headers = parse_header(HEADER).unwrap();
        assert_eq!(headers["name"], 0);
        assert_eq!(headers["active_objs"], 1);
        assert_eq!(headers["pagesperslab"], 5);
        assert_eq!(headers["active_slabs"], 13);
        assert_eq!(headers["num_slabs"], 14);
    }

    #[test]
    fn rejects_malformed_header() {
        assert!(parse_header("garbage line").is_none());
    }

    #[test]
    fn slab_filter_scenario() {
        // spec.md §8 scenario 4
        let headers = parse_header(HEADER).unwrap();
        let record = parse_record("dentry 10 12 192 1 1 : tunables 0 0 0 : slabdata 2 3 0", &headers).unwrap();
        assert_eq!(record.active_objs, 10);
        assert_eq!(record.objsize, 192);
        assert_eq!(record.pagesperslab, 1);
        assert_eq!(record.active_slabs, 2);
        assert_eq!(record.num_slabs, 3);
    }

    #[test]
    fn kmalloc_rows_are_excluded_by_default() {
        let cfg = SlabConfig::default();
        assert!(cfg.exclude_prefixes.iter().any(|p| "kmalloc-64".starts_with(p.as_str())));
    }
}
