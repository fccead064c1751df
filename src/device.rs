use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// glibc's `gnu_dev_major`/`gnu_dev_minor` bit layout for `dev_t`.
fn major(dev: u64) -> u64 {
    ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff)
}

fn minor(dev: u64) -> u64 {
    (dev & 0xff) | ((dev >> 12) & !0xff)
}

const GLOB_DIRS: &[(&str, &str)] = &[("/dev/mapper", ""), ("/dev", "sd")];

/// Maps `(major, minor)` device numbers to symbolic device names by
/// scanning `/dev/mapper/*` and `/dev/sd*`, refreshed no more than once
/// per `ttl`.
pub struct DeviceResolver {
    ttl: Duration,
    state: Mutex<State>,
}

struct State {
    map: HashMap<(u64, u64), String>,
    last_refresh: Option<Instant>,
}

impl DeviceResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            state: Mutex::new(State {
                map: HashMap::new(),
                last_refresh: None,
            }),
        }
    }

    pub fn resolve(&self, major: u64, minor: u64) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let stale = match state.last_refresh {
            None => true,
            Some(t) => t.elapsed() > self.ttl,
        };
        if state.map.is_empty() || stale {
            state.map = scan_devices();
            state.last_refresh = Some(Instant::now());
        }
        state.map.get(&(major, minor)).cloned()
    }
}

fn scan_devices() -> HashMap<(u64, u64), String> {
    let mut map = HashMap::new();
    for (dir, prefix) in GLOB_DIRS {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !prefix.is_empty() && !name.starts_with(prefix) {
                continue;
            }
            // entry.metadata() is lstat-equivalent and would return the
            // symlink's own rdev for /dev/mapper/* entries (always
            // symlinks to ../dmN); follow the link to the real device.
            let meta = match std::fs::metadata(entry.path()) {
                Ok(m) => m,
                Err(_) => continue, // permission/transient, skip silently
            };
            let rdev = meta.rdev();
            let key = (major(rdev), minor(rdev));
            let symbol = name.replace('.', "_");
            map.insert(key, symbol);
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn major_minor_decomposition() {
        // sda1 on a typical system: major 8, minor 1 -> dev_t 0x801
        let dev = (8u64 << 8) | 1u64;
        assert_eq!(major(dev), 8);
        assert_eq!(minor(dev), 1);
    }

    #[test]
    fn no_match_returns_none() {
        let resolver = DeviceResolver::new(Duration::from_secs(610));
        assert_eq!(resolver.resolve(9999, 9999), None);
    }

    #[test]
    fn resolved_names_never_contain_dots() {
        // spec.md §8: device-name normalization invariant
        let mut map = HashMap::new();
        map.insert((1, 2), "vg0-lv.snapshot".replace('.', "_"));
        for name in map.values() {
            assert!(!name.contains('.'));
        }
    }
}
