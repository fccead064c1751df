use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::fcntl::{flock, FlockArg};

/// The sticky-list file doubles as the single-instance lock: both roles
/// live on one file descriptor, held for the process lifetime. See spec
/// §4.6 / §9.
pub struct StickyCgroupSet {
    file: File,
    entries: HashMap<String, HashSet<String>>,
}

impl StickyCgroupSet {
    pub fn open(cgroup_root: &Path, file_name: &str) -> io::Result<Self> {
        let path = cgroup_root.join(file_name);
        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|errno| io::Error::other(format!("sticky-list lock held by another instance: {errno}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let mut entries: HashMap<String, HashSet<String>> = HashMap::new();
        for line in contents.lines() {
            if let Some((controller, service)) = line.split_once(' ') {
                entries.entry(controller.to_string()).or_default().insert(service.to_string());
            }
        }
        Ok(Self { file, entries })
    }

    pub fn contains(&self, controller: &str, service: &str) -> bool {
        self.entries.get(controller).is_some_and(|s| s.contains(service))
    }

    pub fn services(&self, controller: &str) -> impl Iterator<Item = &String> {
        self.entries.get(controller).into_iter().flatten()
    }

    pub fn mark(&mut self, controller: &str, service: &str) -> bool {
        self.entries.entry(controller.to_string()).or_default().insert(service.to_string())
    }

    pub fn unmark(&mut self, controller: &str, service: &str) -> bool {
        self.entries.get_mut(controller).is_some_and(|set| set.remove(service))
    }

    /// Atomic truncate + rewrite of the whole file.
    pub fn persist(&mut self) -> io::Result<()> {
        let mut buf = String::new();
        for (controller, services) in &self.entries {
            for service in services {
                buf.push_str(controller);
                buf.push(' ');
                buf.push_str(service);
                buf.push('\n');
            }
        }
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(buf.as_bytes())?;
        self.file.flush()
    }
}

pub struct TickResult {
    pub working_set: Vec<String>,
    pub changed: bool,
}

/// One controller's worth of sticky-bit bookkeeping for a tick: pin newly
/// running services, unstick ones that went away, rewrite the sticky file
/// if anything changed. See spec §4.6 steps 1-3.
pub fn update_controller(
    sticky: &mut StickyCgroupSet,
    cgroup_root: &Path,
    controller: &str,
    services: &[String],
) -> TickResult {
    let mut changed = false;
    let service_set: HashSet<&str> = services.iter().map(|s| s.as_str()).collect();
    let mut working = Vec::new();

    for service in services {
        if sticky.contains(controller, service) {
            working.push(service.clone());
            continue;
        }
        let tasks_path = service_cgroup_dir(cgroup_root, controller, service).join("tasks");
        match add_sticky_bit(&tasks_path) {
            Ok(()) => {
                sticky.mark(controller, service);
                changed = true;
                working.push(service.clone());
            }
            Err(err) => {
                log::debug!("failed to mark {service} sticky under {controller}: {err}");
            }
        }
    }

    let currently_stuck: Vec<String> = sticky.services(controller).cloned().collect();
    for service in currently_stuck {
        if service_set.contains(service.as_str()) {
            continue;
        }
        let cgroup_dir = service_cgroup_dir(cgroup_root, controller, &service);
        if fs::remove_dir(&cgroup_dir).is_ok() {
            sticky.unmark(controller, &service);
            changed = true;
        } else if clear_sticky_bit(&cgroup_dir.join("tasks")).is_ok() {
            sticky.unmark(controller, &service);
            changed = true;
        }
    }

    if changed {
        if let Err(err) = sticky.persist() {
            log::warn!("failed to persist sticky-list for {controller}: {err}");
        }
    }

    TickResult { working_set: working, changed }
}

pub fn service_cgroup_dir(cgroup_root: &Path, controller: &str, service: &str) -> PathBuf {
    cgroup_root.join(controller).join("system").join(format!("{service}.service"))
}

fn add_sticky_bit(path: &Path) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    let mode = meta.permissions().mode() | libc::S_ISVTX as u32;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

fn clear_sticky_bit(path: &Path) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    let mode = meta.permissions().mode() & !(libc::S_ISVTX as u32);
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}
