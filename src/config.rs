use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/harvestd.toml";
const ENV_CONFIG_PATH: &str = "HARVESTD_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub timing: TimingConfig,
    pub slab: SlabConfig,
    pub cron: CronConfig,
    pub cgroup: CgroupConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `HARVESTD_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|err| {
                log::warn!("failed to parse {}: {err}, using defaults", path.display());
                Config::default()
            }),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    pub counter_cache_ttl_secs: u64,
    pub counter_cache_sweep_divisor: u64,
    pub dev_cache_ttl_secs: u64,
    pub rotation_check_interval_secs: u64,
    pub read_interval_min_ms: Option<u64>,
    pub read_interval_max_ms: u64,
    pub read_interval_mul: f64,
    pub min_dump_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    pub max_reconnects: Option<u32>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            counter_cache_ttl_secs: 12 * 3600,
            counter_cache_sweep_divisor: 4,
            dev_cache_ttl_secs: 610,
            rotation_check_interval_secs: 20,
            read_interval_min_ms: Some(100),
            read_interval_max_ms: 20_000,
            read_interval_mul: 1.1,
            min_dump_interval_secs: 10,
            reconnect_delay_secs: 5,
            max_reconnects: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SlabConfig {
    pub include_prefixes: Vec<String>,
    pub exclude_prefixes: Vec<String>,
    pub pass_zeroes: bool,
    pub version_check: Option<String>,
}

impl Default for SlabConfig {
    fn default() -> Self {
        Self {
            include_prefixes: Vec::new(),
            exclude_prefixes: vec![
                "kmalloc-".to_string(),
                "kmem_cache".to_string(),
                "dma-kmalloc-".to_string(),
            ],
            pass_zeroes: false,
            version_check: Some("2.1".to_string()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CronConfig {
    pub log_path: String,
    pub xattr_name: String,
    /// job-alias -> regex. An alias beginning with `_` uses the named
    /// capture group in the regex itself as the job name; any other alias
    /// is used literally.
    pub aliases: Vec<(String, String)>,
    /// event-name -> regex, matched against the log line after the
    /// timestamp. Not hardcoded, unlike the original's fleet-specific
    /// literals: operators may replace these for a different cron wrapper
    /// log format. Defaults cover the generic init/start/finish/duration/
    /// error lifecycle vocabulary.
    pub events: Vec<(String, String)>,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            log_path: "/var/log/cron-jobs.log".to_string(),
            xattr_name: "user.collectd.logtail.pos".to_string(),
            aliases: vec![(
                "_name".to_string(),
                r"/etc/(\S+/)*(?P<name>\S+)(\s+|$)".to_string(),
            )],
            events: vec![
                ("init".to_string(), r"task\[(\d+|-)\]: Queued\b[^:]*: (?P<job>.*)$".to_string()),
                ("start".to_string(), r"task\[(\d+|-)\]: Started\b[^:]*: (?P<job>.*)$".to_string()),
                ("finish".to_string(), r"task\[(\d+|-)\]: Finished\b[^:]*: (?P<job>.*)$".to_string()),
                (
                    "duration".to_string(),
                    r"task\[(\d+|-)\]: Finished \([^):]*\bduration=(?P<val>\d+)[,)][^:]*: (?P<job>.*)$".to_string(),
                ),
                (
                    "error".to_string(),
                    r"task\[(\d+|-)\]: Finished \([^):]*\bstatus=0*[^0]+0*[,)][^:]*: (?P<job>.*)$".to_string(),
                ),
            ],
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CgroupConfig {
    pub root: String,
    pub sticky_file_name: String,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            root: "/sys/fs/cgroup".to_string(),
            sticky_file_name: "sticky.cgacct".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"
[timing]
counter_cache_ttl_secs = 43200
dev_cache_ttl_secs = 610

[slab]
pass_zeroes = false

[cron]
log_path = "/var/log/cron-jobs.log"
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.timing.counter_cache_ttl_secs, 43200);
        assert_eq!(cfg.timing.counter_cache_sweep_divisor, 4);
        assert_eq!(
            cfg.slab.exclude_prefixes,
            vec!["kmalloc-", "kmem_cache", "dma-kmalloc-"]
        );
        assert_eq!(cfg.cron.log_path, "/var/log/cron-jobs.log");
        assert_eq!(cfg.cgroup.root, "/sys/fs/cgroup");
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[slab]\npass_zeroes = true").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert!(cfg.slab.pass_zeroes);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, "/nonexistent/harvestd.toml");
        }
        let cfg = Config::load();
        assert_eq!(cfg.timing.counter_cache_ttl_secs, 12 * 3600);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
