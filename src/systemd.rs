use std::process::Command;

/// External collaborator boundary named, not implemented, by the spec: an
/// init-system `list_units()` that yields running `*.service` units.
/// Concretely backed by shelling out to `systemctl`, since the D-Bus API
/// itself is out of scope.
pub trait UnitLister: Send {
    fn list_units(&mut self) -> Vec<String>;
}

pub struct SystemctlUnitLister;

impl UnitLister for SystemctlUnitLister {
    fn list_units(&mut self) -> Vec<String> {
        let output = Command::new("systemctl")
            .args([
                "list-units",
                "--type=service",
                "--state=running",
                "--no-legend",
                "--plain",
                "--no-pager",
            ])
            .output();
        let output = match output {
            Ok(o) => o,
            Err(err) => {
                log::warn!("failed to invoke systemctl: {err}");
                return Vec::new();
            }
        };
        if !output.status.success() {
            log::warn!("systemctl list-units exited with {}", output.status);
            return Vec::new();
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_unit_line)
            .collect()
    }
}

fn parse_unit_line(line: &str) -> Option<String> {
    let unit = line.split_whitespace().next()?;
    let name = unit.strip_suffix(".service")?;
    Some(collapse_instance(name))
}

fn collapse_instance(name: &str) -> String {
    match name.split_once('@') {
        Some((prefix, _instance)) => format!("{prefix}@"),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_service_suffix() {
        assert_eq!(parse_unit_line("nginx.service loaded active running"), Some("nginx".to_string()));
    }

    #[test]
    fn ignores_non_service_units() {
        assert_eq!(parse_unit_line("sys-devices.mount loaded active mounted"), None);
    }

    #[test]
    fn collapses_instance_units() {
        assert_eq!(collapse_instance("getty@tty1"), "getty@");
        assert_eq!(collapse_instance("cron"), "cron");
    }
}
