use std::fs;

use crate::datapoint::Datapoint;

use super::Sampler;

const STAT_PATH: &str = "/proc/stat";

/// Reads `/proc/stat`. See spec §4.5.
#[derive(Default)]
pub struct StatSampler;

impl Sampler for StatSampler {
    fn read(&mut self) -> Vec<Datapoint> {
        let content = match fs::read_to_string(STAT_PATH) {
            Ok(c) => c,
            Err(err) => {
                log::debug!("failed to read {STAT_PATH}: {err}");
                return Vec::new();
            }
        };
        content.lines().filter_map(parse_line).collect()
    }
}

fn parse_line(line: &str) -> Option<Datapoint> {
    let (label, rest) = line.split_once(char::is_whitespace)?;
    let total: f64 = rest.trim().split_whitespace().next()?.parse().ok()?;
    let name = match label {
        "intr" => "irq.total.hard",
        "softirq" => "irq.total.soft",
        "processes" => "processes.forks",
        _ => return None,
    };
    Some(Datapoint::counter(name, total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_labels() {
        let dp = parse_line("intr 1234 0 0 0").unwrap();
        assert_eq!(dp.name, "irq.total.hard");
        assert_eq!(dp.raw_value, 1234.0);
    }

    #[test]
    fn ignores_unknown_labels() {
        assert!(parse_line("cpu  123 456 789 0").is_none());
    }

    #[test]
    fn maps_processes_to_forks() {
        let dp = parse_line("processes 99").unwrap();
        assert_eq!(dp.name, "processes.forks");
    }
}
