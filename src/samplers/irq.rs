use std::collections::HashSet;
use std::fs;

use crate::datapoint::Datapoint;

use super::Sampler;

const INTERRUPTS_PATH: &str = "/proc/interrupts";
const SOFTIRQS_PATH: &str = "/proc/softirqs";

/// Parses `/proc/interrupts` and `/proc/softirqs`. See spec §4.5.
#[derive(Default)]
pub struct IrqSampler;

impl Sampler for IrqSampler {
    fn read(&mut self) -> Vec<Datapoint> {
        let mut out = Vec::new();
        for path in [INTERRUPTS_PATH, SOFTIRQS_PATH] {
            let content = match fs::read_to_string(path) {
                Ok(c) => c,
                Err(err) => {
                    log::debug!("failed to read {path}: {err}");
                    continue;
                }
            };
            let (bindings, irqs) = parse_irq_table(&content);
            for (irq, counts) in irqs {
                if counts.iter().sum::<i64>() == 0 {
                    continue;
                }
                for (bind, count) in bindings.iter().zip(counts.iter()) {
                    out.push(Datapoint::counter(format!("irq.{irq}.{bind}"), *count as f64));
                }
            }
        }
        out
    }
}

fn parse_irq_table(content: &str) -> (Vec<String>, Vec<(String, Vec<i64>)>) {
    let mut lines = content.lines();
    let header = lines.next().unwrap_or("");
    let bindings: Vec<String> = header.split_whitespace().map(|s| s.to_lowercase()).collect();
    let bindings_cnt = bindings.len();

    let mut irqs = Vec::new();
    let mut seen = HashSet::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((irq_raw, rest)) = line.split_once(char::is_whitespace) else {
            continue;
        };
        let irq = irq_raw.trim_end_matches(':').to_lowercase();
        if !seen.insert(irq.clone()) {
            log::warn!("conflicting irq name/id: {irq:?}, skipping");
            continue;
        }
        let counts: Vec<i64> = rest
            .split_whitespace()
            .take(bindings_cnt)
            .filter_map(|t| t.parse().ok())
            .collect();
        irqs.push((irq, counts));
    }
    (bindings, irqs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_per_cpu_counts() {
        let content = "           CPU0       CPU1\n  0:         10          5   IO-APIC   timer\n";
        let (bindings, irqs) = parse_irq_table(content);
        assert_eq!(bindings, vec!["cpu0", "cpu1"]);
        assert_eq!(irqs, vec![("0".to_string(), vec![10, 5])]);
    }

    #[test]
    fn duplicate_irq_ids_keep_first_occurrence() {
        let content = "   CPU0\nNMI:   1\nNMI:   2\n";
        let (_, irqs) = parse_irq_table(content);
        assert_eq!(irqs.len(), 1);
        assert_eq!(irqs[0].1, vec![1]);
    }

    #[test]
    fn all_zero_row_is_dropped_by_the_sampler() {
        let (_, irqs) = parse_irq_table("   CPU0       CPU1\n  1:    0    0\n");
        let total: i64 = irqs[0].1.iter().sum();
        assert_eq!(total, 0);
    }
}
