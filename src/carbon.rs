use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;

/// Bounded-reconnect carbon/graphite plaintext shipper. One TCP connection
/// is held open across ticks; a write failure drops it and a fresh
/// connection is attempted on the next `send`. See spec §4.7 / §6.
pub struct CarbonShipper {
    addr: String,
    host_prefix: String,
    reconnect_delay: Duration,
    max_reconnects: Option<u32>,
    stream: Option<TcpStream>,
}

#[derive(Debug)]
pub struct ShipError(pub String);

impl std::fmt::Display for ShipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "carbon shipper exhausted reconnect attempts: {}", self.0)
    }
}

impl std::error::Error for ShipError {}

impl CarbonShipper {
    pub fn new(addr: String, hostname: &str, reconnect_delay: Duration, max_reconnects: Option<u32>) -> Self {
        Self {
            addr,
            host_prefix: sanitize_host(hostname),
            reconnect_delay,
            max_reconnects,
            stream: None,
        }
    }

    /// Sends a batch of `(name, value, ts)` triples as carbon plaintext
    /// lines in a single write, reconnecting (with delay) up to
    /// `max_reconnects` times if the connection is down or the write fails.
    pub fn send(&mut self, points: &[(String, f64, i64)]) -> Result<(), ShipError> {
        if points.is_empty() {
            return Ok(());
        }
        let payload = render(&self.host_prefix, points);

        let mut attempt = 0u32;
        loop {
            if self.stream.is_none() {
                match TcpStream::connect(&self.addr) {
                    Ok(s) => self.stream = Some(s),
                    Err(err) => return self.retry_or_fail(&mut attempt, err.to_string()),
                }
            }

            let result = self.stream.as_mut().unwrap().write_all(payload.as_bytes());
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    self.stream = None;
                    if let Err(give_up) = self.retry_or_fail(&mut attempt, err.to_string()) {
                        return Err(give_up);
                    }
                }
            }
        }
    }

    fn retry_or_fail(&self, attempt: &mut u32, reason: String) -> Result<(), ShipError> {
        *attempt += 1;
        if let Some(max) = self.max_reconnects {
            if *attempt > max {
                return Err(ShipError(reason));
            }
        }
        log::warn!("carbon connection to {} failed ({reason}), retrying in {:?}", self.addr, self.reconnect_delay);
        std::thread::sleep(self.reconnect_delay);
        Ok(())
    }
}

fn sanitize_host(hostname: &str) -> String {
    hostname.replace('.', "_")
}

fn render(host_prefix: &str, points: &[(String, f64, i64)]) -> String {
    let mut out = String::new();
    for (name, value, ts) in points {
        out.push_str(host_prefix);
        out.push('.');
        out.push_str(name);
        out.push(' ');
        out.push_str(&format_value(*value));
        out.push(' ');
        out.push_str(&ts.to_string());
        out.push('\n');
    }
    out
}

fn format_value(v: f64) -> String {
    if v == v.trunc() && v.is_finite() {
        format!("{v:.0}")
    } else {
        format!("{v}")
    }
}
