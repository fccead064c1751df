use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

mod carbon;
mod cgroup;
mod config;
mod datapoint;
mod device;
mod driver;
mod durable_tail;
mod samplers;
mod systemd;
mod tail;

use crate::carbon::CarbonShipper;
use crate::config::Config;
use crate::datapoint::CounterCache;
use crate::device::DeviceResolver;
use crate::driver::Driver;
use crate::samplers::cgacct::CgAcctSampler;
use crate::samplers::cron::CronJobsSampler;
use crate::samplers::irq::IrqSampler;
use crate::samplers::memfrag::MemfragSampler;
use crate::samplers::memstats::MemStatsSampler;
use crate::samplers::slabinfo::SlabInfoSampler;
use crate::samplers::stat::StatSampler;
use crate::samplers::Sampler;
use crate::systemd::SystemctlUnitLister;

const DEFAULT_PORT: u16 = 2003;

#[derive(Parser, Debug)]
#[command(name = "harvestd")]
#[command(about = "Linux host-metrics collection daemon")]
struct Args {
    /// Carbon receiver, "host" or "host:port" (default port 2003)
    remote: String,

    #[arg(short = 'i', long, default_value_t = 60)]
    interval: u64,

    #[arg(short = 'n', long)]
    dry_run: bool,

    #[arg(long)]
    debug: bool,
}

fn split_remote(remote: &str) -> (String, u16) {
    match remote.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (remote.to_string(), DEFAULT_PORT),
        },
        None => (remote.to_string(), DEFAULT_PORT),
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    let config = Config::load();
    let (host, port) = split_remote(&args.remote);

    let device_resolver = Arc::new(DeviceResolver::new(Duration::from_secs(config.timing.dev_cache_ttl_secs)));

    let cgacct = CgAcctSampler::new(&config.cgroup, Box::new(SystemctlUnitLister), Arc::clone(&device_resolver))
        .with_context(|| format!("failed to acquire sticky-list lock under {}", config.cgroup.root))?;

    let samplers: Vec<Box<dyn Sampler>> = vec![
        Box::new(SlabInfoSampler::new(&config.slab)),
        Box::new(MemStatsSampler::default()),
        Box::new(StatSampler::default()),
        Box::new(MemfragSampler::default()),
        Box::new(IrqSampler::default()),
        Box::new(CronJobsSampler::new(&config.cron, &config.timing)),
        Box::new(cgacct),
    ];

    let cache = CounterCache::new(config.timing.counter_cache_ttl_secs, config.timing.counter_cache_sweep_divisor);

    let shipper = CarbonShipper::new(
        format!("{host}:{port}"),
        &local_hostname(),
        Duration::from_secs(config.timing.reconnect_delay_secs),
        config.timing.max_reconnects,
    );

    let driver = Driver::new(samplers, cache, shipper, Duration::from_secs(args.interval), args.dry_run);

    driver.run().await.context("carbon shipper gave up")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_remote("graphite.internal:2004"), ("graphite.internal".to_string(), 2004));
    }

    #[test]
    fn defaults_to_port_2003() {
        assert_eq!(split_remote("graphite.internal"), ("graphite.internal".to_string(), DEFAULT_PORT));
    }

    #[test]
    fn unparseable_port_falls_back_to_default_with_full_string_as_host() {
        assert_eq!(split_remote("ipv6::literal"), ("ipv6::literal".to_string(), DEFAULT_PORT));
    }
}
