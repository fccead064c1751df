pub mod cgacct;
pub mod cron;
pub mod irq;
pub mod memfrag;
pub mod memstats;
pub mod slabinfo;
pub mod stat;

use crate::datapoint::Datapoint;

/// One `/proc` source or cgroup controller. Invoked once per tick, in
/// registration order; a sampler that hits a transient error logs and
/// returns whatever it collected rather than aborting the tick.
pub trait Sampler {
    fn read(&mut self) -> Vec<Datapoint>;

    /// Releases any held file handles. Default no-op; only samplers that
    /// hold a tailer open override this.
    fn stop(&mut self) {}
}

pub(crate) fn page_size() -> u64 {
    // SC_PAGESIZE is effectively constant for the lifetime of the process.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}
