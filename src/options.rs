//! Configuration for the [`Distributor`](crate::Distributor).

use std::time::Duration;

use typed_builder::TypedBuilder;

/// Write-queue depth past which a connection reports backpressure.
pub(crate) const DEFAULT_BACKPRESSURE_HIGH_WATER: usize = 262_144;

const DEFAULT_PROCEDURE_CALL_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CONNECTION_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);

/// Options used to configure a [`Distributor`](crate::Distributor).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DistributorOptions {
    /// How long an individual invocation may remain unanswered before the
    /// expiration reaper completes it with a synthetic
    /// [`ConnectionTimeout`](crate::ResponseStatus::ConnectionTimeout)
    /// response.
    ///
    /// Defaults to 120 seconds.
    #[builder(default = DEFAULT_PROCEDURE_CALL_TIMEOUT)]
    pub procedure_call_timeout: Duration,

    /// How long a connection may go without any inbound traffic before it is
    /// considered dead. An idle connection is probed with a heartbeat after a
    /// third of this interval; if the heartbeat goes unanswered past the full
    /// interval, the connection is closed.
    ///
    /// Defaults to 120 seconds.
    #[builder(default = DEFAULT_CONNECTION_RESPONSE_TIMEOUT)]
    pub connection_response_timeout: Duration,

    /// Number of bytes that may be queued for write on a single connection
    /// before it reports backpressure.
    ///
    /// Defaults to 262144.
    #[builder(default = DEFAULT_BACKPRESSURE_HIGH_WATER)]
    pub backpressure_high_water: usize,

    /// Number of threads the reactor runs for socket I/O. When unset, half
    /// the available cores (but at least one thread) are used.
    #[builder(default, setter(strip_option))]
    pub reactor_threads: Option<usize>,

    /// Number of buckets in each latency histogram. The final bucket is a
    /// catch-all for round trips past the end of the histogram.
    ///
    /// Defaults to 20.
    #[builder(default = 20)]
    pub latency_bucket_count: usize,

    /// Width of each latency histogram bucket.
    ///
    /// Defaults to 10 milliseconds.
    #[builder(default = Duration::from_millis(10))]
    pub latency_bucket_width: Duration,
}

impl Default for DistributorOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl DistributorOptions {
    pub(crate) fn reactor_threads(&self) -> usize {
        self.reactor_threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get() / 2)
                    .unwrap_or(1)
            })
            .max(1)
    }
}
