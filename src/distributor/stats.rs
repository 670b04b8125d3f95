//! Per-procedure accounting kept by each node connection.

use std::time::Duration;

/// Invocation outcome counters. `completed` counts every response delivered,
/// including aborts and errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct InvocationCounters {
    pub(crate) completed: u64,
    pub(crate) aborted: u64,
    pub(crate) errored: u64,
}

impl InvocationCounters {
    fn since(self, base: InvocationCounters) -> InvocationCounters {
        InvocationCounters {
            completed: self.completed - base.completed,
            aborted: self.aborted - base.aborted,
            errored: self.errored - base.errored,
        }
    }

    pub(crate) fn accumulate(&mut self, other: InvocationCounters) {
        self.completed += other.completed;
        self.aborted += other.aborted;
        self.errored += other.errored;
    }
}

/// Running min/max over a set of round trips, in milliseconds.
#[derive(Clone, Copy, Debug)]
struct MinMax {
    min_ms: u64,
    max_ms: u64,
}

impl MinMax {
    fn empty() -> Self {
        Self {
            min_ms: u64::MAX,
            max_ms: 0,
        }
    }

    fn record(&mut self, ms: u64) {
        self.min_ms = self.min_ms.min(ms);
        self.max_ms = self.max_ms.max(ms);
    }

    fn min(&self) -> u64 {
        if self.min_ms == u64::MAX {
            0
        } else {
            self.min_ms
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct RttBase {
    counters: InvocationCounters,
    client_total_ms: u64,
    cluster_total_ms: u64,
}

/// Round-trip aggregates for one view of one procedure.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RttSummary {
    pub(crate) avg_ms: u64,
    pub(crate) min_ms: u64,
    pub(crate) max_ms: u64,
}

/// What `procedure_stats` reports for one (connection, procedure) pair.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ProcedureSummary {
    pub(crate) counters: InvocationCounters,
    pub(crate) client: RttSummary,
    pub(crate) cluster: RttSummary,
}

/// Per-procedure statistics for a single connection.
///
/// Every counter carries a shadow baseline per view (connection table,
/// procedure table, each histogram) so `interval = true` snapshots report
/// deltas independently of each other and reset only their own baseline.
#[derive(Debug)]
pub(crate) struct ProcedureStats {
    counters: InvocationCounters,
    client_total_ms: u64,
    cluster_total_ms: u64,
    client_lifetime: MinMax,
    cluster_lifetime: MinMax,
    client_window: MinMax,
    cluster_window: MinMax,
    client_buckets: Vec<u64>,
    cluster_buckets: Vec<u64>,
    bucket_width_ms: u64,

    connection_base: InvocationCounters,
    procedure_base: RttBase,
    client_bucket_base: Vec<u64>,
    cluster_bucket_base: Vec<u64>,
}

impl ProcedureStats {
    pub(crate) fn new(bucket_count: usize, bucket_width: Duration) -> Self {
        let bucket_count = bucket_count.max(1);
        Self {
            counters: InvocationCounters::default(),
            client_total_ms: 0,
            cluster_total_ms: 0,
            client_lifetime: MinMax::empty(),
            cluster_lifetime: MinMax::empty(),
            client_window: MinMax::empty(),
            cluster_window: MinMax::empty(),
            client_buckets: vec![0; bucket_count],
            cluster_buckets: vec![0; bucket_count],
            bucket_width_ms: u64::try_from(bucket_width.as_millis()).unwrap_or(u64::MAX).max(1),
            connection_base: InvocationCounters::default(),
            procedure_base: RttBase::default(),
            client_bucket_base: vec![0; bucket_count],
            cluster_bucket_base: vec![0; bucket_count],
        }
    }

    fn millis(rtt: Duration) -> u64 {
        u64::try_from(rtt.as_millis()).unwrap_or(u64::MAX)
    }

    /// Records one completed invocation. `abort` and `error` are mutually
    /// exclusive; a successful response sets neither.
    pub(crate) fn record(
        &mut self,
        client_rtt: Duration,
        cluster_rtt: Duration,
        abort: bool,
        error: bool,
    ) {
        let client_ms = Self::millis(client_rtt);
        let cluster_ms = Self::millis(cluster_rtt);

        self.counters.completed += 1;
        if abort {
            self.counters.aborted += 1;
        }
        if error {
            self.counters.errored += 1;
        }

        self.client_total_ms += client_ms;
        self.cluster_total_ms += cluster_ms;
        self.client_lifetime.record(client_ms);
        self.cluster_lifetime.record(cluster_ms);
        self.client_window.record(client_ms);
        self.cluster_window.record(cluster_ms);

        let client_bucket = self.bucket_index(client_ms);
        let cluster_bucket = self.bucket_index(cluster_ms);
        self.client_buckets[client_bucket] += 1;
        self.cluster_buckets[cluster_bucket] += 1;
    }

    #[allow(clippy::cast_possible_truncation)]
    fn bucket_index(&self, ms: u64) -> usize {
        (ms / self.bucket_width_ms).min((self.client_buckets.len() - 1) as u64) as usize
    }

    /// The counters contributed to the connection-stats table. With
    /// `interval`, returns the delta since the last interval connection
    /// snapshot and resets that baseline.
    pub(crate) fn connection_delta(&mut self, interval: bool) -> InvocationCounters {
        if interval {
            let delta = self.counters.since(self.connection_base);
            self.connection_base = self.counters;
            delta
        } else {
            self.counters
        }
    }

    /// The procedure-stats table row for this procedure. With `interval`,
    /// counters and averages cover the window since the last interval
    /// procedure snapshot, min/max are the window extremes, and the baseline
    /// and window reset.
    pub(crate) fn procedure_summary(&mut self, interval: bool) -> ProcedureSummary {
        if interval {
            let counters = self.counters.since(self.procedure_base.counters);
            let client_total = self.client_total_ms - self.procedure_base.client_total_ms;
            let cluster_total = self.cluster_total_ms - self.procedure_base.cluster_total_ms;
            let summary = ProcedureSummary {
                counters,
                client: summarize(client_total, counters.completed, self.client_window),
                cluster: summarize(cluster_total, counters.completed, self.cluster_window),
            };
            self.procedure_base = RttBase {
                counters: self.counters,
                client_total_ms: self.client_total_ms,
                cluster_total_ms: self.cluster_total_ms,
            };
            self.client_window = MinMax::empty();
            self.cluster_window = MinMax::empty();
            summary
        } else {
            ProcedureSummary {
                counters: self.counters,
                client: summarize(
                    self.client_total_ms,
                    self.counters.completed,
                    self.client_lifetime,
                ),
                cluster: summarize(
                    self.cluster_total_ms,
                    self.counters.completed,
                    self.cluster_lifetime,
                ),
            }
        }
    }

    /// One histogram row: bucket counts for the client- or cluster-observed
    /// round trips. With `interval`, deltas since the last interval snapshot
    /// of the same histogram; that baseline resets.
    pub(crate) fn histogram(&mut self, client: bool, interval: bool) -> Vec<u64> {
        let (buckets, base) = if client {
            (&self.client_buckets, &mut self.client_bucket_base)
        } else {
            (&self.cluster_buckets, &mut self.cluster_bucket_base)
        };
        if interval {
            let delta: Vec<u64> = buckets.iter().zip(base.iter()).map(|(b, s)| b - s).collect();
            base.copy_from_slice(buckets);
            delta
        } else {
            buckets.clone()
        }
    }

    pub(crate) fn bucket_width_ms(&self) -> u64 {
        self.bucket_width_ms
    }
}

fn summarize(total_ms: u64, completed: u64, extremes: MinMax) -> RttSummary {
    RttSummary {
        avg_ms: if completed == 0 { 0 } else { total_ms / completed },
        min_ms: extremes.min(),
        max_ms: extremes.max_ms,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stats() -> ProcedureStats {
        ProcedureStats::new(20, Duration::from_millis(10))
    }

    #[test]
    fn counts_aborts_and_errors_as_completed() {
        let mut s = stats();
        s.record(Duration::from_millis(5), Duration::from_millis(2), false, false);
        s.record(Duration::from_millis(5), Duration::from_millis(2), true, false);
        s.record(Duration::from_millis(5), Duration::from_millis(2), false, true);
        let summary = s.procedure_summary(false);
        assert_eq!(summary.counters.completed, 3);
        assert_eq!(summary.counters.aborted, 1);
        assert_eq!(summary.counters.errored, 1);
    }

    #[test]
    fn final_bucket_is_a_catch_all() {
        let mut s = stats();
        s.record(Duration::from_millis(189), Duration::from_millis(0), false, false);
        s.record(Duration::from_millis(190), Duration::from_millis(0), false, false);
        s.record(Duration::from_millis(5_000), Duration::from_millis(0), false, false);
        let buckets = s.histogram(true, false);
        assert_eq!(buckets[18], 1);
        assert_eq!(buckets[19], 2);
    }

    #[test]
    fn interval_snapshot_reports_deltas_and_resets() {
        let mut s = stats();
        s.record(Duration::from_millis(10), Duration::from_millis(4), false, false);
        s.record(Duration::from_millis(30), Duration::from_millis(8), false, false);

        let first = s.procedure_summary(true);
        assert_eq!(first.counters.completed, 2);
        assert_eq!(first.client.avg_ms, 20);
        assert_eq!(first.client.min_ms, 10);
        assert_eq!(first.client.max_ms, 30);

        // Nothing happened since: the next interval window is empty.
        let second = s.procedure_summary(true);
        assert_eq!(second.counters.completed, 0);
        assert_eq!(second.client.min_ms, 0);
        assert_eq!(second.client.max_ms, 0);

        s.record(Duration::from_millis(50), Duration::from_millis(9), false, true);
        let third = s.procedure_summary(true);
        assert_eq!(third.counters.completed, 1);
        assert_eq!(third.counters.errored, 1);
        assert_eq!(third.client.min_ms, 50);
        assert_eq!(third.client.max_ms, 50);

        // The cumulative view is untouched by interval resets.
        let cumulative = s.procedure_summary(false);
        assert_eq!(cumulative.counters.completed, 3);
        assert_eq!(cumulative.client.min_ms, 10);
        assert_eq!(cumulative.client.max_ms, 50);
    }

    #[test]
    fn connection_and_procedure_baselines_are_independent() {
        let mut s = stats();
        s.record(Duration::from_millis(1), Duration::from_millis(1), false, false);
        assert_eq!(s.connection_delta(true).completed, 1);
        // A connection-view snapshot must not consume the procedure window.
        assert_eq!(s.procedure_summary(true).counters.completed, 1);
        assert_eq!(s.connection_delta(true).completed, 0);
    }
}
