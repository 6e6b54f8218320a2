//! Prometheus-style metrics for the rebalancing demander.
//!
//! One [`RebalanceMetrics`] instance is owned per demander and shared with the
//! entry applier through the rebalance context.
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 RebalanceMetrics                 │
//! │  ┌───────────────────┐  ┌─────────────────────┐  │
//! │  │     Counters      │  │       Gauges        │  │
//! │  │ - rounds          │  │ - active_rounds     │  │
//! │  │ - demands/supply  │  │ - last_round_missed │  │
//! │  │ - entries         │  └─────────────────────┘  │
//! │  │ - partitions      │                           │
//! │  │ - cancellations   │                           │
//! │  └───────────────────┘                           │
//! └──────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;

/// Label values used for cancelled node streams.
pub mod cancel_reason {
    pub const TOPOLOGY_CHANGED: &str = "topology_changed";
    pub const CLASS_ERROR: &str = "class_error";
    pub const NODE_LEFT: &str = "node_left";
    pub const PROCESSING_ERROR: &str = "processing_error";
    pub const SEND_FAILED: &str = "send_failed";
}

/// Metrics for one rebalancing demander.
#[derive(Debug)]
pub struct RebalanceMetrics {
    // Rounds
    /// Rounds that sent at least one demand.
    pub rounds_started: Counter,
    /// Rounds whose sync future completed.
    pub rounds_completed: Counter,
    /// Rounds completed immediately because there was nothing to do.
    pub rounds_noop: Counter,
    /// Rounds left unfinished by `stop`.
    pub rounds_abandoned: Counter,
    /// Rounds currently in flight.
    pub active_rounds: Gauge,
    /// Missed partitions reported by the last finished round.
    pub last_round_missed: Gauge,

    // Messages
    pub demands_sent: Counter,
    pub demand_send_failures: Counter,
    pub supply_received: Counter,

    // Entries
    /// Entries written by the conditional insert.
    pub entries_applied: Counter,
    /// Entries skipped as already newer, filtered or not permitted.
    pub entries_skipped: Counter,
    /// Entries discarded because of the capacity ceiling.
    pub entries_dropped: Counter,

    // Partitions
    pub partitions_owned: Counter,
    pub partitions_missed: Counter,

    /// Cancelled node streams by reason.
    pub cancellations: LabeledCounter,
}

impl RebalanceMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            rounds_started: Counter::new("rebalance_rounds_started", "Rebalance rounds started"),
            rounds_completed: Counter::new(
                "rebalance_rounds_completed",
                "Rebalance rounds completed",
            ),
            rounds_noop: Counter::new("rebalance_rounds_noop", "Rebalance rounds with no work"),
            rounds_abandoned: Counter::new(
                "rebalance_rounds_abandoned",
                "Rebalance rounds abandoned on stop",
            ),
            active_rounds: Gauge::new("rebalance_active_rounds", "Rebalance rounds in flight"),
            last_round_missed: Gauge::new(
                "rebalance_last_round_missed",
                "Partitions missed by the last round",
            ),

            demands_sent: Counter::new("rebalance_demands_sent", "Demand messages sent"),
            demand_send_failures: Counter::new(
                "rebalance_demand_send_failures",
                "Demand messages that failed to send",
            ),
            supply_received: Counter::new(
                "rebalance_supply_received",
                "Supply messages received",
            ),

            entries_applied: Counter::new("rebalance_entries_applied", "Entries applied"),
            entries_skipped: Counter::new("rebalance_entries_skipped", "Entries skipped"),
            entries_dropped: Counter::new(
                "rebalance_entries_dropped",
                "Entries dropped over capacity",
            ),

            partitions_owned: Counter::new(
                "rebalance_partitions_owned",
                "Partitions transferred to owning state",
            ),
            partitions_missed: Counter::new(
                "rebalance_partitions_missed",
                "Partitions reported missed by suppliers",
            ),

            cancellations: LabeledCounter::new(
                "rebalance_cancellations_total",
                "Cancelled node streams",
                "reason",
            ),
        }
    }

    /// Record a round that sent demands.
    pub fn record_round_started(&self) {
        self.rounds_started.inc();
        self.active_rounds.inc();
    }

    /// Record a round that finished with `missed` partitions left over.
    pub fn record_round_completed(&self, missed: usize) {
        self.rounds_completed.inc();
        self.last_round_missed.set(missed as i64);
    }

    /// A started round is no longer in flight. Called once per round.
    pub fn record_round_settled(&self) {
        self.active_rounds.dec();
    }

    /// Record a round dropped unfinished on shutdown.
    pub fn record_round_abandoned(&self) {
        self.rounds_abandoned.inc();
        self.record_round_settled();
    }

    /// Record a round that completed without sending anything.
    pub fn record_noop_round(&self) {
        self.rounds_noop.inc();
    }

    /// Record a cancelled node stream.
    pub fn record_cancellation(&self, reason: &'static str) {
        self.cancellations.inc(reason);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> RebalanceMetricsSnapshot {
        RebalanceMetricsSnapshot {
            rounds_started: self.rounds_started.get(),
            rounds_completed: self.rounds_completed.get(),
            rounds_noop: self.rounds_noop.get(),
            rounds_abandoned: self.rounds_abandoned.get(),
            demands_sent: self.demands_sent.get(),
            demand_send_failures: self.demand_send_failures.get(),
            supply_received: self.supply_received.get(),
            entries_applied: self.entries_applied.get(),
            entries_skipped: self.entries_skipped.get(),
            entries_dropped: self.entries_dropped.get(),
            partitions_owned: self.partitions_owned.get(),
            partitions_missed: self.partitions_missed.get(),
            cancellations: self.cancellations.get_all().iter().map(|(_, n)| n).sum(),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        macro_rules! add_metric {
            ($kind:literal, $metric:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $metric.name(),
                    $metric.help(),
                    $metric.name(),
                    $kind,
                    $metric.name(),
                    $metric.get()
                ));
            };
        }

        add_metric!("counter", self.rounds_started);
        add_metric!("counter", self.rounds_completed);
        add_metric!("counter", self.rounds_noop);
        add_metric!("counter", self.rounds_abandoned);
        add_metric!("counter", self.demands_sent);
        add_metric!("counter", self.demand_send_failures);
        add_metric!("counter", self.supply_received);
        add_metric!("counter", self.entries_applied);
        add_metric!("counter", self.entries_skipped);
        add_metric!("counter", self.entries_dropped);
        add_metric!("counter", self.partitions_owned);
        add_metric!("counter", self.partitions_missed);

        add_metric!("gauge", self.active_rounds);
        add_metric!("gauge", self.last_round_missed);

        let name = self.cancellations.name();
        output.push_str(&format!(
            "# HELP {} {}\n# TYPE {} counter\n",
            name,
            self.cancellations.help(),
            name
        ));
        for (value, count) in self.cancellations.get_all() {
            output.push_str(&format!(
                "{}{{{}=\"{}\"}} {}\n",
                name,
                self.cancellations.label(),
                value,
                count
            ));
        }

        output
    }
}

impl Default for RebalanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of the demander counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceMetricsSnapshot {
    pub rounds_started: u64,
    pub rounds_completed: u64,
    pub rounds_noop: u64,
    pub rounds_abandoned: u64,
    pub demands_sent: u64,
    pub demand_send_failures: u64,
    pub supply_received: u64,
    pub entries_applied: u64,
    pub entries_skipped: u64,
    pub entries_dropped: u64,
    pub partitions_owned: u64,
    pub partitions_missed: u64,
    /// Cancellations across all reasons.
    pub cancellations: u64,
}
