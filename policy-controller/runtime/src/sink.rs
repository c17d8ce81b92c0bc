use crate::core::{dataplane::State, Op};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error};

#[derive(Clone, Debug)]
pub(crate) struct SinkMetrics {
    applied: Family<OpLabels, Counter>,
    rejected: Family<OpLabels, Counter>,
    rules: Gauge,
    sets: Gauge,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct OpLabels {
    op: &'static str,
}

// === impl SinkMetrics ===

impl SinkMetrics {
    pub(crate) fn register(reg: &mut Registry) -> Self {
        let applied = Family::<OpLabels, Counter>::default();
        reg.register(
            "applied",
            "Total number of operations applied to the dataplane",
            applied.clone(),
        );

        let rejected = Family::<OpLabels, Counter>::default();
        reg.register(
            "rejected",
            "Total number of operations rejected by the dataplane",
            rejected.clone(),
        );

        let rules = Gauge::default();
        reg.register("rules", "The number of installed rules", rules.clone());

        let sets = Gauge::default();
        reg.register("sets", "The number of membership sets", sets.clone());

        Self {
            applied,
            rejected,
            rules,
            sets,
        }
    }
}

/// Applies batches of operations to the dataplane until the index is
/// dropped.
///
/// A rejected operation is logged and skipped; the index's state is not
/// rolled back.
pub(crate) async fn run(
    mut updates: UnboundedReceiver<Vec<Op>>,
    mut state: State,
    metrics: SinkMetrics,
) -> State {
    while let Some(ops) = updates.recv().await {
        apply(&mut state, &ops, &metrics);
    }
    debug!("Index dropped");
    state
}

fn apply(state: &mut State, ops: &[Op], metrics: &SinkMetrics) {
    for op in ops {
        let labels = OpLabels { op: op.name() };
        match state.apply(op) {
            Ok(()) => {
                debug!(%op, "Applied");
                metrics.applied.get_or_create(&labels).inc();
            }
            Err(error) => {
                error!(%op, %error, "Dataplane rejected operation");
                metrics.rejected.get_or_create(&labels).inc();
            }
        }
    }
    metrics.rules.set(state.rules().len() as i64);
    metrics.sets.set(state.set_count() as i64);
    debug!(
        ops = ops.len(),
        rules = state.rules().len(),
        sets = state.set_count(),
        "Synced"
    );
}
