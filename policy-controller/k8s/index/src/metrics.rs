use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

use crate::SharedIndex;

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let mut policies_encoder = encoder.encode_descriptor(
            "network_policy_index_size",
            "The number of network policies in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in this.namespaces.iter() {
            let labels = [("namespace", ns.as_str())];
            let policies = ConstGauge::new(index.policies.len() as u32);
            let policies_encoder = policies_encoder.encode_family(&labels)?;
            policies.encode(policies_encoder)?;
        }

        let mut processed_encoder = encoder.encode_descriptor(
            "processed_policy_index_size",
            "The number of merged pod selector policies in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in this.namespaces.iter() {
            let labels = [("namespace", ns.as_str())];
            let processed = ConstGauge::new(index.processed.len() as u32);
            let processed_encoder = processed_encoder.encode_family(&labels)?;
            processed.encode(processed_encoder)?;
        }

        let mut pods_encoder = encoder.encode_descriptor(
            "pod_index_size",
            "The number of enforced pods in index",
            None,
            MetricType::Gauge,
        )?;
        for (ns, index) in this.namespaces.iter() {
            let labels = [("namespace", ns.as_str())];
            let pods = ConstGauge::new(index.pods.len() as u32);
            let pods_encoder = pods_encoder.encode_family(&labels)?;
            pods.encode(pods_encoder)?;
        }

        let sets_encoder = encoder.encode_descriptor(
            "membership_set_index_size",
            "The number of membership sets in index",
            None,
            MetricType::Gauge,
        )?;
        let sets = ConstGauge::new(this.sets.len() as u32);
        sets.encode(sets_encoder)?;

        Ok(())
    }
}
