use crate::SharedIndex;
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeMetric},
    metrics::{gauge::ConstGauge, MetricType},
    registry::Registry,
};

#[derive(Debug)]
struct Instrumented(SharedIndex);

pub fn register(reg: &mut Registry, index: SharedIndex) {
    reg.register_collector(Box::new(Instrumented(index)));
}

impl Collector for Instrumented {
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), std::fmt::Error> {
        let this = self.0.read();

        let pods_encoder = encoder.encode_descriptor(
            "pods",
            "The number of pods in the index",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.pod_count() as u32).encode(pods_encoder)?;

        let namespaces_encoder = encoder.encode_descriptor(
            "namespaces",
            "The number of namespaces in the index",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.namespace_count() as u32).encode(namespaces_encoder)?;

        let roles_encoder = encoder.encode_descriptor(
            "roles",
            "The number of distinct roles annotated on non-terminal pods",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(this.role_count() as u32).encode(roles_encoder)?;

        Ok(())
    }
}
