use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use tracing::warn;

use crate::collector::extract::Observation;

/// Group observations into gauge families, in first-seen order.
///
/// A repeated (name, labels) pair within one scrape keeps its first value.
pub fn observation_families(observations: &[Observation]) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut seen: HashSet<(&str, &BTreeMap<String, String>)> = HashSet::new();

    for obs in observations {
        if !seen.insert((obs.name.as_str(), &obs.labels)) {
            warn!(metric = %obs.name, labels = ?obs.labels, "dropping duplicate observation");
            continue;
        }

        let slot = *index.entry(obs.name.as_str()).or_insert_with(|| {
            let mut family = MetricFamily::default();
            family.set_name(obs.name.clone());
            family.set_help(obs.help.clone());
            family.set_field_type(MetricType::GAUGE);
            families.push(family);
            families.len() - 1
        });

        families[slot].mut_metric().push(gauge(&obs.labels, obs.value));
    }

    families
}

fn gauge(labels: &BTreeMap<String, String>, value: f64) -> Metric {
    let mut metric = Metric::default();
    for (name, value) in labels {
        let mut pair = LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }

    let mut gauge = Gauge::default();
    gauge.set_value(value);
    metric.set_gauge(gauge);
    metric
}

/// Prometheus text exposition of the given families.
pub fn encode_text(families: &[MetricFamily]) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(families, &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}
