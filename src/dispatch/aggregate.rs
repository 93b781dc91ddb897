use std::collections::BTreeMap;

/// Node label used for the synthetic cross-node entry.
pub const MEAN_NODE: &str = "mean";

/// One decoded probe outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    pub destination: String,
    pub party: String,
    pub node: String,
    pub success: bool,
    pub value_ms: u64,
}

impl ResultRecord {
    pub fn success(destination: &str, party: &str, node: &str, value_ms: u64) -> Self {
        Self {
            destination: destination.to_owned(),
            party: party.to_owned(),
            node: node.to_owned(),
            success: true,
            value_ms,
        }
    }

    pub fn failure(destination: &str, party: &str, node: &str) -> Self {
        Self {
            destination: destination.to_owned(),
            party: party.to_owned(),
            node: node.to_owned(),
            success: false,
            value_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSample {
    pub node: String,
    /// 1 when the node produced a value, 0 otherwise.
    pub count: u32,
    pub value_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeanValue {
    pub count: u32,
    pub value_ms: u64,
}

/// Per-destination view of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedMetric {
    pub destination: String,
    pub party: String,
    pub per_node: Vec<NodeSample>,
    pub mean: MeanValue,
}

impl AggregatedMetric {
    /// Per-node samples followed by the `mean` entry, in write order.
    pub fn samples(&self) -> impl Iterator<Item = NodeSample> + '_ {
        self.per_node
            .iter()
            .cloned()
            .chain(std::iter::once(NodeSample {
                node: MEAN_NODE.to_owned(),
                count: self.mean.count,
                value_ms: self.mean.value_ms,
            }))
    }
}

/// Groups records by destination, keeping arrival order within a group.
pub fn aggregate<I>(records: I) -> BTreeMap<String, AggregatedMetric>
where
    I: IntoIterator<Item = ResultRecord>,
{
    let mut metrics: BTreeMap<String, AggregatedMetric> = BTreeMap::new();
    for record in records {
        let metric = metrics
            .entry(record.destination.clone())
            .or_insert_with(|| AggregatedMetric {
                destination: record.destination.clone(),
                party: record.party.clone(),
                per_node: Vec::new(),
                mean: MeanValue {
                    count: 0,
                    value_ms: 0,
                },
            });
        metric.per_node.push(NodeSample {
            node: record.node,
            count: u32::from(record.success),
            value_ms: record.value_ms,
        });
    }

    for metric in metrics.values_mut() {
        metric.mean = mean_of(&metric.per_node);
    }
    metrics
}

/// Mean over samples with a value, rounded half-to-even; `(0, 0)` when none succeeded.
pub fn mean_of(samples: &[NodeSample]) -> MeanValue {
    let (count, sum) = samples
        .iter()
        .filter(|sample| sample.count == 1)
        .fold((0u32, 0u64), |(count, sum), sample| {
            (count + 1, sum + sample.value_ms)
        });

    if count == 0 {
        return MeanValue {
            count: 0,
            value_ms: 0,
        };
    }

    MeanValue {
        count,
        value_ms: (sum as f64 / count as f64).round_ties_even() as u64,
    }
}
