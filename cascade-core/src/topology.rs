//! The graph of computations and the concrete streams their logical names are bound to.
//!
//! Bindings are written `"<logical>:<stream>"`, e.g. `"i1:orders"`. Every logical stream a
//! computation declares must be bound exactly once. Cycles through streams are allowed since
//! streams are asynchronous; a [Topology] is only ever built from validated bindings.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use crate::computation::{ComputationFactory, ComputationMetadata};
use crate::error::{Error, Result};

/// A computation and its bindings. Inputs and outputs keep the order of the metadata.
#[derive(Clone)]
pub struct ComputationNode {
    metadata: ComputationMetadata,
    factory: ComputationFactory,
    inputs: Vec<(String, String)>,
    outputs: Vec<(String, String)>,
}

impl fmt::Debug for ComputationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationNode")
            .field("metadata", &self.metadata)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl ComputationNode {
    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    pub fn factory(&self) -> &ComputationFactory {
        &self.factory
    }

    /// `(logical, stream)` pairs of the inputs.
    pub fn inputs(&self) -> &[(String, String)] {
        &self.inputs
    }

    /// `(logical, stream)` pairs of the outputs.
    pub fn outputs(&self) -> &[(String, String)] {
        &self.outputs
    }

    pub fn input_streams(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(_, s)| s.as_str())
    }

    pub fn output_streams(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(_, s)| s.as_str())
    }
}

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    nodes: Vec<ComputationNode>,
}

fn parse_binding(computation: &str, binding: &str) -> Result<(String, String)> {
    match binding.split_once(':') {
        Some((logical, stream)) if !logical.is_empty() && !stream.is_empty() => {
            Ok((logical.to_string(), stream.to_string()))
        }
        _ => Err(Error::Topology(format!(
            "{computation}: invalid binding {binding:?}, expected <logical>:<stream>"
        ))),
    }
}

impl TopologyBuilder {
    /// Registers a computation. The factory is invoked once to read the metadata the bindings
    /// are validated against.
    pub fn add_computation<I, S>(mut self, factory: ComputationFactory, bindings: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let metadata = factory().metadata().clone();
        let name = metadata.name().to_string();
        if self.nodes.iter().any(|n| n.name() == name) {
            return Err(Error::Topology(format!(
                "computation {name} is registered twice"
            )));
        }

        let mut bound = BTreeMap::new();
        for binding in bindings {
            let (logical, stream) = parse_binding(&name, binding.as_ref())?;
            let declared = metadata.inputs().contains(&logical)
                || metadata.outputs().contains(&logical);
            if !declared {
                return Err(Error::Topology(format!(
                    "{name}: {logical} is not a declared input or output"
                )));
            }
            if bound.insert(logical.clone(), stream).is_some() {
                return Err(Error::Topology(format!("{name}: {logical} is bound twice")));
            }
        }

        let resolve = |logicals: &[String]| -> Result<Vec<(String, String)>> {
            logicals
                .iter()
                .map(|logical| {
                    bound
                        .get(logical)
                        .map(|stream| (logical.clone(), stream.clone()))
                        .ok_or_else(|| {
                            Error::Topology(format!("{name}: {logical} is not bound to a stream"))
                        })
                })
                .collect()
        };
        let inputs = resolve(metadata.inputs())?;
        let outputs = resolve(metadata.outputs())?;

        debug!(computation = %name, ?inputs, ?outputs, "Registered computation");
        self.nodes.push(ComputationNode {
            metadata,
            factory,
            inputs,
            outputs,
        });
        Ok(self)
    }

    pub fn build(self) -> Result<Topology> {
        if self.nodes.is_empty() {
            return Err(Error::Topology("no computation registered".to_string()));
        }
        let mut streams = BTreeMap::<String, StreamEdges>::new();
        for node in &self.nodes {
            for stream in node.input_streams() {
                streams
                    .entry(stream.to_string())
                    .or_default()
                    .consumers
                    .push(node.name().to_string());
            }
            for stream in node.output_streams() {
                streams
                    .entry(stream.to_string())
                    .or_default()
                    .producers
                    .push(node.name().to_string());
            }
        }
        Ok(Topology {
            nodes: self.nodes,
            streams,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StreamEdges {
    producers: Vec<String>,
    consumers: Vec<String>,
}

/// Frozen, validated graph.
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<ComputationNode>,
    streams: BTreeMap<String, StreamEdges>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// Computations in registration order.
    pub fn computations(&self) -> &[ComputationNode] {
        &self.nodes
    }

    pub fn computation(&self, name: &str) -> Option<&ComputationNode> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Every stream the topology reads or writes; they must exist before running.
    pub fn streams(&self) -> BTreeSet<&str> {
        self.streams.keys().map(String::as_str).collect()
    }

    /// Computations writing to the stream.
    pub fn producers(&self, stream: &str) -> &[String] {
        self.streams
            .get(stream)
            .map(|e| e.producers.as_slice())
            .unwrap_or_default()
    }

    /// Computations reading the stream.
    pub fn consumers(&self, stream: &str) -> &[String] {
        self.streams
            .get(stream)
            .map(|e| e.consumers.as_slice())
            .unwrap_or_default()
    }

    pub fn fan_in(&self, stream: &str) -> usize {
        self.producers(stream).len()
    }

    pub fn fan_out(&self, stream: &str) -> usize {
        self.consumers(stream).len()
    }

    /// Streams no computation writes to, fed from outside the topology.
    pub fn source_streams(&self) -> BTreeSet<&str> {
        self.streams
            .iter()
            .filter(|(_, e)| e.producers.is_empty())
            .map(|(s, _)| s.as_str())
            .collect()
    }

    /// Streams no computation reads.
    pub fn sink_streams(&self) -> BTreeSet<&str> {
        self.streams
            .iter()
            .filter(|(_, e)| e.consumers.is_empty())
            .map(|(s, _)| s.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::computation::Computation;
    use crate::context::ComputationContext;
    use crate::record::Record;

    struct Noop(ComputationMetadata);

    impl Computation for Noop {
        fn metadata(&self) -> &ComputationMetadata {
            &self.0
        }

        fn process_record(
            &mut self,
            _context: &mut ComputationContext,
            _input: &str,
            _record: &Record,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn noop(name: &'static str, inputs: usize, outputs: usize) -> ComputationFactory {
        Arc::new(move || {
            Box::new(Noop(ComputationMetadata::new(name, inputs, outputs))) as Box<dyn Computation>
        })
    }

    #[test]
    fn builds_graph() {
        let topology = Topology::builder()
            .add_computation(noop("A", 1, 1), ["i1:orders", "o1:shipped"])
            .unwrap()
            .add_computation(noop("B", 2, 1), ["i1:shipped", "i2:returns", "o1:audit"])
            .unwrap()
            .add_computation(noop("C", 1, 0), ["i1:shipped"])
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(
            topology.streams().into_iter().collect::<Vec<_>>(),
            vec!["audit", "orders", "returns", "shipped"]
        );
        assert_eq!(topology.fan_out("shipped"), 2);
        assert_eq!(topology.fan_in("shipped"), 1);
        assert_eq!(topology.consumers("shipped"), ["B", "C"]);
        assert_eq!(
            topology.source_streams().into_iter().collect::<Vec<_>>(),
            vec!["orders", "returns"]
        );
        assert_eq!(
            topology.sink_streams().into_iter().collect::<Vec<_>>(),
            vec!["audit"]
        );
        let b = topology.computation("B").unwrap();
        assert_eq!(b.input_streams().collect::<Vec<_>>(), vec!["shipped", "returns"]);
        assert_eq!(topology.fan_in("unknown"), 0);
    }

    #[test]
    fn feedback_loops_are_allowed() {
        let topology = Topology::builder()
            .add_computation(noop("loop", 1, 1), ["i1:work", "o1:work"])
            .unwrap()
            .build()
            .unwrap();
        assert!(topology.source_streams().is_empty());
        assert_eq!(topology.fan_in("work"), 1);
    }

    #[test]
    fn unbound_logical_name_is_rejected() {
        let err = Topology::builder()
            .add_computation(noop("A", 1, 1), ["i1:orders"])
            .unwrap_err();
        assert!(matches!(err, Error::Topology(msg) if msg.contains("o1 is not bound")));
    }

    #[test]
    fn undeclared_logical_name_is_rejected() {
        let err = Topology::builder()
            .add_computation(noop("A", 1, 1), ["i1:orders", "o1:shipped", "o2:extra"])
            .unwrap_err();
        assert!(matches!(err, Error::Topology(msg) if msg.contains("o2")));
    }

    #[test]
    fn malformed_and_duplicate_bindings() {
        assert!(
            Topology::builder()
                .add_computation(noop("A", 1, 0), ["i1"])
                .is_err()
        );
        assert!(
            Topology::builder()
                .add_computation(noop("A", 1, 0), ["i1:"])
                .is_err()
        );
        assert!(
            Topology::builder()
                .add_computation(noop("A", 1, 0), ["i1:a", "i1:b"])
                .is_err()
        );
        let twice = Topology::builder()
            .add_computation(noop("A", 1, 0), ["i1:a"])
            .unwrap()
            .add_computation(noop("A", 1, 0), ["i1:b"]);
        assert!(twice.is_err());
    }

    #[test]
    fn empty_topology_is_rejected() {
        assert!(Topology::builder().build().is_err());
    }
}
