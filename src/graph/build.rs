use std::collections::HashMap;
use std::fmt::Write as _;

use smallvec::SmallVec;

use crate::foundation::core::{Extent, Fps, FrameRange};
use crate::foundation::error::GraphError;
use crate::graph::composition::Composition;
use crate::graph::scheduler::DagScheduler;
use crate::ops::{Operation, OperationRegistry};
use crate::texture::TextureDesc;

/// Index of a node in a built [`Graph`].
///
/// Sources occupy `0..source_count`, operations follow in declaration order. This is also the
/// index of the node's slot in the render pipeline's per-frame arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Position in node arrays.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// External input node.
#[derive(Clone, Debug)]
pub struct SourceNode {
    /// Declared id.
    pub id: String,
    /// Texture description every frame's input must match.
    pub desc: TextureDesc,
}

/// Operation node with resolved wiring.
#[derive(Clone, Debug)]
pub struct OpNode {
    /// Configured operation.
    pub op: Operation,
    /// Producer of each input, by input index.
    pub inputs: SmallVec<[NodeId; 2]>,
    /// Resolved output description.
    pub output: TextureDesc,
}

/// Validated, immutable operation graph with a fixed execution order.
///
/// Safe to share across threads; render pipelines only read it.
#[derive(Clone, Debug)]
pub struct Graph {
    fps: Fps,
    duration: u64,
    sources: Vec<SourceNode>,
    ops: Vec<OpNode>,
    order: Vec<NodeId>,
    output: NodeId,
    consumers: Vec<u32>,
}

impl Graph {
    /// Validate a composition and compute its execution order.
    ///
    /// Ties between ready operations are broken by declaration order. Nothing is returned on
    /// failure.
    #[tracing::instrument(
        skip(composition, registry),
        fields(ops = composition.def().operations.len())
    )]
    pub fn build(
        composition: &Composition,
        registry: &OperationRegistry,
    ) -> Result<Self, GraphError> {
        let def = composition.def();
        if def.operations.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index: HashMap<&str, NodeId> = HashMap::new();
        let mut sources = Vec::with_capacity(def.sources.len());
        for s in &def.sources {
            let id = NodeId(index.len() as u32);
            if index.insert(s.id.as_str(), id).is_some() {
                return Err(GraphError::DuplicateId(s.id.clone()));
            }
            let desc = TextureDesc {
                extent: Extent::new(s.width, s.height),
                format: s.format,
            };
            if desc.extent.is_empty() {
                return Err(GraphError::InvalidSource {
                    source_id: s.id.clone(),
                    reason: format!("size {} is empty", desc.extent),
                });
            }
            if desc.extent.is_oversized() {
                return Err(GraphError::InvalidSource {
                    source_id: s.id.clone(),
                    reason: format!(
                        "size {} exceeds the {} pixel limit per side",
                        desc.extent,
                        Extent::MAX_SIDE
                    ),
                });
            }
            sources.push(SourceNode {
                id: s.id.clone(),
                desc,
            });
        }

        let source_count = sources.len();
        let mut ops = Vec::with_capacity(def.operations.len());
        for o in &def.operations {
            let id = NodeId(index.len() as u32);
            if index.insert(o.id.as_str(), id).is_some() {
                return Err(GraphError::DuplicateId(o.id.clone()));
            }
            let kind = registry
                .get(&o.kind)
                .ok_or_else(|| GraphError::UnknownOperation {
                    op: o.id.clone(),
                    kind: o.kind.clone(),
                })?;
            ops.push(Operation::new(o.id.clone(), kind, &o.params)?);
        }

        let output = match index.get(def.output.as_str()) {
            Some(&id) if id.index() >= source_count => id,
            _ => return Err(GraphError::MissingOutput(def.output.clone())),
        };

        let mut wiring: Vec<Vec<Option<NodeId>>> =
            ops.iter().map(|op| vec![None; op.arity()]).collect();
        for e in &def.edges {
            let from = *index
                .get(e.from.as_str())
                .ok_or_else(|| GraphError::UnknownNode(e.from.clone()))?;
            let to = *index
                .get(e.to.as_str())
                .ok_or_else(|| GraphError::UnknownNode(e.to.clone()))?;
            let Some(oi) = to.index().checked_sub(source_count) else {
                // Sources take no inputs.
                return Err(GraphError::ArityMismatch {
                    op: e.to.clone(),
                    expected: 0,
                    got: e.input,
                });
            };
            let slots = &mut wiring[oi];
            let Some(slot) = slots.get_mut(e.input) else {
                return Err(GraphError::ArityMismatch {
                    op: e.to.clone(),
                    expected: ops[oi].arity(),
                    got: e.input,
                });
            };
            if slot.is_some() {
                return Err(GraphError::DuplicateInput {
                    op: e.to.clone(),
                    input: e.input,
                });
            }
            *slot = Some(from);
        }

        let mut inputs: Vec<SmallVec<[NodeId; 2]>> = Vec::with_capacity(ops.len());
        for (oi, slots) in wiring.into_iter().enumerate() {
            let mut resolved = SmallVec::new();
            for (input, slot) in slots.into_iter().enumerate() {
                let Some(from) = slot else {
                    return Err(GraphError::UnconnectedInput {
                        op: ops[oi].id().to_owned(),
                        input,
                    });
                };
                resolved.push(from);
            }
            inputs.push(resolved);
        }

        let deps: Vec<Vec<u32>> = inputs
            .iter()
            .map(|ins| {
                ins.iter()
                    .filter_map(|n| n.index().checked_sub(source_count))
                    .map(|i| i as u32)
                    .collect()
            })
            .collect();
        let op_order = DagScheduler::new(&deps).into_order().map_err(|stuck| {
            GraphError::CycleDetected {
                ops: stuck
                    .iter()
                    .map(|&i| ops[i as usize].id().to_owned())
                    .collect(),
            }
        })?;

        let node_count = source_count + ops.len();
        let mut descs: Vec<Option<TextureDesc>> = vec![None; node_count];
        for (i, s) in sources.iter().enumerate() {
            descs[i] = Some(s.desc);
        }
        let mut outputs: Vec<Option<TextureDesc>> = vec![None; ops.len()];
        for &oi in &op_order {
            let oi = oi as usize;
            // Producers precede consumers in `op_order`, so every input is resolved here.
            let in_descs: SmallVec<[TextureDesc; 2]> = inputs[oi]
                .iter()
                .filter_map(|n| descs[n.index()])
                .collect();
            let out = ops[oi].configure(&in_descs)?;
            descs[source_count + oi] = Some(out);
            outputs[oi] = Some(out);
        }

        let mut consumers = vec![0u32; node_count];
        for ins in &inputs {
            for n in ins {
                consumers[n.index()] = consumers[n.index()].saturating_add(1);
            }
        }
        consumers[output.index()] = consumers[output.index()].saturating_add(1);

        let op_nodes: Vec<OpNode> = ops
            .into_iter()
            .zip(inputs)
            .zip(outputs)
            .filter_map(|((op, inputs), output)| Some(OpNode { op, inputs, output: output? }))
            .collect();

        let order = op_order
            .into_iter()
            .map(|i| NodeId(source_count as u32 + i))
            .collect();

        tracing::info!(
            sources = source_count,
            ops = op_nodes.len(),
            output = %def.output,
            "graph built"
        );

        Ok(Self {
            fps: def.fps,
            duration: def.duration,
            sources,
            ops: op_nodes,
            order,
            output,
            consumers,
        })
    }

    /// Frame rate of the timeline.
    pub fn fps(&self) -> Fps {
        self.fps
    }

    /// Timeline length in frames.
    pub fn duration_frames(&self) -> u64 {
        self.duration
    }

    /// Frames `[0, duration)`.
    pub fn frame_range(&self) -> FrameRange {
        FrameRange::from_len(self.duration)
    }

    /// Source nodes in declaration order.
    pub fn sources(&self) -> &[SourceNode] {
        &self.sources
    }

    /// Operation nodes in declaration order.
    pub fn ops(&self) -> &[OpNode] {
        &self.ops
    }

    /// Operation node ids in execution order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// The output node.
    pub fn output(&self) -> NodeId {
        self.output
    }

    /// Description of the final frame texture.
    pub fn output_desc(&self) -> TextureDesc {
        self.desc(self.output)
    }

    /// Total number of nodes (sources plus operations).
    pub fn node_count(&self) -> usize {
        self.sources.len() + self.ops.len()
    }

    /// `Some(op)` when `id` names an operation.
    pub fn op(&self, id: NodeId) -> Option<&OpNode> {
        self.ops.get(id.index().checked_sub(self.sources.len())?)
    }

    /// `true` when `id` names a source.
    pub fn is_source(&self, id: NodeId) -> bool {
        id.index() < self.sources.len()
    }

    /// Texture description produced at `id`.
    pub fn desc(&self, id: NodeId) -> TextureDesc {
        match self.op(id) {
            Some(op) => op.output,
            None => self.sources[id.index()].desc,
        }
    }

    /// Declared id of a node.
    pub fn node_name(&self, id: NodeId) -> &str {
        match self.op(id) {
            Some(op) => op.op.id(),
            None => &self.sources[id.index()].id,
        }
    }

    /// Resolve a declared id.
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        if let Some(i) = self.sources.iter().position(|s| s.id == name) {
            return Some(NodeId(i as u32));
        }
        self.ops
            .iter()
            .position(|o| o.op.id() == name)
            .map(|i| NodeId((self.sources.len() + i) as u32))
    }

    /// Number of reads of `id`'s texture per frame (fan-out, plus one for the output).
    pub fn consumer_count(&self, id: NodeId) -> u32 {
        self.consumers[id.index()]
    }

    /// Deterministic human-readable listing of the execution plan.
    pub fn dump(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(
            &mut s,
            "graph fps={}/{} duration={} nodes={}",
            self.fps.num,
            self.fps.den,
            self.duration,
            self.node_count()
        );
        for (i, src) in self.sources.iter().enumerate() {
            let _ = writeln!(
                &mut s,
                "source n{i} '{}' {} consumers={}",
                src.id, src.desc, self.consumers[i]
            );
        }
        for (step, &id) in self.order.iter().enumerate() {
            let Some(node) = self.op(id) else {
                continue;
            };
            let ins: Vec<String> = node.inputs.iter().map(|n| format!("n{}", n.0)).collect();
            let _ = writeln!(
                &mut s,
                "step {step} n{} '{}' kind={} in=[{}] out={} consumers={}",
                id.0,
                node.op.id(),
                node.op.kind().name,
                ins.join(","),
                node.output,
                self.consumers[id.index()]
            );
        }
        let _ = writeln!(&mut s, "output n{}", self.output.0);
        s
    }
}

#[cfg(test)]
#[path = "../../tests/unit/graph/build.rs"]
mod tests;
