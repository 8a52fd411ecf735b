//! UNet Graph Description
//!
//! A symmetric encoder-decoder is described as an arena of nodes, each node
//! holding a [`Layer`] and the ids of the nodes it reads from. Nodes are only
//! ever appended after their inputs, so arena order is a valid evaluation
//! order. The description carries no parameters; see
//! [`crate::models::unet_2d::UNet`] for binding it to trainable weights.
//!
//! ```text
//!   input
//!     |
//!   down 0 ---------------------------------- skip 0 --> up n-1 --> projection
//!     |                                                    ^
//!   down 1 ------------------------- skip 1 --> up n-2 ---/
//!     .                                            ^
//!   down n-1 -- skip n-1 --> up 0 ----------------/
//!     |                       ^
//!   bottleneck --------------/
//! ```
use crate::error::{config_error, Result};
use std::fmt::Write;

/// Spatial factor of the halving and doubling layers.
pub const SPATIAL_FACTOR: i64 = 2;

/// Index of a node in a [`NetworkGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Per-sample output shape of a node, channels first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shape {
    pub channels: i64,
    pub height: i64,
    pub width: i64,
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.channels, self.height, self.width)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    Tanh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Input(Shape),
    /// Stride 1 convolution with "same" padding.
    Conv2D { out_channels: i64, kernel_size: i64, activation: Activation },
    MaxPool2D { factor: i64 },
    /// Nearest neighbour upsampling.
    Upsample2D { factor: i64 },
    /// Channel-wise concatenation.
    Concat,
    Output,
}

impl Layer {
    /// Number of inputs the layer consumes.
    pub fn arity(&self) -> usize {
        match self {
            Self::Input(_) => 0,
            Self::Conv2D { .. }
            | Self::MaxPool2D { .. }
            | Self::Upsample2D { .. }
            | Self::Output => 1,
            Self::Concat => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::Conv2D { .. } => "conv2d",
            Self::MaxPool2D { .. } => "max_pool2d",
            Self::Upsample2D { .. } => "upsample2d",
            Self::Concat => "concat",
            Self::Output => "output",
        }
    }

    fn output_shape(&self, inputs: &[Shape]) -> Shape {
        match *self {
            Self::Input(shape) => shape,
            Self::Conv2D { out_channels, .. } => Shape { channels: out_channels, ..inputs[0] },
            Self::MaxPool2D { factor } => Shape {
                channels: inputs[0].channels,
                height: inputs[0].height / factor,
                width: inputs[0].width / factor,
            },
            Self::Upsample2D { factor } => Shape {
                channels: inputs[0].channels,
                height: inputs[0].height * factor,
                width: inputs[0].width * factor,
            },
            Self::Concat => {
                let (a, b) = (inputs[0], inputs[1]);
                assert_eq!(
                    (a.height, a.width),
                    (b.height, b.width),
                    "concatenating tensors of different spatial sizes"
                );
                Shape { channels: a.channels + b.channels, ..a }
            }
            Self::Output => inputs[0],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub layer: Layer,
    pub inputs: Vec<NodeId>,
    pub shape: Shape,
}

impl Node {
    /// Trainable parameter count, weights and biases.
    pub fn num_parameters(&self, input_shapes: &[Shape]) -> i64 {
        match self.layer {
            Layer::Conv2D { out_channels, kernel_size, .. } => {
                let in_channels = input_shapes[0].channels;
                out_channels * in_channels * kernel_size * kernel_size + out_channels
            }
            _ => 0,
        }
    }
}

/// Accumulates nodes; handed over complete as a [`NetworkGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, layer: Layer, inputs: &[NodeId]) -> NodeId {
        assert_eq!(layer.arity(), inputs.len(), "wrong number of inputs for {}", layer.name());
        let input_shapes: Vec<Shape> = inputs
            .iter()
            .map(|id| {
                assert!(id.0 < self.nodes.len(), "node {} does not exist yet", id.0);
                self.nodes[id.0].shape
            })
            .collect();
        let shape = layer.output_shape(&input_shapes);
        self.nodes.push(Node { layer, inputs: inputs.to_vec(), shape });
        NodeId(self.nodes.len() - 1)
    }

    pub fn shape(&self, id: NodeId) -> Shape {
        self.nodes[id.0].shape
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn conv(&mut self, xs: NodeId, out_channels: i64, kernel_size: i64) -> NodeId {
        let layer = Layer::Conv2D { out_channels, kernel_size, activation: Activation::Relu };
        self.add(layer, &[xs])
    }

    fn double_conv(&mut self, xs: NodeId, out_channels: i64, kernel_size: i64) -> NodeId {
        let xs = self.conv(xs, out_channels, kernel_size);
        self.conv(xs, out_channels, kernel_size)
    }
}

/// The outputs of one down-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipPair {
    /// Carried over to the mirrored up-block.
    pub skip: NodeId,
    /// Continues down the encoder.
    pub down: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpBlock {
    pub upsample: NodeId,
    pub skip: NodeId,
    pub concat: NodeId,
    pub output: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UNetConfig {
    /// Height and width of the square input images, also the filter count of
    /// the outermost blocks.
    pub img_length: i64,
    pub n_downblocks: usize,
    /// Ratio between the filter counts of two successive depths.
    pub downscale_factor: i64,
    pub in_channels: i64,
    pub out_channels: i64,
    pub kernel_size: i64,
}

impl Default for UNetConfig {
    fn default() -> Self {
        Self {
            img_length: 64,
            n_downblocks: 4,
            downscale_factor: 2,
            in_channels: 3,
            out_channels: 3,
            kernel_size: 3,
        }
    }
}

impl UNetConfig {
    pub fn new(img_length: i64, n_downblocks: usize, downscale_factor: i64) -> Self {
        Self { img_length, n_downblocks, downscale_factor, ..Default::default() }
    }

    /// Filter counts from the outermost depth to the bottleneck.
    pub fn filter_progression(&self) -> Result<Vec<i64>> {
        self.validate()?;
        Ok(filter_progression(self.img_length, self.n_downblocks, self.downscale_factor))
    }

    fn validate(&self) -> Result<()> {
        if self.img_length <= 0 {
            return config_error(format!("img_length must be positive, got {}", self.img_length));
        }
        if self.n_downblocks < 1 {
            return config_error("at least one down-block is required");
        }
        if self.downscale_factor < 2 {
            return config_error(format!(
                "downscale_factor must be at least 2, got {}",
                self.downscale_factor
            ));
        }
        if self.in_channels <= 0 || self.out_channels <= 0 {
            return config_error("channel counts must be positive");
        }
        if self.kernel_size <= 0 || self.kernel_size % 2 == 0 {
            return config_error(format!(
                "kernel_size must be odd and positive, got {}",
                self.kernel_size
            ));
        }
        // Every pooled size has to be doubled back exactly for the skip
        // concatenations to line up.
        let spatial_divisor = u32::try_from(self.n_downblocks)
            .ok()
            .and_then(|n| SPATIAL_FACTOR.checked_pow(n));
        match spatial_divisor {
            Some(d) if self.img_length % d == 0 => {}
            _ => {
                return config_error(format!(
                    "img_length {} cannot be halved {} times",
                    self.img_length, self.n_downblocks
                ))
            }
        }
        let deepest = filter_progression(self.img_length, self.n_downblocks, self.downscale_factor);
        if deepest.last().map_or(true, |&f| f < 1) {
            return config_error(format!(
                "img_length {} divided by {} {} times leaves no filters",
                self.img_length, self.downscale_factor, self.n_downblocks
            ));
        }
        Ok(())
    }
}

/// `n_downblocks + 1` filter counts, each the previous one divided by
/// `downscale_factor`.
pub(crate) fn filter_progression(
    img_length: i64,
    n_downblocks: usize,
    downscale_factor: i64,
) -> Vec<i64> {
    std::iter::successors(Some(img_length), |f| Some(f / downscale_factor))
        .take(n_downblocks + 1)
        .collect()
}

/// A fully assembled encoder-decoder.
#[derive(Debug, Clone)]
pub struct NetworkGraph {
    nodes: Vec<Node>,
    input: NodeId,
    bottleneck: NodeId,
    output: NodeId,
    filters: Vec<i64>,
    skip_down_pairs: Vec<SkipPair>,
    up_blocks: Vec<UpBlock>,
    pub config: UNetConfig,
}

/// Builds the encoder-decoder graph for square `img_length` images.
pub fn build(img_length: i64, n_downblocks: usize, downscale_factor: i64) -> Result<NetworkGraph> {
    NetworkGraph::new(UNetConfig::new(img_length, n_downblocks, downscale_factor))
}

impl NetworkGraph {
    pub fn new(config: UNetConfig) -> Result<Self> {
        let filters = config.filter_progression()?;
        let n = config.n_downblocks;
        let k = config.kernel_size;
        let mut g = GraphBuilder::new();

        let input = g.add(
            Layer::Input(Shape {
                channels: config.in_channels,
                height: config.img_length,
                width: config.img_length,
            }),
            &[],
        );

        let mut xs = input;
        let mut skip_down_pairs = Vec::with_capacity(n);
        for &n_filters in &filters[..n] {
            let skip = g.double_conv(xs, n_filters, k);
            let down = g.add(Layer::MaxPool2D { factor: SPATIAL_FACTOR }, &[skip]);
            log::debug!(
                "down-block {}: {} -> {}",
                skip_down_pairs.len(),
                g.shape(skip),
                g.shape(down)
            );
            skip_down_pairs.push(SkipPair { skip, down });
            xs = down;
        }

        let bottleneck = g.double_conv(xs, filters[n], k);
        log::debug!("bottleneck: {}", g.shape(bottleneck));

        let mut xs = bottleneck;
        let mut up_blocks = Vec::with_capacity(n);
        for i in 0..n {
            let skip = skip_down_pairs[n - 1 - i].skip;
            let upsample = g.add(Layer::Upsample2D { factor: SPATIAL_FACTOR }, &[xs]);
            let concat = g.add(Layer::Concat, &[upsample, skip]);
            let output = g.double_conv(concat, filters[n - 1 - i], k);
            log::debug!(
                "up-block {i}: {} + skip {} -> {}",
                g.shape(upsample),
                g.shape(skip),
                g.shape(output)
            );
            up_blocks.push(UpBlock { upsample, skip, concat, output });
            xs = output;
        }

        let projection = g.add(
            Layer::Conv2D {
                out_channels: config.out_channels,
                kernel_size: k,
                activation: Activation::Tanh,
            },
            &[xs],
        );
        let output = g.add(Layer::Output, &[projection]);

        assert_eq!(
            filters.len() - 1,
            skip_down_pairs.len(),
            "down-blocks do not match the filter progression"
        );
        assert_eq!(
            skip_down_pairs.len(),
            up_blocks.len(),
            "down-blocks and up-blocks are not symmetric"
        );

        let graph = Self {
            nodes: g.nodes,
            input,
            bottleneck,
            output,
            filters,
            skip_down_pairs,
            up_blocks,
            config,
        };
        log::info!(
            "unet graph: {} nodes, filters {:?}, {} parameters",
            graph.nodes.len(),
            graph.filters,
            graph.num_parameters()
        );
        Ok(graph)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn input(&self) -> NodeId {
        self.input
    }

    pub fn bottleneck(&self) -> NodeId {
        self.bottleneck
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn filters(&self) -> &[i64] {
        &self.filters
    }

    /// One pair per down-block, in construction order.
    pub fn skip_down_pairs(&self) -> &[SkipPair] {
        &self.skip_down_pairs
    }

    /// Up-block `i` consumes `skip_down_pairs()[n - 1 - i].skip`.
    pub fn up_blocks(&self) -> &[UpBlock] {
        &self.up_blocks
    }

    pub fn input_shapes(&self, id: NodeId) -> Vec<Shape> {
        self.nodes[id.0].inputs.iter().map(|i| self.nodes[i.0].shape).collect()
    }

    pub fn num_parameters(&self) -> i64 {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| node.num_parameters(&self.input_shapes(NodeId(i))))
            .sum()
    }

    /// For each node, the index of the last node reading its output. Nodes
    /// nobody reads map to themselves.
    pub fn last_uses(&self) -> Vec<usize> {
        let mut last_uses: Vec<usize> = (0..self.nodes.len()).collect();
        for (i, node) in self.nodes.iter().enumerate() {
            for input in node.inputs.iter() {
                last_uses[input.0] = last_uses[input.0].max(i);
            }
        }
        last_uses
    }

    /// A layer by layer table of the graph.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(
            s,
            "{:<5} {:<12} {:<18} {:<10} {:>10}",
            "id", "layer", "output shape", "inputs", "params"
        );
        for (i, node) in self.nodes.iter().enumerate() {
            let inputs: Vec<String> = node.inputs.iter().map(|id| id.0.to_string()).collect();
            let params = node.num_parameters(&self.input_shapes(NodeId(i)));
            let _ = writeln!(
                s,
                "{:<5} {:<12} {:<18} {:<10} {:>10}",
                i,
                node.layer.name(),
                node.shape.to_string(),
                inputs.join(","),
                params
            );
        }
        let _ = writeln!(s, "total parameters: {}", self.num_parameters());
        s
    }
}
