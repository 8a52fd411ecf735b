//! 2D UNet Denoising Model
//!
//! Binds a [`NetworkGraph`] to trainable `tch` parameters. The model takes a
//! batch of noised images `[N, C, H, W]` and predicts the residual between the
//! clean and the noised images.
use crate::models::unet_graph::{Activation, Layer, NetworkGraph, NodeId};
use tch::{nn, nn::Module, Tensor};

#[derive(Debug)]
enum UNetLayer {
    Input,
    Conv2D { conv: nn::Conv2D, activation: Activation },
    MaxPool2D { factor: i64 },
    Upsample2D { factor: i64 },
    Concat,
    Output,
}

#[derive(Debug)]
pub struct UNet {
    layers: Vec<UNetLayer>,
    inputs: Vec<Vec<NodeId>>,
    last_uses: Vec<usize>,
    output: NodeId,
}

impl UNet {
    pub fn new(vs: nn::Path, graph: &NetworkGraph) -> Self {
        let padding = graph.config.kernel_size / 2;
        let conv_cfg = nn::ConvConfig { stride: 1, padding, ..Default::default() };
        let vs_convs = &vs / "convs";
        let mut n_convs = 0usize;
        let layers = graph
            .nodes()
            .iter()
            .map(|node| match node.layer {
                Layer::Input(_) => UNetLayer::Input,
                Layer::Conv2D { out_channels, kernel_size, activation } => {
                    let in_channels = graph.node(node.inputs[0]).shape.channels;
                    let vs = &vs_convs / n_convs;
                    let conv = nn::conv2d(vs, in_channels, out_channels, kernel_size, conv_cfg);
                    n_convs += 1;
                    UNetLayer::Conv2D { conv, activation }
                }
                Layer::MaxPool2D { factor } => UNetLayer::MaxPool2D { factor },
                Layer::Upsample2D { factor } => UNetLayer::Upsample2D { factor },
                Layer::Concat => UNetLayer::Concat,
                Layer::Output => UNetLayer::Output,
            })
            .collect();
        log::debug!("unet bound to {n_convs} convolutions");
        Self {
            layers,
            inputs: graph.nodes().iter().map(|n| n.inputs.clone()).collect(),
            last_uses: graph.last_uses(),
            output: graph.output(),
        }
    }
}

fn read<'a>(outs: &'a [Option<Tensor>], id: NodeId) -> &'a Tensor {
    match &outs[id.index()] {
        Some(t) => t,
        None => panic!("node {} was released before being read", id.index()),
    }
}

impl Module for UNet {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mut outs: Vec<Option<Tensor>> = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let inputs = &self.inputs[i];
            let ys = match layer {
                UNetLayer::Input => xs.shallow_clone(),
                UNetLayer::Conv2D { conv, activation } => {
                    let ys = read(&outs, inputs[0]).apply(conv);
                    match activation {
                        Activation::Relu => ys.relu(),
                        Activation::Tanh => ys.tanh(),
                    }
                }
                UNetLayer::MaxPool2D { factor } => read(&outs, inputs[0]).max_pool2d(
                    [*factor, *factor],
                    [*factor, *factor],
                    [0, 0],
                    [1, 1],
                    false,
                ),
                UNetLayer::Upsample2D { factor } => {
                    let xs = read(&outs, inputs[0]);
                    let size = xs.size();
                    let (h, w) = (size[size.len() - 2], size[size.len() - 1]);
                    let f = *factor as f64;
                    xs.upsample_nearest2d([factor * h, factor * w], Some(f), Some(f))
                }
                UNetLayer::Concat => {
                    Tensor::cat(&[read(&outs, inputs[0]), read(&outs, inputs[1])], 1)
                }
                UNetLayer::Output => read(&outs, inputs[0]).shallow_clone(),
            };
            outs.push(Some(ys));
            // Skip tensors are only kept alive until their up-block reads them.
            for id in inputs.iter() {
                if self.last_uses[id.index()] == i {
                    outs[id.index()] = None;
                }
            }
        }
        read(&outs, self.output).shallow_clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::unet_graph::{build, NetworkGraph, UNetConfig};
    use tch::{kind, nn::OptimizerConfig, Device, Kind};

    #[test]
    fn output_matches_input_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let graph = build(32, 3, 2).unwrap();
        let unet = UNet::new(vs.root(), &graph);
        let xs = Tensor::randn([2, 3, 32, 32], kind::FLOAT_CPU);
        let ys = unet.forward(&xs);
        assert_eq!(ys.size(), vec![2, 3, 32, 32]);
        let max = ys.abs().max().double_value(&[]);
        assert!(max <= 1.);
    }

    #[test]
    fn variables_match_the_graph() {
        let vs = nn::VarStore::new(Device::Cpu);
        let graph = build(16, 2, 2).unwrap();
        let _unet = UNet::new(vs.root(), &graph);
        let n_params: i64 = vs.trainable_variables().iter().map(|t| t.numel() as i64).sum();
        assert_eq!(n_params, graph.num_parameters());
    }

    #[test]
    fn wider_kernels_keep_spatial_size() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = UNetConfig { kernel_size: 5, out_channels: 1, ..UNetConfig::new(16, 2, 2) };
        let graph = NetworkGraph::new(config).unwrap();
        let unet = UNet::new(vs.root(), &graph);
        let ys = unet.forward(&Tensor::zeros([1, 3, 16, 16], kind::FLOAT_CPU));
        assert_eq!(ys.size(), vec![1, 1, 16, 16]);
    }

    #[test]
    fn trainable() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let graph = build(8, 1, 2).unwrap();
        let unet = UNet::new(vs.root(), &graph);
        let mut opt = nn::Adam::default().build(&vs, 1e-3).unwrap();
        let xs = Tensor::randn([4, 3, 8, 8], kind::FLOAT_CPU);
        let targets = Tensor::zeros([4, 3, 8, 8], kind::FLOAT_CPU);
        let loss = |unet: &UNet| (unet.forward(&xs) - &targets).square().mean(Kind::Float);
        let initial = loss(&unet).double_value(&[]);
        for _ in 0..20 {
            opt.backward_step(&loss(&unet));
        }
        assert!(loss(&unet).double_value(&[]) < initial);
    }
}
