/*!
# **convgraph**
Layer graph execution and training for convolutional detection networks.

A [`NetworkGraph`](network::NetworkGraph) is built from a
[`NetworkDefinition`](network::NetworkDefinition) and a [`TrainConfig`](config::TrainConfig). It
owns an ordered list of [layers](layer::Layer), the network input, the truth buffer and a growth
only [`Workspace`](workspace::Workspace) on a krnl [`Device`]. The [`Trainer`](train::Trainer)
drives the graph through forward, backward and update, accumulating subdivisions, scheduling the
learning rate, writing checkpoints and resizing the input.

```no_run
# use convgraph::{config::TrainConfig, network::{NetworkDefinition, NetworkGraph}, Device};
let definition = NetworkDefinition::from_path("network.json")?;
let config = TrainConfig::from_path("train.json")?;
let mut graph = NetworkGraph::load(&definition, &config, Device::host())?;
graph.forward(false)?;
# Ok::<(), anyhow::Error>(())
```

# Errors
Fallible functions return [`anyhow::Result`]. Errors that callers may want to handle are an
[`Error`], recoverable with [`anyhow::Error::downcast_ref()`].

# Features
- "device": Enables krnl device (Vulkan) support. Layers compute on the host, tensors and the
  workspace may be placed on a device.
*/
pub mod checkpoint;
/// Training configuration.
pub mod config;
/// Ground truths and data sources.
pub mod data;
mod error;
/// Layers.
pub mod layer;
/// The layer graph.
pub mod network;
/// Parameters and SGD.
pub mod optimizer;
/// Learning rate, resize and save policies.
pub mod schedule;
/// Tensors.
pub mod tensor;
/// The training loop.
pub mod train;
/// Scratch memory.
pub mod workspace;

pub use error::{Error, Pass};
pub use krnl;
pub use krnl::device::Device;
