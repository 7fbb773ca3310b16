use crate::{
    config::TrainConfig,
    data::{DataSource, ObjectInfo},
    layer::{
        activation::ActivationKind, BackwardContext, BuildContext, ForwardContext, FreezeFlags,
        Layer, LayerDescriptor, LayerRegistry, UpdateContext,
    },
    optimizer::Sgd,
    tensor::{DataLayout, Precision, Shape4, Tensor4D},
    workspace::Workspace,
    Error, Pass,
};
use anyhow::{Context, Result};
use krnl::device::Device;
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// A reference box shape, as a fraction of the input size.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub width: f32,
    pub height: f32,
}

impl Anchor {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
    /// Normalizes a box of `width` x `height` pixels by `reference`.
    ///
    /// Returns `None` unless both dimensions are positive.
    pub fn from_pixels(width: f32, height: f32, reference: f32) -> Option<Self> {
        if width > 0. && height > 0. {
            Some(Self::new(width / reference, height / reference))
        } else {
            None
        }
    }
}

fn default_order() -> String {
    DataLayout::Nchw.to_string()
}

fn default_type() -> String {
    Precision::Fp32.to_string()
}

fn default_channels() -> usize {
    3
}

fn default_dim() -> usize {
    416
}

fn default_reference() -> f32 {
    416.
}

/// The input block of a [`NetworkDefinition`].
///
/// Unknown `data_order` / `data_type` values fall back to NCHW / FP32 with a warning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputDefinition {
    #[serde(default = "default_order")]
    pub data_order: String,
    #[serde(default = "default_type")]
    pub data_type: String,
    #[serde(default = "default_channels")]
    pub channels: usize,
    #[serde(default = "default_dim")]
    pub width: usize,
    #[serde(default = "default_dim")]
    pub height: usize,
}

impl Default for InputDefinition {
    fn default() -> Self {
        Self {
            data_order: default_order(),
            data_type: default_type(),
            channels: default_channels(),
            width: default_dim(),
            height: default_dim(),
        }
    }
}

/// An anchor in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorDefinition {
    pub width: f32,
    pub height: f32,
}

/// A deserialized network definition.
///
/// ```
/// # use convgraph::network::NetworkDefinition;
/// let definition = NetworkDefinition::from_json(r#"{
///     "input": { "channels": 3, "width": 32, "height": 32 },
///     "anchors": [{ "width": 10, "height": 13 }],
///     "layers": [{ "kind": "convolutional", "filters": 8, "size": 3, "pad": 1 }]
/// }"#)?;
/// assert_eq!(definition.input.data_order, "NCHW");
/// # Ok::<(), anyhow::Error>(())
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDefinition {
    /// Activation of `activation` layers that do not name one.
    #[serde(default)]
    pub default_activation: ActivationKind,
    #[serde(default)]
    pub input: InputDefinition,
    /// The size anchors are normalized by.
    #[serde(default = "default_reference")]
    pub anchor_reference: f32,
    #[serde(default)]
    pub anchors: Vec<AnchorDefinition>,
    #[serde(default)]
    pub layers: Vec<LayerDescriptor>,
}

impl NetworkDefinition {
    /// Parses a definition from json.
    ///
    /// **Errors**
    ///
    /// [`Error::Config`] if the json is malformed or does not describe a network.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::config(format!("network definition: {e}")).into())
    }
    /// Reads a definition from a json file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read network definition {path:?}!"))?;
        Self::from_json(&json)
    }
}

/// Waits for queued device work, so the next layer sees finished results.
fn sync(device: &Device) -> Result<()> {
    if !device.is_host() {
        device.wait()?;
    }
    Ok(())
}

fn pass_error(pass: Pass, layer: &dyn Layer, source: anyhow::Error) -> anyhow::Error {
    tracing::error!(
        %pass,
        index = layer.index(),
        name = layer.name(),
        "layer failed: {source:#}"
    );
    Error::pass(pass, layer.index(), layer.name(), source).into()
}

/// An ordered graph of layers with its input, truths and shared workspace.
///
/// Layer `i` consumes the output of layer `i - 1`, the first layer consumes the network input.
/// Passes take `&mut self`, so the workspace and the loss accumulator are never shared between
/// passes.
pub struct NetworkGraph {
    device: Device,
    layout: DataLayout,
    precision: Precision,
    layers: Vec<Box<dyn Layer>>,
    deltas: Vec<Tensor4D>,
    anchors: Vec<Anchor>,
    input: Tensor4D,
    truths: Vec<ObjectInfo>,
    max_truths: usize,
    batch: usize,
    freeze: FreezeFlags,
    sgd: Sgd,
    workspace: Workspace,
    loss: f32,
}

impl NetworkGraph {
    /// Builds the graph with the built-in layer kinds.
    ///
    /// See [`.load_with_registry()`](Self::load_with_registry).
    pub fn load(
        definition: &NetworkDefinition,
        config: &TrainConfig,
        device: Device,
    ) -> Result<Self> {
        Self::load_with_registry(definition, config, device, &LayerRegistry::with_builtins())
    }
    /// Builds the graph.
    ///
    /// The input is `config.mini_batch` x `channels` x `width` x `height` and the truth buffer
    /// holds `config.max_truths` slots per sample. Anchors that are not strictly positive are
    /// dropped.
    ///
    /// **Errors**
    ///
    /// - [`Error::Config`] if the input block is malformed, or a layer cannot be built.
    /// - [`Error::Allocation`] if a tensor cannot be allocated.
    pub fn load_with_registry(
        definition: &NetworkDefinition,
        config: &TrainConfig,
        device: Device,
        registry: &LayerRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let input_def = &definition.input;
        let layout = DataLayout::parse(&input_def.data_order).unwrap_or_else(|| {
            tracing::warn!(
                data_order = %input_def.data_order,
                "unknown data order, using {}",
                DataLayout::default()
            );
            DataLayout::default()
        });
        let precision = Precision::parse(&input_def.data_type).unwrap_or_else(|| {
            tracing::warn!(
                data_type = %input_def.data_type,
                "unknown data type, using {}",
                Precision::default()
            );
            Precision::default()
        });
        if input_def.channels == 0 || input_def.width == 0 || input_def.height == 0 {
            return Err(Error::config(format!(
                "malformed input block: {} channels, {}x{}",
                input_def.channels, input_def.width, input_def.height
            ))
            .into());
        }
        if !(definition.anchor_reference > 0.) {
            return Err(Error::config(format!(
                "anchor reference must be positive, found {}",
                definition.anchor_reference
            ))
            .into());
        }
        let anchors: Vec<Anchor> = definition
            .anchors
            .iter()
            .filter_map(|a| Anchor::from_pixels(a.width, a.height, definition.anchor_reference))
            .collect();
        if anchors.len() < definition.anchors.len() {
            tracing::warn!(
                dropped = definition.anchors.len() - anchors.len(),
                "dropped anchors without positive size"
            );
        }
        let shape = Shape4::new(
            config.mini_batch,
            input_def.channels,
            input_def.width,
            input_def.height,
        );
        let input = Tensor4D::zeros(shape, layout, precision)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut layers = Vec::with_capacity(definition.layers.len());
        let mut layer_input = shape;
        for (i, descriptor) in definition.layers.iter().enumerate() {
            let index = i + 1;
            let name = descriptor
                .name
                .clone()
                .unwrap_or_else(|| format!("{}_{index}", descriptor.kind));
            let mut context = BuildContext {
                index,
                name: name.clone(),
                kind: descriptor.kind.clone(),
                input: layer_input,
                layout,
                precision,
                anchors: &anchors,
                default_activation: definition.default_activation,
                rng: &mut rng,
            };
            let layer = registry.build(descriptor, &mut context).map_err(|e| {
                if e.is::<Error>() {
                    e
                } else {
                    Error::config(format!("layer {index} ({name}): {e:#}")).into()
                }
            })?;
            layer_input = layer.output().shape();
            tracing::debug!(
                index,
                %name,
                kind = %descriptor.kind,
                output = %layer_input,
                "built layer"
            );
            layers.push(layer);
        }
        let truths = vec![ObjectInfo::EMPTY; config.mini_batch * config.max_truths];
        let workspace = Workspace::new(device.clone()).with_limit(config.workspace_limit);
        let loss_layers = layers.iter().filter(|x| x.is_loss()).count();
        if loss_layers == 0 {
            tracing::warn!("network has no loss layer");
        }
        tracing::info!(
            layers = layers.len(),
            loss_layers,
            anchors = anchors.len(),
            input = %shape,
            %layout,
            %precision,
            "network loaded"
        );
        Ok(Self {
            device,
            layout,
            precision,
            layers,
            deltas: Vec::new(),
            anchors,
            input,
            truths,
            max_truths: config.max_truths,
            batch: config.batch(),
            freeze: config.freeze,
            sgd: config.sgd(),
            workspace,
            loss: 0.,
        })
    }
    /// Runs every layer in order.
    ///
    /// Resets the loss, which loss layers then add to.
    ///
    /// **Errors**
    ///
    /// [`Error::Pass`] for the first layer that fails. Later layers are not run and the loss keeps
    /// the contributions of the layers before it.
    pub fn forward(&mut self, training: bool) -> Result<()> {
        self.loss = 0.;
        let Self {
            device,
            layers,
            input,
            truths,
            max_truths,
            freeze,
            workspace,
            loss,
            ..
        } = self;
        for i in 0..layers.len() {
            let (previous, rest) = layers.split_at_mut(i);
            let layer = &mut rest[0];
            let layer_input = previous.last().map_or(&*input, |x| x.output());
            let loss_before = *loss;
            let mut context = ForwardContext {
                training,
                freeze: *freeze,
                input: layer_input,
                max_truths: *max_truths,
                truths: truths.as_slice(),
                workspace: &mut *workspace,
                loss: &mut *loss,
            };
            layer
                .forward(&mut context)
                .and_then(|()| sync(device))
                .map_err(|e| pass_error(Pass::Forward, &**layer, e))?;
            if training && layer.is_loss() {
                tracing::debug!(
                    index = layer.index(),
                    name = layer.name(),
                    loss = *loss - loss_before,
                    "layer loss"
                );
            }
        }
        Ok(())
    }
    /// Propagates gradients from the last layer to the first.
    ///
    /// Each layer writes the gradient of its input, which is the output gradient of the layer
    /// before it. The first layer is given no input gradient.
    ///
    /// **Errors**
    ///
    /// [`Error::Pass`] for the first layer that fails.
    pub fn backward(&mut self) -> Result<()> {
        let Self {
            device,
            layers,
            deltas,
            input,
            freeze,
            workspace,
            ..
        } = self;
        deltas.resize_with(layers.len(), Tensor4D::default);
        for (layer, delta) in layers.iter().zip(deltas.iter_mut()) {
            let output = layer.output();
            delta.ensure_shape(output.shape(), output.layout())?;
            delta.fill(0.)?;
        }
        for i in (0..layers.len()).rev() {
            let (previous, rest) = layers.split_at_mut(i);
            let layer = &mut rest[0];
            let layer_input = previous.last().map_or(&*input, |x| x.output());
            let (previous_deltas, rest_deltas) = deltas.split_at_mut(i);
            let mut context = BackwardContext {
                freeze: *freeze,
                input: layer_input,
                output_gradient: &rest_deltas[0],
                input_gradient: previous_deltas.last_mut(),
                workspace: &mut *workspace,
            };
            layer
                .backward(&mut context)
                .and_then(|()| sync(device))
                .map_err(|e| pass_error(Pass::Backward, &**layer, e))?;
        }
        Ok(())
    }
    /// Applies the accumulated gradients of every layer.
    ///
    /// `learning_rate` is expected to already be divided by [`.batch()`](Self::batch).
    ///
    /// **Errors**
    ///
    /// [`Error::Pass`] for the first layer that fails. Later layers are not updated.
    pub fn update(&mut self, learning_rate: f32) -> Result<()> {
        let context = UpdateContext {
            learning_rate,
            batch: self.batch,
            sgd: self.sgd,
            freeze: self.freeze,
        };
        for layer in self.layers.iter_mut() {
            layer
                .update(&context)
                .and_then(|()| sync(&self.device))
                .map_err(|e| pass_error(Pass::Update, &**layer, e))?;
        }
        Ok(())
    }
    /// Fills the input and truths from `source`.
    pub fn load_batch(&mut self, source: &mut dyn DataSource) -> Result<()> {
        source.load(&mut self.input, &mut self.truths)
    }
    /// The layer at `index`, counting from 0.
    pub fn layer(&self, index: usize) -> Option<&dyn Layer> {
        self.layers.get(index).map(Box::as_ref)
    }
    pub fn layer_mut(&mut self, index: usize) -> Option<&mut (dyn Layer + 'static)> {
        self.layers.get_mut(index).map(Box::as_mut)
    }
    /// The anchor at `index`, counting from 0.
    pub fn anchor(&self, index: usize) -> Option<Anchor> {
        self.anchors.get(index).copied()
    }
    /// Grows the workspace to at least `bytes`.
    ///
    /// See [`Workspace::reserve()`].
    pub fn update_workspace(&mut self, bytes: usize) -> Result<()> {
        self.workspace.reserve(bytes)
    }
    /// Reinitializes the input to `width` x `height`, keeping batch, channels, layout and
    /// precision.
    ///
    /// Layers adapt their outputs on the next forward pass. Parameters are untouched.
    ///
    /// **Errors**
    ///
    /// If a layer cannot accept the new size. The input is left unchanged.
    pub fn resize_input(&mut self, width: usize, height: usize) -> Result<()> {
        let shape = Shape4 {
            width,
            height,
            ..self.input.shape()
        };
        if shape.is_empty() {
            return Err(Error::config(format!("cannot resize input to {width}x{height}")).into());
        }
        let mut layer_input = shape;
        for layer in self.layers.iter() {
            layer_input = layer.output_shape(layer_input).with_context(|| {
                format!("layer {} ({}) rejects input {shape}", layer.index(), layer.name())
            })?;
        }
        tracing::info!(
            from = %self.input.shape(),
            to = %shape,
            "resizing input"
        );
        self.input
            .reinit(shape.batch, shape.channels, width, height, self.layout)
    }
    pub fn device(&self) -> &Device {
        &self.device
    }
    /// The loss of the last forward pass.
    pub fn loss(&self) -> f32 {
        self.loss
    }
    pub fn input(&self) -> &Tensor4D {
        &self.input
    }
    pub fn input_mut(&mut self) -> &mut Tensor4D {
        &mut self.input
    }
    /// The truth slots, [`.max_truths()`](Self::max_truths) per sample.
    pub fn truths(&self) -> &[ObjectInfo] {
        &self.truths
    }
    pub fn truths_mut(&mut self) -> &mut [ObjectInfo] {
        &mut self.truths
    }
    pub fn max_truths(&self) -> usize {
        self.max_truths
    }
    /// Samples per forward pass.
    pub fn mini_batch(&self) -> usize {
        self.input.batch()
    }
    /// Samples per update.
    pub fn batch(&self) -> usize {
        self.batch
    }
    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }
    /// Indices of the layers that add to the loss.
    pub fn loss_layers(&self) -> Vec<usize> {
        self.layers
            .iter()
            .filter(|layer| layer.is_loss())
            .map(|layer| layer.index())
            .collect()
    }
    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }
    pub fn layout(&self) -> DataLayout {
        self.layout
    }
    pub fn precision(&self) -> Precision {
        self.precision
    }
    pub fn freeze(&self) -> FreezeFlags {
        self.freeze
    }
    /// The workspace size in bytes.
    pub fn workspace_size(&self) -> usize {
        self.workspace.size()
    }
    /// Whether the workspace currently holds a buffer.
    pub fn has_workspace(&self) -> bool {
        self.workspace.is_allocated()
    }
    /// The number of elements of all parameters, including tracked statistics.
    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|layer| layer.parameters())
            .map(|p| p.len())
            .sum()
    }
}

impl std::fmt::Debug for NetworkGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("NetworkGraph")
            .field("device", &self.device)
            .field("layers", &self.layers)
            .field("anchors", &self.anchors)
            .field("input", &self.input)
            .field("workspace", &self.workspace)
            .finish()
    }
}
