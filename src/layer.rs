use crate::{
    data::ObjectInfo,
    network::Anchor,
    optimizer::{Parameter, Sgd},
    tensor::{DataLayout, Precision, Shape4, Tensor4D},
    workspace::Workspace,
    Error,
};
use anyhow::Result;
use rand::{
    distributions::{Distribution, Uniform},
    rngs::StdRng,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::{self, Debug},
};

/// Activation layers.
pub mod activation;
/// Batch normalization.
pub mod batch_norm;
/// Convolution.
pub mod conv;
/// Anchor based detection head.
pub mod detection;
/// Max pooling.
pub mod pool;

use activation::ActivationKind;

/// Parameter categories excluded from training.
///
/// A frozen category still takes part in forward and backward computation, but its parameters
/// (and for normalization, its rolling statistics) are left untouched.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FreezeFlags {
    /// Convolution weights and biases.
    pub conv: bool,
    /// Normalization scales, biases and rolling statistics.
    pub norm: bool,
    /// Learned activation slopes.
    pub act: bool,
}

/// Per call state for [`Layer::forward()`].
pub struct ForwardContext<'a> {
    /// Training mode. Loss layers only compute loss and gradients when set.
    pub training: bool,
    pub freeze: FreezeFlags,
    /// The output of the previous layer, or the network input for the first layer.
    pub input: &'a Tensor4D,
    /// Truth slots per sample.
    pub max_truths: usize,
    /// `batch * max_truths` truth slots.
    pub truths: &'a [ObjectInfo],
    /// Shared scratch memory, valid for this call only.
    pub workspace: &'a mut Workspace,
    /// The batch loss accumulator.
    pub loss: &'a mut f32,
}

impl ForwardContext<'_> {
    /// The truth slots of sample `n`.
    pub fn sample_truths(&self, n: usize) -> &[ObjectInfo] {
        let start = n * self.max_truths;
        let end = (start + self.max_truths).min(self.truths.len());
        self.truths.get(start..end).unwrap_or_default()
    }
}

/// Per call state for [`Layer::backward()`].
pub struct BackwardContext<'a> {
    pub freeze: FreezeFlags,
    /// The input seen by the matching forward call.
    pub input: &'a Tensor4D,
    /// Gradient of the loss with respect to the output of the layer.
    pub output_gradient: &'a Tensor4D,
    /// Gradient of the loss with respect to the input, to be overwritten by the layer.
    ///
    /// `None` for the first layer.
    pub input_gradient: Option<&'a mut Tensor4D>,
    /// Shared scratch memory, valid for this call only.
    pub workspace: &'a mut Workspace,
}

/// Per call state for [`Layer::update()`].
#[derive(Clone, Copy, Debug)]
pub struct UpdateContext {
    /// The learning rate, already divided by `batch`.
    pub learning_rate: f32,
    /// Samples per update.
    pub batch: usize,
    pub sgd: Sgd,
    pub freeze: FreezeFlags,
}

impl UpdateContext {
    /// Updates `parameter` unless its category is frozen.
    pub fn apply(&self, parameter: &mut Parameter) {
        if !parameter.kind().is_frozen(&self.freeze) {
            self.sgd.update(parameter, self.learning_rate, self.batch);
        }
    }
}

/// Identity of a layer within a graph.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerInfo {
    /// Position in the graph, starting at 1.
    pub index: usize,
    pub name: String,
    /// The registry tag the layer was built from.
    pub kind: String,
}

/// A computational unit of a [`NetworkGraph`](crate::network::NetworkGraph).
///
/// Layers own their parameters, their output and whatever they cache for backward. Scratch
/// memory is only available through the context of a call.
pub trait Layer: Send {
    fn info(&self) -> &LayerInfo;
    /// Position in the graph, starting at 1.
    fn index(&self) -> usize {
        self.info().index
    }
    fn name(&self) -> &str {
        &self.info().name
    }
    fn kind(&self) -> &str {
        &self.info().kind
    }
    /// The output of the last forward call.
    fn output(&self) -> &Tensor4D;
    /// The output shape for an input of `input`.
    ///
    /// **Errors**
    ///
    /// If the layer cannot accept `input`.
    fn output_shape(&self, input: Shape4) -> Result<Shape4>;
    /// Computes the output from `context.input`.
    fn forward(&mut self, context: &mut ForwardContext) -> Result<()>;
    /// Accumulates parameter gradients and computes the input gradient.
    fn backward(&mut self, context: &mut BackwardContext) -> Result<()>;
    /// Applies accumulated gradients and clears them.
    fn update(&mut self, context: &UpdateContext) -> Result<()> {
        for parameter in self.parameters_mut() {
            context.apply(parameter);
        }
        Ok(())
    }
    /// Learned parameters and tracked statistics, in a stable order.
    fn parameters(&self) -> Vec<&Parameter> {
        Vec::new()
    }
    /// Mutable references to [`.parameters()`](Self::parameters()).
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        Vec::new()
    }
    /// Whether the layer adds to the batch loss.
    fn is_loss(&self) -> bool {
        false
    }
}

impl Debug for dyn Layer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Layer")
            .field("index", &self.index())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("output", &self.output().shape())
            .finish()
    }
}

/// A layer entry of a network definition.
///
/// Fields other than `kind` and `name` are interpreted by the builder registered for `kind`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerDescriptor {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl LayerDescriptor {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            params: serde_json::Map::new(),
        }
    }
    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }
    /// Adds a kind specific parameter.
    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
    /// Deserializes the kind specific parameters.
    ///
    /// **Errors**
    ///
    /// [`Error::Config`] if the parameters do not match `T`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.params.clone())).map_err(|e| {
            Error::config(format!(
                "layer {:?} ({}): {e}",
                self.name.as_deref().unwrap_or_default(),
                self.kind
            ))
            .into()
        })
    }
}

/// State available to a [`LayerBuilder`].
pub struct BuildContext<'a> {
    /// Position of the new layer, starting at 1.
    pub index: usize,
    pub name: String,
    /// The registry tag being built.
    pub kind: String,
    /// The output shape of the previous layer.
    pub input: Shape4,
    pub layout: DataLayout,
    pub precision: Precision,
    /// Normalized anchors of the network.
    pub anchors: &'a [Anchor],
    pub default_activation: ActivationKind,
    /// Seeded rng for parameter initialization.
    pub rng: &'a mut StdRng,
}

impl BuildContext<'_> {
    /// The [`LayerInfo`] of the new layer.
    pub fn info(&self) -> LayerInfo {
        LayerInfo {
            index: self.index,
            name: self.name.clone(),
            kind: self.kind.clone(),
        }
    }
    /// A zeroed tensor of `shape` in the network layout and precision.
    pub fn tensor(&self, shape: Shape4) -> Result<Tensor4D> {
        Tensor4D::zeros(shape, self.layout, self.precision)
    }
    /// Samples `len` weights from a He uniform distribution for `fan_in` inputs.
    pub fn he_uniform(&mut self, fan_in: usize, len: usize) -> Vec<f32> {
        let a = (6. / fan_in.max(1) as f32).sqrt();
        let dist = Uniform::new_inclusive(-a, a);
        dist.sample_iter(&mut *self.rng).take(len).collect()
    }
}

/// Constructs a layer from its descriptor.
pub type LayerBuilder = fn(&LayerDescriptor, &mut BuildContext) -> Result<Box<dyn Layer>>;

/// Layer builders keyed by kind tag.
///
/// ```
/// # use convgraph::layer::LayerRegistry;
/// let registry = LayerRegistry::with_builtins();
/// assert!(registry.contains("convolutional"));
/// ```
#[derive(Clone)]
pub struct LayerRegistry {
    builders: HashMap<String, LayerBuilder>,
}

impl LayerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }
    /// A registry with `convolutional`, `batchnorm`, `activation`, `maxpool` and `detection`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("convolutional", conv::build);
        registry.register("batchnorm", batch_norm::build);
        registry.register("activation", activation::build);
        registry.register("maxpool", pool::build);
        registry.register("detection", detection::build);
        registry
    }
    /// Adds or replaces the builder for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, builder: LayerBuilder) {
        self.builders.insert(kind.into(), builder);
    }
    pub fn contains(&self, kind: &str) -> bool {
        self.builders.contains_key(kind)
    }
    /// Builds a layer.
    ///
    /// **Errors**
    ///
    /// - [`Error::Config`] if `descriptor.kind` is not registered.
    /// - Errors from the builder.
    pub fn build(
        &self,
        descriptor: &LayerDescriptor,
        context: &mut BuildContext,
    ) -> Result<Box<dyn Layer>> {
        let builder = self.builders.get(&descriptor.kind).ok_or_else(|| {
            Error::config(format!(
                "unknown layer kind {:?} at layer {}",
                descriptor.kind, context.index
            ))
        })?;
        builder(descriptor, context)
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Debug for LayerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut kinds: Vec<_> = self.builders.keys().collect();
        kinds.sort();
        f.debug_struct("LayerRegistry").field("kinds", &kinds).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use krnl::device::Device;
    use rand::SeedableRng;

    /// Runs `layer` forward on `input` in training mode on the host.
    pub(crate) fn forward(
        layer: &mut dyn Layer,
        input: &Tensor4D,
        truths: &[ObjectInfo],
        max_truths: usize,
    ) -> Result<f32> {
        let mut workspace = Workspace::new(Device::host());
        let mut loss = 0.;
        layer.forward(&mut ForwardContext {
            training: true,
            freeze: FreezeFlags::default(),
            input,
            max_truths,
            truths,
            workspace: &mut workspace,
            loss: &mut loss,
        })?;
        Ok(loss)
    }

    /// Runs `layer` backward with `output_gradient`, returning the input gradient.
    pub(crate) fn backward(
        layer: &mut dyn Layer,
        input: &Tensor4D,
        output_gradient: &Tensor4D,
        freeze: FreezeFlags,
    ) -> Result<Tensor4D> {
        let mut workspace = Workspace::new(Device::host());
        let mut input_gradient = Tensor4D::zeros(input.shape(), input.layout(), input.precision())?;
        layer.backward(&mut BackwardContext {
            freeze,
            input,
            output_gradient,
            input_gradient: Some(&mut input_gradient),
            workspace: &mut workspace,
        })?;
        Ok(input_gradient)
    }

    pub(crate) fn build(
        registry: &LayerRegistry,
        descriptor: &LayerDescriptor,
        input: Shape4,
        layout: DataLayout,
        anchors: &[Anchor],
    ) -> Result<Box<dyn Layer>> {
        let mut rng = StdRng::seed_from_u64(0);
        let mut context = BuildContext {
            index: 1,
            name: descriptor
                .name
                .clone()
                .unwrap_or_else(|| format!("{}_1", descriptor.kind)),
            kind: descriptor.kind.clone(),
            input,
            layout,
            precision: Precision::Fp32,
            anchors,
            default_activation: ActivationKind::Leaky,
            rng: &mut rng,
        };
        registry.build(descriptor, &mut context)
    }

    #[test]
    fn unknown_kind_is_config_error() {
        let error = build(
            &LayerRegistry::with_builtins(),
            &LayerDescriptor::new("shortcut"),
            Shape4::new(1, 3, 8, 8),
            DataLayout::Nchw,
            &[],
        )
        .unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Config(_))));
    }

    #[test]
    fn unknown_param_is_config_error() {
        let descriptor = LayerDescriptor::new("maxpool").with_param("sizee", 2);
        let error = build(
            &LayerRegistry::with_builtins(),
            &descriptor,
            Shape4::new(1, 3, 8, 8),
            DataLayout::Nchw,
            &[],
        )
        .unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Config(_))));
    }

    #[test]
    fn registered_kind_replaces_builtin() -> Result<()> {
        fn identity(
            _: &LayerDescriptor,
            context: &mut BuildContext,
        ) -> Result<Box<dyn Layer>> {
            Ok(Box::new(activation::Activation::new(
                context,
                ActivationKind::Linear,
            )?))
        }
        let mut registry = LayerRegistry::new();
        registry.register("identity", identity);
        let layer = build(
            &registry,
            &LayerDescriptor::new("identity").with_name("id"),
            Shape4::new(2, 3, 4, 4),
            DataLayout::Nhwc,
            &[],
        )?;
        assert_eq!(layer.name(), "id");
        assert_eq!(layer.kind(), "identity");
        assert_eq!(layer.output().shape(), Shape4::new(2, 3, 4, 4));
        Ok(())
    }

    #[test]
    fn descriptor_from_json() -> Result<()> {
        let descriptor: LayerDescriptor = serde_json::from_str(
            r#"{"kind": "convolutional", "name": "conv1", "filters": 16, "size": 3}"#,
        )?;
        assert_eq!(descriptor.kind, "convolutional");
        assert_eq!(descriptor.name.as_deref(), Some("conv1"));
        assert_eq!(descriptor.params.len(), 2);
        Ok(())
    }
}
