use crate::layer::FreezeFlags;
use ndarray::{Array1, Zip};
use serde::{Deserialize, Serialize};

/// Optimizer builders.
pub mod builder {
    use super::*;

    /// Builder for creating a [`Sgd`].
    pub struct SgdBuilder {
        momentum: f32,
        decay: f32,
    }

    impl SgdBuilder {
        pub(super) fn new() -> Self {
            Self {
                momentum: 0.,
                decay: 0.,
            }
        }
        /// Momentum. Default is 0.
        pub fn momentum(self, momentum: f32) -> Self {
            Self { momentum, ..self }
        }
        /// Weight decay, applied to weights but not to biases or scales. Default is 0.
        pub fn decay(self, decay: f32) -> Self {
            Self { decay, ..self }
        }
        /// Builds the optimizer.
        pub fn build(self) -> Sgd {
            let Self { momentum, decay } = self;
            Sgd { momentum, decay }
        }
    }
}
use builder::SgdBuilder;

/// The category of a [`Parameter`].
///
/// Each category is disabled by the matching [`FreezeFlags`] field. Statistics are saved in
/// checkpoints but never receive gradients.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Convolution weights and biases.
    Conv,
    /// Normalization scales and biases.
    Norm,
    /// Learned activation parameters.
    Activation,
    /// Running statistics (normalization rolling mean / variance).
    Statistic,
}

impl ParameterKind {
    /// Whether `freeze` disables updates for this kind.
    pub fn is_frozen(&self, freeze: &FreezeFlags) -> bool {
        match self {
            Self::Conv => freeze.conv,
            Self::Norm | Self::Statistic => freeze.norm,
            Self::Activation => freeze.act,
        }
    }
}

/// A learned (or tracked) parameter of a layer.
///
/// Gradients accumulate in `grad` across the subdivisions of a batch and are consumed by
/// [`Sgd::update()`].
#[derive(Clone, Debug)]
pub struct Parameter {
    name: &'static str,
    kind: ParameterKind,
    decay: bool,
    value: Array1<f32>,
    grad: Array1<f32>,
    velocity: Array1<f32>,
}

impl Parameter {
    /// Creates a parameter initialized with `value`.
    pub fn new(name: &'static str, kind: ParameterKind, value: Vec<f32>) -> Self {
        let len = value.len();
        let track = kind != ParameterKind::Statistic;
        Self {
            name,
            kind,
            decay: false,
            value: Array1::from(value),
            grad: Array1::zeros(if track { len } else { 0 }),
            velocity: Array1::zeros(if track { len } else { 0 }),
        }
    }
    /// Creates a parameter filled with `elem`.
    pub fn from_elem(name: &'static str, kind: ParameterKind, len: usize, elem: f32) -> Self {
        Self::new(name, kind, vec![elem; len])
    }
    /// Applies weight decay during updates.
    pub fn with_decay(self, decay: bool) -> Self {
        Self { decay, ..self }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn kind(&self) -> ParameterKind {
        self.kind
    }
    pub fn len(&self) -> usize {
        self.value.len()
    }
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
    pub fn value(&self) -> &Array1<f32> {
        &self.value
    }
    pub fn value_mut(&mut self) -> &mut Array1<f32> {
        &mut self.value
    }
    /// The accumulated gradient. Empty for [`ParameterKind::Statistic`].
    pub fn grad(&self) -> &Array1<f32> {
        &self.grad
    }
    pub fn grad_mut(&mut self) -> &mut Array1<f32> {
        &mut self.grad
    }
    /// Both value (read only) and gradient.
    pub fn value_grad_mut(&mut self) -> (&Array1<f32>, &mut Array1<f32>) {
        (&self.value, &mut self.grad)
    }
}

/// Stochastic Gradient Descent.
///
/// ```
/// # use convgraph::optimizer::Sgd;
/// let sgd = Sgd::builder()
///     .momentum(0.9)
///     .decay(0.0005)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    momentum: f32,
    decay: f32,
}

impl Sgd {
    /// A builder for creating a [`Sgd`].
    pub fn builder() -> SgdBuilder {
        SgdBuilder::new()
    }
    pub fn momentum(&self) -> f32 {
        self.momentum
    }
    pub fn decay(&self) -> f32 {
        self.decay
    }
    /// Applies the accumulated gradient of `parameter` and clears it.
    ///
    /// `learning_rate` is expected to already be divided by `batch`, the number of samples the
    /// gradient was summed over.
    pub fn update(&self, parameter: &mut Parameter, learning_rate: f32, batch: usize) {
        if parameter.kind == ParameterKind::Statistic {
            return;
        }
        let Parameter {
            decay,
            value,
            grad,
            velocity,
            ..
        } = parameter;
        if *decay && self.decay > 0. {
            grad.scaled_add(self.decay * batch as f32, &*value);
        }
        let momentum = self.momentum;
        Zip::from(&mut *velocity)
            .and(&*grad)
            .for_each(|v, g| *v = momentum * *v + *g);
        value.scaled_add(-learning_rate, &*velocity);
        grad.fill(0.);
    }
}
