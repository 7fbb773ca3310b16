use super::{BackwardContext, BuildContext, ForwardContext, Layer, LayerDescriptor, LayerInfo};
use crate::{
    optimizer::{Parameter, ParameterKind},
    tensor::{Shape4, Tensor4D},
};
use anyhow::{ensure, Result};
use derive_more::Display;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Element-wise activation functions.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    #[display(fmt = "linear")]
    Linear,
    #[display(fmt = "relu")]
    Relu,
    /// Leaky relu with a slope of 0.1.
    #[default]
    #[display(fmt = "leaky")]
    Leaky,
    #[display(fmt = "logistic")]
    Logistic,
    /// Leaky relu with a learned slope per channel.
    #[display(fmt = "prelu")]
    Prelu,
}

const LEAKY_SLOPE: f32 = 0.1;
const PRELU_INIT: f32 = 0.25;

impl ActivationKind {
    #[inline]
    fn activate(&self, x: f32) -> f32 {
        match self {
            Self::Linear => x,
            Self::Relu => x.max(0.),
            Self::Leaky | Self::Prelu => {
                if x > 0. {
                    x
                } else {
                    LEAKY_SLOPE * x
                }
            }
            Self::Logistic => logistic(x),
        }
    }
    /// The derivative at input `x` with output `y`.
    #[inline]
    fn gradient(&self, x: f32, y: f32) -> f32 {
        match self {
            Self::Linear => 1.,
            Self::Relu => (x > 0.) as u8 as f32,
            Self::Leaky | Self::Prelu => {
                if x > 0. {
                    1.
                } else {
                    LEAKY_SLOPE
                }
            }
            Self::Logistic => y * (1. - y),
        }
    }
}

#[inline]
pub(crate) fn logistic(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ActivationParams {
    #[serde(default)]
    activation: Option<ActivationKind>,
}

pub(super) fn build(
    descriptor: &LayerDescriptor,
    context: &mut BuildContext,
) -> Result<Box<dyn Layer>> {
    let params: ActivationParams = descriptor.params()?;
    let kind = params.activation.unwrap_or(context.default_activation);
    Ok(Box::new(Activation::new(context, kind)?))
}

/// An element-wise activation layer.
///
/// [`ActivationKind::Prelu`] learns one slope per channel, trained unless
/// [`FreezeFlags::act`](super::FreezeFlags::act) is set.
#[derive(Debug)]
pub struct Activation {
    info: LayerInfo,
    kind: ActivationKind,
    slope: Option<Parameter>,
    output: Tensor4D,
}

impl Activation {
    pub fn new(context: &BuildContext, kind: ActivationKind) -> Result<Self> {
        let slope = if kind == ActivationKind::Prelu {
            Some(Parameter::from_elem(
                "slope",
                ParameterKind::Activation,
                context.input.channels,
                PRELU_INIT,
            ))
        } else {
            None
        };
        Ok(Self {
            info: context.info(),
            kind,
            slope,
            output: context.tensor(context.input)?,
        })
    }
    pub fn activation(&self) -> ActivationKind {
        self.kind
    }
}

impl Layer for Activation {
    fn info(&self) -> &LayerInfo {
        &self.info
    }
    fn output(&self) -> &Tensor4D {
        &self.output
    }
    fn output_shape(&self, input: Shape4) -> Result<Shape4> {
        if let Some(slope) = self.slope.as_ref() {
            ensure!(
                input.channels == slope.len(),
                "prelu has {} slopes, input has {} channels!",
                slope.len(),
                input.channels
            );
        }
        Ok(input)
    }
    fn forward(&mut self, context: &mut ForwardContext) -> Result<()> {
        let input_tensor = context.input;
        let shape = self.output_shape(input_tensor.shape())?;
        self.output.ensure_shape(shape, input_tensor.layout())?;
        let input = input_tensor.host()?;
        let output = self.output.host_mut()?;
        if let Some(slope) = self.slope.as_ref() {
            let slope = slope.value();
            output
                .iter_mut()
                .zip(input)
                .enumerate()
                .for_each(|(i, (y, x))| {
                    *y = if *x > 0. {
                        *x
                    } else {
                        slope[input_tensor.channel_of(i)] * *x
                    };
                });
        } else {
            let kind = self.kind;
            output
                .par_iter_mut()
                .zip(input.par_iter())
                .for_each(|(y, x)| *y = kind.activate(*x));
        }
        Ok(())
    }
    fn backward(&mut self, context: &mut BackwardContext) -> Result<()> {
        let input_tensor = context.input;
        let input = input_tensor.host()?;
        let output = self.output.host()?;
        let dy = context.output_gradient.host()?;
        ensure!(
            input.len() == dy.len() && output.len() == dy.len(),
            "activation gradient {} does not match input {}!",
            context.output_gradient.shape(),
            input_tensor.shape()
        );
        if let Some(slope) = self.slope.as_mut() {
            if !context.freeze.act {
                let grad = slope.grad_mut();
                for (i, (x, dy)) in input.iter().zip(dy).enumerate() {
                    if *x <= 0. {
                        grad[input_tensor.channel_of(i)] += dy * x;
                    }
                }
            }
            if let Some(dx) = context.input_gradient.as_deref_mut() {
                let slope = slope.value();
                let dx = dx.host_mut()?;
                for (i, ((dx, x), dy)) in dx.iter_mut().zip(input).zip(dy).enumerate() {
                    *dx = if *x > 0. {
                        *dy
                    } else {
                        slope[input_tensor.channel_of(i)] * dy
                    };
                }
            }
        } else if let Some(dx) = context.input_gradient.as_deref_mut() {
            let kind = self.kind;
            dx.host_mut()?
                .par_iter_mut()
                .zip(input.par_iter().zip(output.par_iter()))
                .zip(dy.par_iter())
                .for_each(|((dx, (x, y)), dy)| *dx = dy * kind.gradient(*x, *y));
        }
        Ok(())
    }
    fn parameters(&self) -> Vec<&Parameter> {
        self.slope.iter().collect()
    }
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        self.slope.iter_mut().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layer::{tests as harness, FreezeFlags, LayerRegistry},
        tensor::{DataLayout, Precision},
    };
    use approx::assert_relative_eq;

    fn tensor(data: Vec<f32>, layout: DataLayout) -> Tensor4D {
        let shape = Shape4::new(1, 2, 2, 1);
        Tensor4D::from_vec(shape, layout, Precision::Fp32, data).unwrap()
    }

    fn layer(kind: &str, layout: DataLayout) -> Box<dyn Layer> {
        harness::build(
            &LayerRegistry::with_builtins(),
            &LayerDescriptor::new("activation").with_param("activation", kind),
            Shape4::new(1, 2, 2, 1),
            layout,
            &[],
        )
        .unwrap()
    }

    #[test]
    fn leaky_is_default() -> Result<()> {
        let mut layer = harness::build(
            &LayerRegistry::with_builtins(),
            &LayerDescriptor::new("activation"),
            Shape4::new(1, 2, 2, 1),
            DataLayout::Nchw,
            &[],
        )?;
        let input = tensor(vec![-1., 2., 0., -4.], DataLayout::Nchw);
        harness::forward(layer.as_mut(), &input, &[], 0)?;
        assert_eq!(layer.output().host()?, &[-0.1, 2., 0., -0.4]);
        Ok(())
    }

    #[test]
    fn logistic_backward() -> Result<()> {
        let mut layer = layer("logistic", DataLayout::Nchw);
        let input = tensor(vec![0., 1., -1., 2.], DataLayout::Nchw);
        harness::forward(layer.as_mut(), &input, &[], 0)?;
        assert_relative_eq!(layer.output().host()?[0], 0.5);
        let dy = tensor(vec![1., 1., 2., 0.], DataLayout::Nchw);
        let dx = harness::backward(layer.as_mut(), &input, &dy, FreezeFlags::default())?;
        let dx = dx.host()?;
        assert_relative_eq!(dx[0], 0.25);
        let y = logistic(-1.);
        assert_relative_eq!(dx[2], 2. * y * (1. - y));
        assert_eq!(dx[3], 0.);
        Ok(())
    }

    #[test]
    fn prelu_slope_per_channel() -> Result<()> {
        // NHWC, so channels alternate
        let mut layer = layer("prelu", DataLayout::Nhwc);
        assert_eq!(layer.parameters().len(), 1);
        layer.parameters_mut()[0].value_mut()[1] = 0.5;
        let input = tensor(vec![-1., -1., 3., -2.], DataLayout::Nhwc);
        harness::forward(layer.as_mut(), &input, &[], 0)?;
        assert_eq!(layer.output().host()?, &[-0.25, -0.5, 3., -1.]);
        let dy = tensor(vec![1., 1., 1., 1.], DataLayout::Nhwc);
        let dx = harness::backward(layer.as_mut(), &input, &dy, FreezeFlags::default())?;
        assert_eq!(dx.host()?, &[0.25, 0.5, 1., 0.5]);
        assert_eq!(layer.parameters()[0].grad().to_vec(), vec![-1., -3.]);
        Ok(())
    }

    #[test]
    fn prelu_frozen_keeps_slope_grad() -> Result<()> {
        let mut layer = layer("prelu", DataLayout::Nchw);
        let input = tensor(vec![-1., -1., -1., -1.], DataLayout::Nchw);
        harness::forward(layer.as_mut(), &input, &[], 0)?;
        let freeze = FreezeFlags {
            act: true,
            ..FreezeFlags::default()
        };
        harness::backward(layer.as_mut(), &input, &input, freeze)?;
        assert!(layer.parameters()[0].grad().iter().all(|x| *x == 0.));
        Ok(())
    }
}
