use super::{BackwardContext, BuildContext, ForwardContext, Layer, LayerDescriptor, LayerInfo};
use crate::{
    optimizer::{Parameter, ParameterKind},
    tensor::{Shape4, Tensor4D},
};
use anyhow::{ensure, Result};
use serde::Deserialize;

const MOMENTUM: f32 = 0.99;
const EPSILON: f32 = 1e-5;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchNormParams {}

pub(super) fn build(
    descriptor: &LayerDescriptor,
    context: &mut BuildContext,
) -> Result<Box<dyn Layer>> {
    let BatchNormParams {} = descriptor.params()?;
    let channels = context.input.channels;
    Ok(Box::new(BatchNorm {
        info: context.info(),
        scale: Parameter::from_elem("scale", ParameterKind::Norm, channels, 1.),
        bias: Parameter::from_elem("bias", ParameterKind::Norm, channels, 0.),
        rolling_mean: Parameter::from_elem("rolling_mean", ParameterKind::Statistic, channels, 0.),
        rolling_variance: Parameter::from_elem(
            "rolling_variance",
            ParameterKind::Statistic,
            channels,
            1.,
        ),
        output: context.tensor(context.input)?,
        x_hat: Vec::new(),
        inv_std: Vec::new(),
        batch_stats: false,
    }))
}

/// Per channel batch normalization with a learned scale and bias.
///
/// Training normalizes with the statistics of the batch and folds them into rolling
/// statistics. Inference, or training with frozen normalization, uses the rolling statistics.
#[derive(Debug)]
pub struct BatchNorm {
    info: LayerInfo,
    scale: Parameter,
    bias: Parameter,
    rolling_mean: Parameter,
    rolling_variance: Parameter,
    output: Tensor4D,
    x_hat: Vec<f32>,
    inv_std: Vec<f32>,
    batch_stats: bool,
}

impl BatchNorm {
    pub fn rolling_mean(&self) -> &Parameter {
        &self.rolling_mean
    }
    pub fn rolling_variance(&self) -> &Parameter {
        &self.rolling_variance
    }
}

fn channel_sums(tensor: &Tensor4D, data: &[f32], channels: usize) -> Vec<f32> {
    let mut sums = vec![0.; channels];
    for (i, x) in data.iter().enumerate() {
        sums[tensor.channel_of(i)] += x;
    }
    sums
}

impl Layer for BatchNorm {
    fn info(&self) -> &LayerInfo {
        &self.info
    }
    fn output(&self) -> &Tensor4D {
        &self.output
    }
    fn output_shape(&self, input: Shape4) -> Result<Shape4> {
        ensure!(
            input.channels == self.scale.len(),
            "batchnorm has {} channels, input is {input}!",
            self.scale.len()
        );
        Ok(input)
    }
    fn forward(&mut self, context: &mut ForwardContext) -> Result<()> {
        let input_tensor = context.input;
        let shape = self.output_shape(input_tensor.shape())?;
        self.output.ensure_shape(shape, input_tensor.layout())?;
        let x = input_tensor.host()?;
        let channels = shape.channels;
        let m = (shape.batch * shape.spatial()).max(1) as f32;
        self.batch_stats = context.training && !context.freeze.norm;
        let (mean, variance) = if self.batch_stats {
            let mean: Vec<f32> = channel_sums(input_tensor, x, channels)
                .into_iter()
                .map(|s| s / m)
                .collect();
            let mut variance = vec![0.; channels];
            for (i, x) in x.iter().enumerate() {
                let c = input_tensor.channel_of(i);
                variance[c] += (x - mean[c]).powi(2);
            }
            variance.iter_mut().for_each(|v| *v /= m);
            let rolling_mean = self.rolling_mean.value_mut();
            let rolling_variance = self.rolling_variance.value_mut();
            for c in 0..channels {
                rolling_mean[c] = MOMENTUM * rolling_mean[c] + (1. - MOMENTUM) * mean[c];
                rolling_variance[c] =
                    MOMENTUM * rolling_variance[c] + (1. - MOMENTUM) * variance[c];
            }
            (mean, variance)
        } else {
            (
                self.rolling_mean.value().to_vec(),
                self.rolling_variance.value().to_vec(),
            )
        };
        self.inv_std = variance.iter().map(|v| (v + EPSILON).sqrt().recip()).collect();
        self.x_hat.clear();
        self.x_hat.extend(x.iter().enumerate().map(|(i, x)| {
            let c = input_tensor.channel_of(i);
            (x - mean[c]) * self.inv_std[c]
        }));
        let scale = self.scale.value();
        let bias = self.bias.value();
        let output = self.output.host_mut()?;
        for (i, (y, x_hat)) in output.iter_mut().zip(self.x_hat.iter()).enumerate() {
            let c = input_tensor.channel_of(i);
            *y = scale[c] * x_hat + bias[c];
        }
        Ok(())
    }
    fn backward(&mut self, context: &mut BackwardContext) -> Result<()> {
        let output_gradient = context.output_gradient;
        let dy = output_gradient.host()?;
        ensure!(
            dy.len() == self.x_hat.len(),
            "batchnorm backward without matching forward!"
        );
        let shape = self.output.shape();
        let channels = shape.channels;
        let m = (shape.batch * shape.spatial()).max(1) as f32;
        let sum_dy = channel_sums(output_gradient, dy, channels);
        let mut sum_dy_x_hat = vec![0.; channels];
        for (i, (dy, x_hat)) in dy.iter().zip(self.x_hat.iter()).enumerate() {
            sum_dy_x_hat[output_gradient.channel_of(i)] += dy * x_hat;
        }
        if !context.freeze.norm {
            for c in 0..channels {
                self.bias.grad_mut()[c] += sum_dy[c];
                self.scale.grad_mut()[c] += sum_dy_x_hat[c];
            }
        }
        if let Some(dx) = context.input_gradient.as_deref_mut() {
            let scale = self.scale.value();
            let dx = dx.host_mut()?;
            for (i, ((dx, dy), x_hat)) in dx.iter_mut().zip(dy).zip(self.x_hat.iter()).enumerate()
            {
                let c = output_gradient.channel_of(i);
                let k = scale[c] * self.inv_std[c];
                *dx = if self.batch_stats {
                    k * (dy - sum_dy[c] / m - x_hat * sum_dy_x_hat[c] / m)
                } else {
                    k * dy
                };
            }
        }
        Ok(())
    }
    fn parameters(&self) -> Vec<&Parameter> {
        vec![
            &self.scale,
            &self.bias,
            &self.rolling_mean,
            &self.rolling_variance,
        ]
    }
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        vec![
            &mut self.scale,
            &mut self.bias,
            &mut self.rolling_mean,
            &mut self.rolling_variance,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layer::{tests as harness, FreezeFlags, ForwardContext, LayerRegistry},
        tensor::{DataLayout, Precision},
        workspace::Workspace,
    };
    use approx::assert_abs_diff_eq;
    use krnl::device::Device;

    fn layer(shape: Shape4, layout: DataLayout) -> Box<dyn Layer> {
        harness::build(
            &LayerRegistry::with_builtins(),
            &LayerDescriptor::new("batchnorm"),
            shape,
            layout,
            &[],
        )
        .unwrap()
    }

    fn input(layout: DataLayout) -> Tensor4D {
        let shape = Shape4::new(2, 2, 3, 1);
        let data = (0..shape.len()).map(|x| (x * x) as f32 * 0.25 - 1.).collect();
        Tensor4D::from_vec(shape, layout, Precision::Fp32, data).unwrap()
    }

    fn run(layer: &mut dyn Layer, input: &Tensor4D, training: bool, freeze: FreezeFlags) {
        let mut workspace = Workspace::new(Device::host());
        let mut loss = 0.;
        layer
            .forward(&mut ForwardContext {
                training,
                freeze,
                input,
                max_truths: 0,
                truths: &[],
                workspace: &mut workspace,
                loss: &mut loss,
            })
            .unwrap();
    }

    #[test]
    fn normalizes_per_channel() -> Result<()> {
        for layout in [DataLayout::Nchw, DataLayout::Nhwc] {
            let input = input(layout);
            let mut layer = layer(input.shape(), layout);
            harness::forward(layer.as_mut(), &input, &[], 0)?;
            let output = layer.output();
            let y = output.host()?;
            for c in 0..2 {
                let values: Vec<f32> = (0..y.len())
                    .filter(|i| output.channel_of(*i) == c)
                    .map(|i| y[i])
                    .collect();
                let mean = values.iter().sum::<f32>() / 6.;
                let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / 6.;
                assert_abs_diff_eq!(mean, 0., epsilon = 1e-5);
                assert_abs_diff_eq!(variance, 1., epsilon = 1e-3);
            }
            let rolling_mean = layer.parameters()[2].value().to_vec();
            assert!(rolling_mean.iter().all(|x| *x != 0.));
        }
        Ok(())
    }

    #[test]
    fn inference_uses_rolling_stats() -> Result<()> {
        let input = input(DataLayout::Nchw);
        let mut layer = layer(input.shape(), DataLayout::Nchw);
        run(layer.as_mut(), &input, false, FreezeFlags::default());
        for (y, x) in layer.output().host()?.iter().zip(input.host()?) {
            assert_abs_diff_eq!(*y, x / (1. + EPSILON).sqrt(), epsilon = 1e-6);
        }
        let frozen = FreezeFlags {
            norm: true,
            ..FreezeFlags::default()
        };
        run(layer.as_mut(), &input, true, frozen);
        assert!(layer.parameters()[2].value().iter().all(|x| *x == 0.));
        assert!(layer.parameters()[3].value().iter().all(|x| *x == 1.));
        Ok(())
    }

    #[test]
    fn input_gradient() -> Result<()> {
        let layout = DataLayout::Nhwc;
        let input = input(layout);
        let mut layer = layer(input.shape(), layout);
        layer.parameters_mut()[0].value_mut()[1] = 2.;
        let weights: Vec<f32> = (0..input.len()).map(|x| (x % 5) as f32 - 2.).collect();
        let dy = Tensor4D::from_vec(input.shape(), layout, Precision::Fp32, weights.clone())?;
        harness::forward(layer.as_mut(), &input, &[], 0)?;
        let dx = harness::backward(layer.as_mut(), &input, &dy, FreezeFlags::default())?;
        let eps = 1e-2;
        let mut loss = |i: usize, delta: f32| {
            let mut x = input.host().unwrap().to_vec();
            x[i] += delta;
            let x = Tensor4D::from_vec(input.shape(), layout, Precision::Fp32, x).unwrap();
            harness::forward(layer.as_mut(), &x, &[], 0).unwrap();
            let y = layer.output().host().unwrap();
            y.iter().zip(&weights).map(|(y, w)| y * w).sum::<f32>()
        };
        for i in 0..input.len() {
            let numeric = (loss(i, eps) - loss(i, -eps)) / (2. * eps);
            assert_abs_diff_eq!(dx.host()?[i], numeric, epsilon = 2e-2);
        }
        Ok(())
    }
}
