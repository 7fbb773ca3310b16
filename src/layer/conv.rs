use super::{BackwardContext, BuildContext, ForwardContext, Layer, LayerDescriptor, LayerInfo};
use crate::{
    optimizer::{Parameter, ParameterKind},
    tensor::{DataLayout, Shape4, Tensor4D},
};
use anyhow::{ensure, Result};
use ndarray::{linalg::general_mat_mul, ArrayView2, ArrayViewMut2, Axis};
use serde::Deserialize;

fn default_one() -> usize {
    1
}

fn default_bias() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConvParams {
    filters: usize,
    #[serde(default = "default_one")]
    size: usize,
    #[serde(default = "default_one")]
    stride: usize,
    #[serde(default)]
    pad: usize,
    #[serde(default = "default_bias")]
    bias: bool,
}

pub(super) fn build(
    descriptor: &LayerDescriptor,
    context: &mut BuildContext,
) -> Result<Box<dyn Layer>> {
    let ConvParams {
        filters,
        size,
        stride,
        pad,
        bias,
    } = descriptor.params()?;
    let geometry = Geometry {
        channels: context.input.channels,
        size,
        stride,
        pad,
    };
    let shape = geometry.output_shape(filters, context.input)?;
    let rows = geometry.rows();
    let weights = Parameter::new(
        "weights",
        ParameterKind::Conv,
        context.he_uniform(rows, filters * rows),
    )
    .with_decay(true);
    let bias = if bias {
        Some(Parameter::from_elem("bias", ParameterKind::Conv, filters, 0.))
    } else {
        None
    };
    Ok(Box::new(Convolution {
        info: context.info(),
        geometry,
        filters,
        weights,
        bias,
        output: context.tensor(shape)?,
    }))
}

#[derive(Clone, Copy, Debug)]
struct Geometry {
    channels: usize,
    size: usize,
    stride: usize,
    pad: usize,
}

impl Geometry {
    /// Rows of the unrolled input, `channels * size * size`.
    fn rows(&self) -> usize {
        self.channels * self.size * self.size
    }
    fn output_shape(&self, filters: usize, input: Shape4) -> Result<Shape4> {
        let Self {
            channels,
            size,
            stride,
            pad,
        } = *self;
        ensure!(
            filters > 0 && size > 0 && stride > 0,
            "convolution filters, size and stride must be positive!"
        );
        ensure!(
            input.channels == channels,
            "convolution expects {channels} channels, input is {input}!"
        );
        ensure!(
            input.width + 2 * pad >= size && input.height + 2 * pad >= size,
            "convolution kernel {size} does not fit input {input}!"
        );
        Ok(Shape4 {
            channels: filters,
            width: (input.width + 2 * pad - size) / stride + 1,
            height: (input.height + 2 * pad - size) / stride + 1,
            ..input
        })
    }
    /// Visits each (row, column, input offset) of the unrolled sample `n`.
    ///
    /// Columns that fall into padding are skipped.
    fn for_each_tap(
        &self,
        input: Shape4,
        layout: DataLayout,
        output: Shape4,
        n: usize,
        mut f: impl FnMut(usize, usize, usize),
    ) {
        let Self {
            size, stride, pad, ..
        } = *self;
        let (in_w, in_h) = (input.width as isize, input.height as isize);
        for c in 0..self.channels {
            for ky in 0..size {
                for kx in 0..size {
                    let row = (c * size + ky) * size + kx;
                    for oy in 0..output.height {
                        let iy = (oy * stride + ky) as isize - pad as isize;
                        if iy < 0 || iy >= in_h {
                            continue;
                        }
                        for ox in 0..output.width {
                            let ix = (ox * stride + kx) as isize - pad as isize;
                            if ix < 0 || ix >= in_w {
                                continue;
                            }
                            let offset = input.offset(layout, n, c, iy as usize, ix as usize);
                            f(row, oy * output.width + ox, offset);
                        }
                    }
                }
            }
        }
    }
    fn im2col(
        &self,
        input: &Tensor4D,
        data: &[f32],
        output: Shape4,
        n: usize,
        col: &mut [f32],
    ) {
        let cols = output.spatial();
        col.fill(0.);
        self.for_each_tap(input.shape(), input.layout(), output, n, |row, x, offset| {
            col[row * cols + x] = data[offset];
        });
    }
    fn col2im(
        &self,
        input: Shape4,
        layout: DataLayout,
        output: Shape4,
        n: usize,
        col: &[f32],
        dx: &mut [f32],
    ) {
        let cols = output.spatial();
        self.for_each_tap(input, layout, output, n, |row, x, offset| {
            dx[offset] += col[row * cols + x];
        });
    }
}

/// A 2d convolution with square kernels.
///
/// Each sample is unrolled (im2col) into the shared workspace and multiplied with the weights
/// as a matrix product.
#[derive(Debug)]
pub struct Convolution {
    info: LayerInfo,
    geometry: Geometry,
    filters: usize,
    weights: Parameter,
    bias: Option<Parameter>,
    output: Tensor4D,
}

impl Convolution {
    pub fn filters(&self) -> usize {
        self.filters
    }
    pub fn weights(&self) -> &Parameter {
        &self.weights
    }
    pub fn bias(&self) -> Option<&Parameter> {
        self.bias.as_ref()
    }
}

impl Layer for Convolution {
    fn info(&self) -> &LayerInfo {
        &self.info
    }
    fn output(&self) -> &Tensor4D {
        &self.output
    }
    fn output_shape(&self, input: Shape4) -> Result<Shape4> {
        self.geometry.output_shape(self.filters, input)
    }
    fn forward(&mut self, context: &mut ForwardContext) -> Result<()> {
        let input_tensor = context.input;
        let shape = self.output_shape(input_tensor.shape())?;
        self.output.ensure_shape(shape, input_tensor.layout())?;
        let Self {
            geometry,
            filters,
            weights,
            bias,
            output,
            ..
        } = self;
        let filters = *filters;
        let input = input_tensor.host()?;
        let rows = geometry.rows();
        let cols = shape.spatial();
        let scratch = context.workspace.host_scratch((rows + filters) * cols)?;
        let (col, product) = scratch.split_at_mut(rows * cols);
        let weights = weights.value().view().into_shape((filters, rows))?;
        let bias = bias.as_ref().map(Parameter::value);
        let layout = output.layout();
        let output = output.host_mut()?;
        for n in 0..shape.batch {
            geometry.im2col(input_tensor, input, shape, n, col);
            let col = ArrayView2::from_shape((rows, cols), &*col)?;
            let mut product = ArrayViewMut2::from_shape((filters, cols), &mut *product)?;
            general_mat_mul(1., &weights, &col, 0., &mut product);
            for (f, row) in product.outer_iter().enumerate() {
                let b = bias.map_or(0., |b| b[f]);
                for oy in 0..shape.height {
                    for ox in 0..shape.width {
                        output[shape.offset(layout, n, f, oy, ox)] =
                            row[oy * shape.width + ox] + b;
                    }
                }
            }
        }
        Ok(())
    }
    fn backward(&mut self, context: &mut BackwardContext) -> Result<()> {
        let input_tensor = context.input;
        let Self {
            geometry,
            filters,
            weights,
            bias,
            output,
            ..
        } = self;
        let filters = *filters;
        let shape = output.shape();
        let layout = output.layout();
        let input = input_tensor.host()?;
        let dy = context.output_gradient.host()?;
        ensure!(
            dy.len() == shape.len(),
            "convolution gradient {} does not match output {shape}!",
            context.output_gradient.shape()
        );
        let train = !context.freeze.conv;
        let rows = geometry.rows();
        let cols = shape.spatial();
        let mut dx = match context.input_gradient.as_deref_mut() {
            Some(dx) => {
                let dx = dx.host_mut()?;
                dx.fill(0.);
                Some(dx)
            }
            None => None,
        };
        if !train && dx.is_none() {
            return Ok(());
        }
        let scratch = context.workspace.host_scratch((rows + filters) * cols)?;
        let (col, dy_n) = scratch.split_at_mut(rows * cols);
        let (w, w_grad) = weights.value_grad_mut();
        let w = w.view().into_shape((filters, rows))?;
        let mut w_grad = w_grad.view_mut().into_shape((filters, rows))?;
        let mut b_grad = bias.as_mut().map(Parameter::grad_mut);
        for n in 0..shape.batch {
            for f in 0..filters {
                for oy in 0..shape.height {
                    for ox in 0..shape.width {
                        dy_n[f * cols + oy * shape.width + ox] =
                            dy[shape.offset(layout, n, f, oy, ox)];
                    }
                }
            }
            let dy_n = ArrayView2::from_shape((filters, cols), &*dy_n)?;
            if train {
                if let Some(b_grad) = b_grad.as_mut() {
                    **b_grad += &dy_n.sum_axis(Axis(1));
                }
                geometry.im2col(input_tensor, input, shape, n, col);
                let col = ArrayView2::from_shape((rows, cols), &*col)?;
                general_mat_mul(1., &dy_n, &col.t(), 1., &mut w_grad);
            }
            if let Some(dx) = dx.as_deref_mut() {
                let mut col_view = ArrayViewMut2::from_shape((rows, cols), &mut *col)?;
                general_mat_mul(1., &w.t(), &dy_n, 0., &mut col_view);
                geometry.col2im(
                    input_tensor.shape(),
                    input_tensor.layout(),
                    shape,
                    n,
                    col,
                    dx,
                );
            }
        }
        Ok(())
    }
    fn parameters(&self) -> Vec<&Parameter> {
        std::iter::once(&self.weights).chain(self.bias.as_ref()).collect()
    }
    fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        std::iter::once(&mut self.weights)
            .chain(self.bias.as_mut())
            .collect()
    }
}
