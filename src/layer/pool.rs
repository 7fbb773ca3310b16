use super::{BackwardContext, BuildContext, ForwardContext, Layer, LayerDescriptor, LayerInfo};
use crate::tensor::{Shape4, Tensor4D};
use anyhow::{ensure, Result};
use serde::Deserialize;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MaxPoolParams {
    size: usize,
    #[serde(default)]
    stride: Option<usize>,
    #[serde(default)]
    pad: usize,
}

pub(super) fn build(
    descriptor: &LayerDescriptor,
    context: &mut BuildContext,
) -> Result<Box<dyn Layer>> {
    let MaxPoolParams { size, stride, pad } = descriptor.params()?;
    let pool = MaxPool {
        info: context.info(),
        size,
        stride: stride.unwrap_or(size),
        pad,
        output: Tensor4D::default(),
        indices: Vec::new(),
    };
    let shape = pool.output_shape(context.input)?;
    Ok(Box::new(MaxPool {
        output: context.tensor(shape)?,
        ..pool
    }))
}

/// Max pooling with a square window.
///
/// Window positions outside the input are skipped. The index of each maximum is kept for
/// backward.
#[derive(Debug)]
pub struct MaxPool {
    info: LayerInfo,
    size: usize,
    stride: usize,
    pad: usize,
    output: Tensor4D,
    indices: Vec<usize>,
}

fn pooled(len: usize, size: usize, stride: usize, pad: usize) -> usize {
    (len + 2 * pad - size) / stride + 1
}

impl Layer for MaxPool {
    fn info(&self) -> &LayerInfo {
        &self.info
    }
    fn output(&self) -> &Tensor4D {
        &self.output
    }
    fn output_shape(&self, input: Shape4) -> Result<Shape4> {
        let Self {
            size, stride, pad, ..
        } = *self;
        ensure!(size > 0 && stride > 0, "maxpool size and stride must be positive!");
        ensure!(
            input.width + 2 * pad >= size && input.height + 2 * pad >= size,
            "maxpool window {size} does not fit input {input}!"
        );
        Ok(Shape4 {
            width: pooled(input.width, size, stride, pad),
            height: pooled(input.height, size, stride, pad),
            ..input
        })
    }
    fn forward(&mut self, context: &mut ForwardContext) -> Result<()> {
        let input_tensor = context.input;
        let shape = self.output_shape(input_tensor.shape())?;
        self.output.ensure_shape(shape, input_tensor.layout())?;
        let input = input_tensor.host()?;
        let (size, stride) = (self.size, self.stride);
        let pad = self.pad as isize;
        let (in_w, in_h) = (input_tensor.width() as isize, input_tensor.height() as isize);
        self.indices.clear();
        self.indices.resize(shape.len(), usize::MAX);
        let layout = self.output.layout();
        let output = self.output.host_mut()?;
        for n in 0..shape.batch {
            for c in 0..shape.channels {
                for oy in 0..shape.height {
                    for ox in 0..shape.width {
                        let mut best = f32::NEG_INFINITY;
                        let mut best_index = usize::MAX;
                        for ky in 0..size {
                            let iy = (oy * stride + ky) as isize - pad;
                            if iy < 0 || iy >= in_h {
                                continue;
                            }
                            for kx in 0..size {
                                let ix = (ox * stride + kx) as isize - pad;
                                if ix < 0 || ix >= in_w {
                                    continue;
                                }
                                let index = input_tensor.offset(n, c, iy as usize, ix as usize);
                                if input[index] > best {
                                    best = input[index];
                                    best_index = index;
                                }
                            }
                        }
                        let offset = shape.offset(layout, n, c, oy, ox);
                        output[offset] = if best_index == usize::MAX { 0. } else { best };
                        self.indices[offset] = best_index;
                    }
                }
            }
        }
        Ok(())
    }
    fn backward(&mut self, context: &mut BackwardContext) -> Result<()> {
        let Some(dx) = context.input_gradient.as_deref_mut() else {
            return Ok(());
        };
        let dy = context.output_gradient.host()?;
        ensure!(
            dy.len() == self.indices.len(),
            "maxpool backward without matching forward!"
        );
        let dx = dx.host_mut()?;
        dx.fill(0.);
        for (dy, index) in dy.iter().zip(self.indices.iter()) {
            if let Some(dx) = dx.get_mut(*index) {
                *dx += dy;
            }
        }
        Ok(())
    }
}
