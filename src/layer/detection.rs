use super::{
    activation::logistic, BackwardContext, BuildContext, ForwardContext, Layer, LayerDescriptor,
    LayerInfo,
};
use crate::{
    data::ObjectInfo,
    network::Anchor,
    tensor::{Shape4, Tensor4D},
    Error,
};
use anyhow::{ensure, Result};
use serde::Deserialize;

fn default_ignore_thresh() -> f32 {
    0.5
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct DetectionParams {
    #[serde(default)]
    mask: Option<Vec<usize>>,
    classes: usize,
    #[serde(default = "default_ignore_thresh")]
    ignore_thresh: f32,
}

pub(super) fn build(
    descriptor: &LayerDescriptor,
    context: &mut BuildContext,
) -> Result<Box<dyn Layer>> {
    let DetectionParams {
        mask,
        classes,
        ignore_thresh,
    } = descriptor.params()?;
    let anchors = context.anchors.to_vec();
    let mask = mask.unwrap_or_else(|| (0..anchors.len()).collect());
    if mask.is_empty() {
        return Err(
            Error::config(format!("detection layer {} has no anchors", context.name)).into(),
        );
    }
    if let Some(index) = mask.iter().find(|i| **i >= anchors.len()) {
        return Err(Error::config(format!(
            "detection layer {} masks anchor {index}, the network has {}",
            context.name,
            anchors.len()
        ))
        .into());
    }
    let layer = Detection {
        info: context.info(),
        anchors,
        mask,
        classes,
        ignore_thresh,
        output: Tensor4D::default(),
        delta: Vec::new(),
        coefficient: Vec::new(),
    };
    let shape = layer.output_shape(context.input)?;
    Ok(Box::new(Detection {
        output: context.tensor(shape)?,
        ..layer
    }))
}

/// Intersection over union of two boxes given as center x, center y, width, height.
fn iou(a: [f32; 4], b: [f32; 4]) -> f32 {
    let corners = |[x, y, w, h]: [f32; 4]| [x - w / 2., y - h / 2., x + w / 2., y + h / 2.];
    let [ax0, ay0, ax1, ay1] = corners(a);
    let [bx0, by0, bx1, by1] = corners(b);
    let inter_w = (ax1.min(bx1) - ax0.max(bx0)).max(0.);
    let inter_h = (ay1.min(by1) - ay0.max(by0)).max(0.);
    let inter = inter_w * inter_h;
    let union = a[2] * a[3] + b[2] * b[3] - inter;
    if union <= 0. {
        0.
    } else {
        (inter / union).min(1.)
    }
}

/// Intersection over union of two boxes sharing a center.
fn shape_iou(w: f32, h: f32, anchor: &Anchor) -> f32 {
    iou([0., 0., w, h], [0., 0., anchor.width, anchor.height])
}

const X: usize = 0;
const Y: usize = 1;
const W: usize = 2;
const H: usize = 3;
const OBJ: usize = 4;
const CLASSES: usize = 5;

/// An anchor based detection head.
///
/// The input holds, for every masked anchor, the channels `x, y, w, h, objectness` followed by
/// one channel per class. The output applies the logistic function to all channels but `w` and
/// `h`, which stay in log space.
///
/// In training, each truth is assigned to the anchor with the most similar shape. If that anchor
/// is masked by this layer, the cell containing the truth center is trained towards it.
/// Objectness of every other prediction is pushed towards 0 unless it already overlaps a truth
/// by more than `ignore_thresh`. The loss is the sum of the squared, weighted errors.
#[derive(Debug)]
pub struct Detection {
    info: LayerInfo,
    anchors: Vec<Anchor>,
    mask: Vec<usize>,
    classes: usize,
    ignore_thresh: f32,
    output: Tensor4D,
    delta: Vec<f32>,
    coefficient: Vec<f32>,
}

impl Detection {
    pub fn mask(&self) -> &[usize] {
        &self.mask
    }
    pub fn classes(&self) -> usize {
        self.classes
    }
    fn entries(&self) -> usize {
        CLASSES + self.classes
    }
    /// Sets the error of output `k` to `scale * (target - prediction)`.
    fn set(&mut self, k: usize, target: f32, prediction: f32, scale: f32, logistic: bool) {
        self.delta[k] = scale * (target - prediction);
        let derivative = if logistic {
            prediction * (1. - prediction)
        } else {
            1.
        };
        self.coefficient[k] = -2. * scale * derivative;
    }
    /// Computes the errors against `truths`, one list per sample, and returns the loss.
    fn train(&mut self, truths: &[Vec<ObjectInfo>]) -> Result<f32> {
        let shape = self.output.shape();
        let layout = self.output.layout();
        let entries = self.entries();
        self.delta.clear();
        self.delta.resize(shape.len(), 0.);
        self.coefficient.clear();
        self.coefficient.resize(shape.len(), 0.);
        let output = self.output.host()?.to_vec();
        let (w, h) = (shape.width, shape.height);
        let at = |n: usize, slot: usize, k: usize, j: usize, i: usize| {
            shape.offset(layout, n, slot * entries + k, j, i)
        };
        for n in 0..shape.batch {
            let truths = truths.get(n).map(Vec::as_slice).unwrap_or_default();
            for (slot, anchor_index) in self.mask.clone().into_iter().enumerate() {
                let anchor = self.anchors[anchor_index];
                for j in 0..h {
                    for i in 0..w {
                        let prediction = [
                            (i as f32 + output[at(n, slot, X, j, i)]) / w as f32,
                            (j as f32 + output[at(n, slot, Y, j, i)]) / h as f32,
                            output[at(n, slot, W, j, i)].exp() * anchor.width,
                            output[at(n, slot, H, j, i)].exp() * anchor.height,
                        ];
                        let best = truths
                            .iter()
                            .map(|t| iou(prediction, [t.x, t.y, t.w, t.h]))
                            .fold(0f32, f32::max);
                        if best <= self.ignore_thresh {
                            let k = at(n, slot, OBJ, j, i);
                            self.set(k, 0., output[k], 1., true);
                        }
                    }
                }
            }
            for truth in truths.iter() {
                let best = self
                    .anchors
                    .iter()
                    .map(|anchor| shape_iou(truth.w, truth.h, anchor))
                    .enumerate()
                    .fold((0, f32::MIN), |best, (index, iou)| {
                        if iou > best.1 {
                            (index, iou)
                        } else {
                            best
                        }
                    })
                    .0;
                let Some(slot) = self.mask.iter().position(|x| *x == best) else {
                    continue;
                };
                let anchor = self.anchors[best];
                let i = ((truth.x * w as f32) as usize).min(w - 1);
                let j = ((truth.y * h as f32) as usize).min(h - 1);
                let scale = (2. - truth.w * truth.h) * truth.weight;
                let k = at(n, slot, X, j, i);
                self.set(k, truth.x * w as f32 - i as f32, output[k], scale, true);
                let k = at(n, slot, Y, j, i);
                self.set(k, truth.y * h as f32 - j as f32, output[k], scale, true);
                let k = at(n, slot, W, j, i);
                self.set(k, (truth.w / anchor.width).ln(), output[k], scale, false);
                let k = at(n, slot, H, j, i);
                self.set(k, (truth.h / anchor.height).ln(), output[k], scale, false);
                let k = at(n, slot, OBJ, j, i);
                self.set(k, 1., output[k], truth.weight, true);
                if (truth.class as usize) < self.classes {
                    for class in 0..self.classes {
                        let k = at(n, slot, CLASSES + class, j, i);
                        let target = (class == truth.class as usize) as u8 as f32;
                        self.set(k, target, output[k], truth.weight, true);
                    }
                } else {
                    tracing::debug!(
                        layer = self.info.index,
                        class = truth.class,
                        "truth class out of range"
                    );
                }
            }
        }
        Ok(self.delta.iter().map(|d| d * d).sum())
    }
}

impl Layer for Detection {
    fn info(&self) -> &LayerInfo {
        &self.info
    }
    fn output(&self) -> &Tensor4D {
        &self.output
    }
    fn output_shape(&self, input: Shape4) -> Result<Shape4> {
        let expected = self.mask.len() * self.entries();
        ensure!(
            input.channels == expected,
            "detection layer expects {expected} channels ({} anchors, {} classes), \
             input is {input}!",
            self.mask.len(),
            self.classes
        );
        ensure!(!input.is_empty(), "detection layer input {input} is empty!");
        Ok(input)
    }
    fn forward(&mut self, context: &mut ForwardContext) -> Result<()> {
        let input_tensor = context.input;
        let shape = self.output_shape(input_tensor.shape())?;
        self.output.ensure_shape(shape, input_tensor.layout())?;
        let entries = self.entries();
        let x = input_tensor.host()?;
        let output = self.output.host_mut()?;
        for (i, (y, x)) in output.iter_mut().zip(x).enumerate() {
            let k = input_tensor.channel_of(i) % entries;
            *y = if k == W || k == H { *x } else { logistic(*x) };
        }
        if !context.training {
            self.delta.clear();
            self.coefficient.clear();
            return Ok(());
        }
        let truths: Vec<Vec<ObjectInfo>> = (0..shape.batch)
            .map(|n| {
                context
                    .sample_truths(n)
                    .iter()
                    .copied()
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .collect();
        *context.loss += self.train(&truths)?;
        Ok(())
    }
    fn backward(&mut self, context: &mut BackwardContext) -> Result<()> {
        let Some(dx) = context.input_gradient.as_deref_mut() else {
            return Ok(());
        };
        ensure!(
            self.delta.len() == dx.len(),
            "detection backward without a matching training forward!"
        );
        let dx = dx.host_mut()?;
        for ((dx, delta), coefficient) in dx.iter_mut().zip(&self.delta).zip(&self.coefficient) {
            *dx = delta * coefficient;
        }
        Ok(())
    }
    fn is_loss(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        layer::{tests as harness, ForwardContext, FreezeFlags, LayerRegistry},
        tensor::{DataLayout, Precision},
        workspace::Workspace,
    };
    use approx::assert_abs_diff_eq;
    use krnl::device::Device;

    fn anchors() -> Vec<Anchor> {
        vec![
            Anchor::new(0.1, 0.1),
            Anchor::new(0.5, 0.4),
            Anchor::new(0.9, 0.8),
        ]
    }

    fn layer(shape: Shape4, layout: DataLayout, ignore_thresh: f32) -> Box<dyn Layer> {
        let descriptor = LayerDescriptor::new("detection")
            .with_param("mask", vec![1, 2])
            .with_param("classes", 2)
            .with_param("ignore_thresh", ignore_thresh);
        harness::build(
            &LayerRegistry::with_builtins(),
            &descriptor,
            shape,
            layout,
            &anchors(),
        )
        .unwrap()
    }

    fn truths() -> Vec<ObjectInfo> {
        vec![
            ObjectInfo::new(0, [0.3, 0.6, 0.45, 0.4]),
            ObjectInfo::EMPTY,
            // best anchor is 0, not masked
            ObjectInfo::new(1, [0.8, 0.2, 0.1, 0.12]),
            ObjectInfo::new(1, [0.7, 0.7, 0.8, 0.9]),
        ]
    }

    #[test]
    fn empty_truths_push_objectness_down() -> Result<()> {
        let shape = Shape4::new(1, 14, 2, 2);
        let mut layer = layer(shape, DataLayout::Nchw, 0.5);
        let input = Tensor4D::zeros(shape, DataLayout::Nchw, Precision::Fp32)?;
        let loss = harness::forward(layer.as_mut(), &input, &[ObjectInfo::EMPTY; 2], 2)?;
        // 2 anchors, 4 cells, objectness 0.5
        assert_abs_diff_eq!(loss, 8. * 0.25);
        Ok(())
    }

    #[test]
    fn mask_out_of_range() {
        let descriptor = LayerDescriptor::new("detection")
            .with_param("mask", vec![3])
            .with_param("classes", 2);
        let error = harness::build(
            &LayerRegistry::with_builtins(),
            &descriptor,
            Shape4::new(1, 7, 2, 2),
            DataLayout::Nchw,
            &anchors(),
        )
        .unwrap_err();
        assert!(matches!(error.downcast_ref::<Error>(), Some(Error::Config(_))));
    }

    #[test]
    fn channel_mismatch() {
        let descriptor = LayerDescriptor::new("detection").with_param("classes", 2);
        assert!(harness::build(
            &LayerRegistry::with_builtins(),
            &descriptor,
            Shape4::new(1, 14, 2, 2),
            DataLayout::Nchw,
            &anchors(),
        )
        .is_err());
    }

    fn check_gradient(layout: DataLayout) -> Result<()> {
        let shape = Shape4::new(2, 14, 3, 2);
        let mut layer = layer(shape, layout, 1.);
        let data: Vec<f32> = (0..shape.len())
            .map(|x| ((x * 7) % 11) as f32 * 0.2 - 1.)
            .collect();
        let input = Tensor4D::from_vec(shape, layout, Precision::Fp32, data.clone())?;
        let truths = truths();
        let loss = harness::forward(layer.as_mut(), &input, &truths, 2)?;
        assert!(loss > 0.);
        let output_gradient = Tensor4D::zeros(shape, layout, Precision::Fp32)?;
        let dx = harness::backward(
            layer.as_mut(),
            &input,
            &output_gradient,
            FreezeFlags::default(),
        )?;
        let eps = 1e-3;
        let mut loss_at = |i: usize, delta: f32| {
            let mut x = data.clone();
            x[i] += delta;
            let x = Tensor4D::from_vec(shape, layout, Precision::Fp32, x).unwrap();
            harness::forward(layer.as_mut(), &x, &truths, 2).unwrap()
        };
        for i in 0..shape.len() {
            let numeric = (loss_at(i, eps) - loss_at(i, -eps)) / (2. * eps);
            assert_abs_diff_eq!(dx.host()?[i], numeric, epsilon = 1e-2);
        }
        Ok(())
    }

    #[test]
    fn gradient_nchw() -> Result<()> {
        check_gradient(DataLayout::Nchw)
    }

    #[test]
    fn gradient_nhwc() -> Result<()> {
        check_gradient(DataLayout::Nhwc)
    }

    #[test]
    fn inference_adds_no_loss() -> Result<()> {
        let shape = Shape4::new(1, 14, 2, 2);
        let mut layer = layer(shape, DataLayout::Nchw, 0.5);
        let input = Tensor4D::zeros(shape, DataLayout::Nchw, Precision::Fp32)?;
        let mut workspace = Workspace::new(Device::host());
        let mut loss = 0.;
        layer.forward(&mut ForwardContext {
            training: false,
            freeze: FreezeFlags::default(),
            input: &input,
            max_truths: 2,
            truths: &truths()[..2],
            workspace: &mut workspace,
            loss: &mut loss,
        })?;
        assert_eq!(loss, 0.);
        assert!(layer.output().host()?.iter().all(|x| *x == 0.5 || *x == 0.));
        Ok(())
    }

    #[test]
    fn backward_after_inference_fails() -> Result<()> {
        let shape = Shape4::new(1, 14, 2, 2);
        let mut layer = layer(shape, DataLayout::Nchw, 0.5);
        let input = Tensor4D::zeros(shape, DataLayout::Nchw, Precision::Fp32)?;
        let output_gradient = Tensor4D::zeros(shape, DataLayout::Nchw, Precision::Fp32)?;
        harness::forward(layer.as_mut(), &input, &truths()[..2], 2)?;
        harness::backward(
            layer.as_mut(),
            &input,
            &output_gradient,
            FreezeFlags::default(),
        )?;
        let mut workspace = Workspace::new(Device::host());
        let mut loss = 0.;
        layer.forward(&mut ForwardContext {
            training: false,
            freeze: FreezeFlags::default(),
            input: &input,
            max_truths: 2,
            truths: &truths()[..2],
            workspace: &mut workspace,
            loss: &mut loss,
        })?;
        assert!(harness::backward(
            layer.as_mut(),
            &input,
            &output_gradient,
            FreezeFlags::default(),
        )
        .is_err());
        Ok(())
    }

    #[test]
    fn iou_of_boxes() {
        assert_abs_diff_eq!(iou([0.5, 0.5, 0.2, 0.2], [0.5, 0.5, 0.2, 0.2]), 1.);
        assert_abs_diff_eq!(iou([0., 0., 0.2, 0.2], [0.6, 0.6, 0.2, 0.2]), 0.);
        let third = iou([0., 0., 0.2, 0.2], [0.1, 0., 0.2, 0.2]);
        assert_abs_diff_eq!(third, 1. / 3., epsilon = 1e-6);
        assert!(shape_iou(0.3, 0.7, &Anchor::new(0.3, 0.7)) <= 1.);
    }
}
