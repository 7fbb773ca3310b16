use crate::tensor::{Shape4, Tensor4D};
use anyhow::{bail, ensure, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::thread::JoinHandle;

/// A ground truth object.
///
/// The box is normalized to the input size, centered at (`x`, `y`). A slot with a negative
/// class or a non positive size is empty.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
    pub class: i32,
    /// Loss weight of the object.
    pub weight: f32,
}

impl ObjectInfo {
    /// An empty slot.
    pub const EMPTY: Self = Self {
        x: 0.,
        y: 0.,
        w: 0.,
        h: 0.,
        class: -1,
        weight: 1.,
    };
    /// An object of `class` with box `[x, y, w, h]` and weight 1.
    pub fn new(class: i32, [x, y, w, h]: [f32; 4]) -> Self {
        Self {
            x,
            y,
            w,
            h,
            class,
            weight: 1.,
        }
    }
    pub fn with_weight(self, weight: f32) -> Self {
        Self { weight, ..self }
    }
    pub fn is_empty(&self) -> bool {
        self.class < 0 || self.w <= 0. || self.h <= 0.
    }
}

impl Default for ObjectInfo {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Supplies mini-batches to the training loop.
///
/// Implemented for closures `FnMut(&mut Tensor4D, &mut [ObjectInfo]) -> Result<()>`.
pub trait DataSource {
    /// Fills `input` and the `truths` slots with the next mini-batch, blocking until it is
    /// available.
    ///
    /// `truths` holds `max_truths` slots per sample. Unused slots must be left
    /// [`empty`](ObjectInfo::EMPTY).
    fn load(&mut self, input: &mut Tensor4D, truths: &mut [ObjectInfo]) -> Result<()>;
}

impl<F> DataSource for F
where
    F: FnMut(&mut Tensor4D, &mut [ObjectInfo]) -> Result<()>,
{
    fn load(&mut self, input: &mut Tensor4D, truths: &mut [ObjectInfo]) -> Result<()> {
        self(input, truths)
    }
}

/// A mini-batch produced ahead of time.
#[derive(Clone, Debug, Default)]
pub struct Batch {
    /// Input dimensions the batch was produced for.
    pub shape: Shape4,
    /// Input data in the layout of the graph input.
    pub data: Vec<f32>,
    /// Truths of all samples, `max_truths` slots per sample.
    pub truths: Vec<ObjectInfo>,
}

impl Batch {
    /// Copies the batch into the graph input and truth slots.
    ///
    /// **Errors**
    ///
    /// If the batch was produced for other dimensions than `input` has.
    pub fn write_into(&self, input: &mut Tensor4D, truths: &mut [ObjectInfo]) -> Result<()> {
        ensure!(
            self.shape == input.shape() && self.data.len() == input.len(),
            "Batch {} does not match input {}!",
            self.shape,
            input.shape()
        );
        input.host_mut()?.copy_from_slice(&self.data);
        truths.fill(ObjectInfo::EMPTY);
        if self.truths.len() > truths.len() {
            tracing::warn!(
                produced = self.truths.len(),
                slots = truths.len(),
                "dropping truths beyond the truth buffer"
            );
        }
        for (slot, truth) in truths.iter_mut().zip(self.truths.iter()) {
            *slot = *truth;
        }
        Ok(())
    }
}

/// Produces batches on the [`Prefetch`] thread.
///
/// Implemented for closures `FnMut(Shape4) -> Result<Batch>`.
pub trait BatchProducer: Send + 'static {
    /// Produces a batch for an input of `shape`.
    fn produce(&mut self, shape: Shape4) -> Result<Batch>;
}

impl<F> BatchProducer for F
where
    F: FnMut(Shape4) -> Result<Batch> + Send + 'static,
{
    fn produce(&mut self, shape: Shape4) -> Result<Batch> {
        self(shape)
    }
}

/// A [`DataSource`] that produces batches on a background thread.
///
/// Up to `depth` batches are buffered in a bounded channel. Batches are owned values and are
/// only copied into the graph input when [`.load()`](DataSource::load) is called between
/// passes.
///
/// When the input is resized, buffered batches of the old size are discarded and the producer
/// is told the new size.
///
/// ```no_run
/// # use convgraph::{data::{Batch, Prefetch}, tensor::Shape4};
/// let prefetch = Prefetch::new(
///     |shape: Shape4| -> anyhow::Result<Batch> {
///         Ok(Batch { shape, data: vec![0.; shape.len()], truths: Vec::new() })
///     },
///     Shape4::new(8, 3, 416, 416),
///     2,
/// )?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Prefetch {
    shape: Shape4,
    control: Option<Sender<Shape4>>,
    batches: Option<Receiver<Result<Batch>>>,
    handle: Option<JoinHandle<()>>,
}

impl Prefetch {
    /// Starts producing batches for `shape`.
    pub fn new(producer: impl BatchProducer, shape: Shape4, depth: usize) -> Result<Self> {
        let (control_sender, control) = crossbeam_channel::unbounded::<Shape4>();
        let (sender, batches) = crossbeam_channel::bounded(depth.max(1));
        let handle = std::thread::Builder::new()
            .name("prefetch".into())
            .spawn(move || produce(producer, shape, control, sender))?;
        Ok(Self {
            shape,
            control: Some(control_sender),
            batches: Some(batches),
            handle: Some(handle),
        })
    }
}

fn produce(
    mut producer: impl BatchProducer,
    mut shape: Shape4,
    control: Receiver<Shape4>,
    sender: Sender<Result<Batch>>,
) {
    loop {
        loop {
            match control.try_recv() {
                Ok(new_shape) => shape = new_shape,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }
        let batch = producer.produce(shape);
        let failed = batch.is_err();
        if sender.send(batch).is_err() || failed {
            return;
        }
    }
}

impl DataSource for Prefetch {
    fn load(&mut self, input: &mut Tensor4D, truths: &mut [ObjectInfo]) -> Result<()> {
        let shape = input.shape();
        if shape != self.shape {
            tracing::debug!(%shape, "prefetch resized");
            self.shape = shape;
            if let Some(control) = self.control.as_ref() {
                control.send(shape).ok();
            }
        }
        let Some(batches) = self.batches.as_ref() else {
            bail!("Prefetch is closed!");
        };
        loop {
            let batch = match batches.recv() {
                Ok(batch) => batch?,
                Err(_) => bail!("Prefetch thread exited!"),
            };
            if batch.shape == shape {
                return batch.write_into(input, truths);
            }
        }
    }
}

impl Drop for Prefetch {
    fn drop(&mut self) {
        self.control.take();
        self.batches.take();
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataLayout, Precision};

    fn counter() -> impl BatchProducer {
        let mut count = 0;
        move |shape: Shape4| -> Result<Batch> {
            count += 1;
            Ok(Batch {
                shape,
                data: vec![count as f32; shape.len()],
                truths: vec![ObjectInfo::new(count, [0.5, 0.5, 0.1, 0.1])],
            })
        }
    }

    #[test]
    fn empty_slots() {
        assert!(ObjectInfo::EMPTY.is_empty());
        assert!(ObjectInfo::new(0, [0.5, 0.5, 0., 0.2]).is_empty());
        assert!(!ObjectInfo::new(0, [0.5, 0.5, 0.1, 0.2]).is_empty());
    }

    #[test]
    fn prefetch_in_order() -> Result<()> {
        let shape = Shape4::new(2, 1, 2, 2);
        let mut prefetch = Prefetch::new(counter(), shape, 2)?;
        let mut input = Tensor4D::zeros(shape, DataLayout::Nchw, Precision::Fp32)?;
        let mut truths = vec![ObjectInfo::EMPTY; 4];
        for i in 1..=3 {
            prefetch.load(&mut input, &mut truths)?;
            assert!(input.host()?.iter().all(|x| *x == i as f32));
            assert_eq!(truths[0].class, i);
            assert!(truths[1..].iter().all(ObjectInfo::is_empty));
        }
        Ok(())
    }

    #[test]
    fn prefetch_follows_resize() -> Result<()> {
        let shape = Shape4::new(1, 1, 2, 2);
        let mut prefetch = Prefetch::new(counter(), shape, 2)?;
        let mut input = Tensor4D::zeros(shape, DataLayout::Nchw, Precision::Fp32)?;
        let mut truths = vec![ObjectInfo::EMPTY; 1];
        prefetch.load(&mut input, &mut truths)?;
        input.reinit(1, 1, 3, 3, DataLayout::Nchw)?;
        prefetch.load(&mut input, &mut truths)?;
        assert_eq!(input.len(), 9);
        assert!(input.host()?.iter().all(|x| *x > 1.));
        Ok(())
    }

    #[test]
    fn producer_error_is_returned() -> Result<()> {
        let shape = Shape4::new(1, 1, 1, 1);
        let mut prefetch = Prefetch::new(
            |_: Shape4| -> Result<Batch> { bail!("no more images") },
            shape,
            1,
        )?;
        let mut input = Tensor4D::zeros(shape, DataLayout::Nchw, Precision::Fp32)?;
        assert!(prefetch.load(&mut input, &mut []).is_err());
        assert!(prefetch.load(&mut input, &mut []).is_err());
        Ok(())
    }

    #[test]
    fn closure_source() -> Result<()> {
        let mut source = |input: &mut Tensor4D, truths: &mut [ObjectInfo]| -> Result<()> {
            input.fill(1.)?;
            truths[0] = ObjectInfo::new(3, [0.1, 0.1, 0.1, 0.1]);
            Ok(())
        };
        let mut input =
            Tensor4D::zeros(Shape4::new(1, 1, 1, 1), DataLayout::Nchw, Precision::Fp32)?;
        let mut truths = [ObjectInfo::EMPTY];
        DataSource::load(&mut source, &mut input, &mut truths)?;
        assert_eq!(truths[0].class, 3);
        Ok(())
    }
}
