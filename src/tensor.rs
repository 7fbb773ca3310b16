use crate::Error;
use anyhow::{bail, ensure, Result};
use derive_more::Display;
use half::f16;
use krnl::{buffer::Buffer, device::Device};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug};

/// Memory layout of a [`Tensor4D`].
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum DataLayout {
    /// Channel major, `[batch, channels, height, width]`.
    #[default]
    #[display(fmt = "NCHW")]
    Nchw,
    /// Channel minor, `[batch, height, width, channels]`.
    #[display(fmt = "NHWC")]
    Nhwc,
}

impl DataLayout {
    /// Parses `"NCHW"` or `"NHWC"`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NCHW" => Some(Self::Nchw),
            "NHWC" => Some(Self::Nhwc),
            _ => None,
        }
    }
}

/// Element type of the device copy of a [`Tensor4D`].
///
/// Host computation is always done in f32. [`Precision::Fp16`] stores the device copy (and
/// checkpointed parameters) as IEEE half floats.
#[derive(Clone, Copy, Debug, Default, Display, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    #[display(fmt = "FP32")]
    Fp32,
    #[display(fmt = "FP16")]
    Fp16,
}

impl Precision {
    /// Parses `"FP32"` or `"FP16"`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FP32" => Some(Self::Fp32),
            "FP16" => Some(Self::Fp16),
            _ => None,
        }
    }
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::Fp32 => 4,
            Self::Fp16 => 2,
        }
    }
}

/// Which copy of a [`Tensor4D`] holds the current data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Residence {
    /// Only the host copy is valid.
    Host,
    /// Only the device copy is valid.
    Device,
    /// Both copies are valid and equal.
    Synced,
}

/// Dimensions of a [`Tensor4D`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Shape4 {
    pub batch: usize,
    pub channels: usize,
    pub width: usize,
    pub height: usize,
}

impl Shape4 {
    pub fn new(batch: usize, channels: usize, width: usize, height: usize) -> Self {
        Self {
            batch,
            channels,
            width,
            height,
        }
    }
    /// The number of elements.
    pub fn len(&self) -> usize {
        self.batch * self.channels * self.width * self.height
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Elements per sample.
    pub fn sample_len(&self) -> usize {
        self.channels * self.width * self.height
    }
    /// Elements per channel plane.
    pub fn spatial(&self) -> usize {
        self.width * self.height
    }
    /// Offset of element (`n`, `c`, `y`, `x`) in data laid out as `layout`.
    #[inline]
    pub fn offset(&self, layout: DataLayout, n: usize, c: usize, y: usize, x: usize) -> usize {
        let Self {
            channels,
            width,
            height,
            ..
        } = *self;
        match layout {
            DataLayout::Nchw => ((n * channels + c) * height + y) * width + x,
            DataLayout::Nhwc => ((n * height + y) * width + x) * channels + c,
        }
    }
}

impl fmt::Display for Shape4 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}x{}]",
            self.batch, self.channels, self.width, self.height
        )
    }
}

enum DeviceStore {
    F32(Buffer<f32>),
    F16(Buffer<f16>),
}

impl DeviceStore {
    fn device(&self) -> Device {
        match self {
            Self::F32(x) => x.device(),
            Self::F16(x) => x.device(),
        }
    }
}

/// A 4 dimensional array exchanged between layers.
///
/// A tensor has an optional host copy and an optional device copy. [`.push()`](Tensor4D::push)
/// and [`.pull()`](Tensor4D::pull) transfer explicitly and do nothing when the destination is
/// already current. Mutable host access invalidates the device copy.
///
/// Dimensions only change through [`.reinit()`](Tensor4D::reinit), which discards both copies.
pub struct Tensor4D {
    shape: Shape4,
    layout: DataLayout,
    precision: Precision,
    host: Option<Vec<f32>>,
    device: Option<DeviceStore>,
    residence: Residence,
}

impl Default for Tensor4D {
    fn default() -> Self {
        Self {
            shape: Shape4::default(),
            layout: DataLayout::default(),
            precision: Precision::default(),
            host: None,
            device: None,
            residence: Residence::Host,
        }
    }
}

fn alloc_host(len: usize) -> Result<Vec<f32>> {
    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| Error::Allocation {
        what: "tensor",
        bytes: len * std::mem::size_of::<f32>(),
        source: Some(e.into()),
    })?;
    data.resize(len, 0.);
    Ok(data)
}

impl Tensor4D {
    /// A zeroed host tensor.
    ///
    /// **Errors**
    ///
    /// [`Error::Allocation`] if the host allocation fails.
    pub fn zeros(shape: Shape4, layout: DataLayout, precision: Precision) -> Result<Self> {
        Ok(Self {
            shape,
            layout,
            precision,
            host: Some(alloc_host(shape.len())?),
            device: None,
            residence: Residence::Host,
        })
    }
    /// A host tensor from `data`, in `layout` order.
    ///
    /// **Errors**
    ///
    /// If `data.len()` does not match `shape`.
    pub fn from_vec(
        shape: Shape4,
        layout: DataLayout,
        precision: Precision,
        data: Vec<f32>,
    ) -> Result<Self> {
        ensure!(
            data.len() == shape.len(),
            "Expected {} elements for {shape}, found {}!",
            shape.len(),
            data.len()
        );
        Ok(Self {
            shape,
            layout,
            precision,
            host: Some(data),
            device: None,
            residence: Residence::Host,
        })
    }
    /// Discards the data and reallocates with new dimensions.
    ///
    /// The precision is kept. On error the tensor is left empty.
    pub fn reinit(
        &mut self,
        batch: usize,
        channels: usize,
        width: usize,
        height: usize,
        layout: DataLayout,
    ) -> Result<()> {
        self.host = None;
        self.device = None;
        self.residence = Residence::Host;
        self.shape = Shape4::default();
        let shape = Shape4::new(batch, channels, width, height);
        self.host.replace(alloc_host(shape.len())?);
        self.shape = shape;
        self.layout = layout;
        Ok(())
    }
    /// Reinitializes to `shape` unless the tensor already has it.
    pub(crate) fn ensure_shape(&mut self, shape: Shape4, layout: DataLayout) -> Result<()> {
        if self.shape != shape || self.layout != layout || self.host.is_none() {
            self.reinit(shape.batch, shape.channels, shape.width, shape.height, layout)?;
        }
        Ok(())
    }
    pub fn shape(&self) -> Shape4 {
        self.shape
    }
    pub fn batch(&self) -> usize {
        self.shape.batch
    }
    pub fn channels(&self) -> usize {
        self.shape.channels
    }
    pub fn width(&self) -> usize {
        self.shape.width
    }
    pub fn height(&self) -> usize {
        self.shape.height
    }
    pub fn layout(&self) -> DataLayout {
        self.layout
    }
    pub fn precision(&self) -> Precision {
        self.precision
    }
    pub fn len(&self) -> usize {
        self.shape.len()
    }
    pub fn is_empty(&self) -> bool {
        self.shape.is_empty()
    }
    pub fn residence(&self) -> Residence {
        self.residence
    }
    /// The device of the device copy, if any.
    pub fn device(&self) -> Option<Device> {
        self.device.as_ref().map(DeviceStore::device)
    }
    /// Offset of element (`n`, `c`, `y`, `x`) in the flat data, honoring the layout.
    #[inline]
    pub fn offset(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        self.shape.offset(self.layout, n, c, y, x)
    }
    /// The channel of the element at flat `offset`.
    #[inline]
    pub fn channel_of(&self, offset: usize) -> usize {
        match self.layout {
            DataLayout::Nchw => (offset / self.shape.spatial().max(1)) % self.shape.channels.max(1),
            DataLayout::Nhwc => offset % self.shape.channels.max(1),
        }
    }
    /// The host data.
    ///
    /// **Errors**
    ///
    /// If only the device copy is current, see [`.pull()`](Self::pull).
    pub fn host(&self) -> Result<&[f32]> {
        match (self.residence, self.host.as_ref()) {
            (Residence::Host | Residence::Synced, Some(host)) => Ok(host),
            _ => bail!("Tensor {} is not current on the host!", self.shape),
        }
    }
    /// Mutable host data. Invalidates the device copy.
    ///
    /// **Errors**
    ///
    /// If only the device copy is current, see [`.pull()`](Self::pull).
    pub fn host_mut(&mut self) -> Result<&mut [f32]> {
        if self.residence != Residence::Device {
            if let Some(host) = self.host.as_mut() {
                self.device = None;
                self.residence = Residence::Host;
                return Ok(host);
            }
        }
        bail!("Tensor {} is not current on the host!", self.shape)
    }
    /// Fills the host data with `elem`.
    pub fn fill(&mut self, elem: f32) -> Result<()> {
        self.host_mut()?.fill(elem);
        Ok(())
    }
    /// Copies the host data to `device`.
    ///
    /// Does nothing if the device copy on `device` is already current.
    pub fn push(&mut self, device: &Device) -> Result<()> {
        if self.residence != Residence::Host
            && self.device.as_ref().map(DeviceStore::device).as_ref() == Some(device)
        {
            return Ok(());
        }
        if self.residence == Residence::Device {
            self.pull()?;
        }
        let host = self.host()?;
        let store = match self.precision {
            Precision::Fp32 => DeviceStore::F32(
                Buffer::from(host.to_vec())
                    .into_device(device.clone())
                    .map_err(|e| self.device_alloc_error(e))?,
            ),
            Precision::Fp16 => {
                let data: Vec<f16> = host.iter().copied().map(f16::from_f32).collect();
                DeviceStore::F16(
                    Buffer::from(data)
                        .into_device(device.clone())
                        .map_err(|e| self.device_alloc_error(e))?,
                )
            }
        };
        self.device.replace(store);
        self.residence = Residence::Synced;
        Ok(())
    }
    /// Copies the device data back to the host.
    ///
    /// Does nothing if the host copy is already current.
    pub fn pull(&mut self) -> Result<()> {
        if self.residence != Residence::Device {
            return Ok(());
        }
        let data = match self.device.as_ref() {
            Some(DeviceStore::F32(x)) => x.to_vec()?,
            Some(DeviceStore::F16(x)) => x.to_vec()?.into_iter().map(f16::to_f32).collect(),
            None => bail!("Tensor {} has no device copy!", self.shape),
        };
        self.host.replace(data);
        self.residence = Residence::Synced;
        Ok(())
    }
    /// Drops the host copy, leaving the device copy authoritative.
    ///
    /// **Errors**
    ///
    /// If there is no device copy.
    pub fn release_host(&mut self) -> Result<()> {
        ensure!(
            self.device.is_some() && self.residence != Residence::Host,
            "Tensor {} has no current device copy!",
            self.shape
        );
        self.host = None;
        self.residence = Residence::Device;
        Ok(())
    }
    fn device_alloc_error(&self, e: anyhow::Error) -> anyhow::Error {
        Error::Allocation {
            what: "tensor",
            bytes: self.len() * self.precision.size(),
            source: Some(e.into()),
        }
        .into()
    }
}

impl Debug for Tensor4D {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Tensor4D")
            .field("shape", &self.shape)
            .field("layout", &self.layout)
            .field("precision", &self.precision)
            .field("residence", &self.residence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_follow_layout() -> Result<()> {
        let shape = Shape4::new(2, 3, 4, 5);
        let nchw = Tensor4D::zeros(shape, DataLayout::Nchw, Precision::Fp32)?;
        let nhwc = Tensor4D::zeros(shape, DataLayout::Nhwc, Precision::Fp32)?;
        assert_eq!(nchw.offset(0, 1, 0, 0), 20);
        assert_eq!(nchw.offset(1, 0, 0, 0), 60);
        assert_eq!(nhwc.offset(0, 1, 0, 0), 1);
        assert_eq!(nhwc.offset(0, 0, 1, 0), 12);
        assert_eq!(nhwc.offset(1, 2, 4, 3), shape.len() - 1);
        assert_eq!(nchw.channel_of(nchw.offset(1, 2, 3, 1)), 2);
        assert_eq!(nhwc.channel_of(nhwc.offset(1, 2, 3, 1)), 2);
        Ok(())
    }

    #[test]
    fn reinit_replaces_dims() -> Result<()> {
        let mut x = Tensor4D::zeros(
            Shape4::new(2, 3, 416, 416),
            DataLayout::Nhwc,
            Precision::Fp16,
        )?;
        x.fill(1.)?;
        x.reinit(2, 3, 480, 480, DataLayout::Nhwc)?;
        assert_eq!(x.shape(), Shape4::new(2, 3, 480, 480));
        assert_eq!(x.layout(), DataLayout::Nhwc);
        assert_eq!(x.precision(), Precision::Fp16);
        assert!(x.host()?.iter().all(|x| *x == 0.));
        Ok(())
    }

    #[test]
    fn push_pull_roundtrip() -> Result<()> {
        let device = Device::host();
        let data: Vec<f32> = (0..24).map(|x| x as f32 * 0.5).collect();
        let mut x = Tensor4D::from_vec(
            Shape4::new(1, 2, 3, 4),
            DataLayout::Nchw,
            Precision::Fp32,
            data.clone(),
        )?;
        x.push(&device)?;
        assert_eq!(x.residence(), Residence::Synced);
        x.push(&device)?;
        x.release_host()?;
        assert!(x.host().is_err());
        x.pull()?;
        x.pull()?;
        assert_eq!(x.host()?, data.as_slice());
        x.host_mut()?[0] = 7.;
        assert_eq!(x.residence(), Residence::Host);
        assert!(x.device().is_none());
        Ok(())
    }

    #[test]
    fn fp16_device_copy() -> Result<()> {
        let mut x = Tensor4D::from_vec(
            Shape4::new(1, 1, 2, 2),
            DataLayout::Nchw,
            Precision::Fp16,
            vec![0.1, 1.5, -2.25, 1000.],
        )?;
        x.push(&Device::host())?;
        x.release_host()?;
        x.pull()?;
        let host = x.host()?;
        assert_eq!(&host[1..], &[1.5, -2.25, 1000.]);
        approx::assert_relative_eq!(host[0], 0.1, max_relative = 1e-3);
        Ok(())
    }

    #[test]
    fn from_vec_checks_len() {
        assert!(Tensor4D::from_vec(
            Shape4::new(1, 1, 2, 2),
            DataLayout::Nchw,
            Precision::Fp32,
            vec![0.; 3]
        )
        .is_err());
    }
}
