use crate::Error;
use anyhow::Result;
use krnl::{buffer::Buffer, device::Device};
use std::fmt::{self, Debug};

/// Shared scratch memory for layers.
///
/// A single buffer on the graph's device that only grows. Layers borrow it through
/// [`ForwardContext`](crate::layer::ForwardContext) /
/// [`BackwardContext`](crate::layer::BackwardContext) for the duration of one call, so no layer
/// can hold on to it while another layer grows (and moves) it.
///
/// Growth releases the old buffer before allocating the new one, and the new buffer is zeroed.
/// Contents never survive a reallocation.
pub struct Workspace {
    device: Device,
    size: usize,
    limit: Option<usize>,
    buffer: Option<Buffer<f32>>,
}

const ELEM_SIZE: usize = std::mem::size_of::<f32>();

impl Workspace {
    /// Creates an empty workspace on `device`.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            size: 0,
            limit: None,
            buffer: None,
        }
    }
    /// Caps allocations at `limit` bytes.
    ///
    /// Requests beyond the limit fail as if the device ran out of memory.
    pub fn with_limit(self, limit: Option<usize>) -> Self {
        Self { limit, ..self }
    }
    pub fn device(&self) -> &Device {
        &self.device
    }
    /// The largest size ever requested, in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
    /// Whether a buffer is currently allocated.
    ///
    /// False after a failed allocation until a later request succeeds.
    pub fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }
    /// Grows the workspace to at least `bytes`.
    ///
    /// A request that fits in the current buffer does nothing.
    ///
    /// **Errors**
    ///
    /// [`Error::Allocation`] if the device allocation fails. The workspace then has no buffer, but
    /// keeps the requested size so that the next request retries the allocation.
    pub fn reserve(&mut self, bytes: usize) -> Result<()> {
        if bytes <= self.size && (self.buffer.is_some() || bytes == 0) {
            return Ok(());
        }
        self.size = self.size.max(bytes);
        self.buffer = None;
        let bytes = self.size;
        if let Some(limit) = self.limit {
            if bytes > limit {
                return Err(Error::Allocation {
                    what: "workspace",
                    bytes,
                    source: None,
                }
                .into());
            }
        }
        let len = (bytes + ELEM_SIZE - 1) / ELEM_SIZE;
        let buffer = Buffer::zeros(self.device.clone(), len).map_err(|e| Error::Allocation {
            what: "workspace",
            bytes,
            source: Some(e.into()),
        })?;
        tracing::debug!(bytes, "workspace grown");
        self.buffer.replace(buffer);
        Ok(())
    }
    /// Host scratch of `len` floats, growing the workspace as needed.
    ///
    /// **Errors**
    ///
    /// - [`Error::Allocation`], see [`.reserve()`](Self::reserve).
    /// - If the workspace lives on a device that is not host visible.
    pub fn host_scratch(&mut self, len: usize) -> Result<&mut [f32]> {
        self.reserve(len * ELEM_SIZE)?;
        let device = &self.device;
        match self.buffer.as_mut().and_then(|x| x.as_host_slice_mut()) {
            Some(slice) => Ok(&mut slice[..len]),
            None => anyhow::bail!("Workspace on {device:?} is not host accessible!"),
        }
    }
}

impl Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("device", &self.device)
            .field("size", &self.size)
            .field("allocated", &self.buffer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_is_monotonic() -> Result<()> {
        let mut workspace = Workspace::new(Device::host());
        let mut max = 0;
        for bytes in [16, 1024, 8, 1024, 4096, 0, 2048, 4097] {
            workspace.reserve(bytes)?;
            max = usize::max(max, bytes);
            assert_eq!(workspace.size(), max);
            assert!(workspace.is_allocated());
        }
        Ok(())
    }

    #[test]
    fn smaller_request_keeps_buffer() -> Result<()> {
        let mut workspace = Workspace::new(Device::host());
        workspace.host_scratch(64)?[0] = 3.;
        assert_eq!(workspace.host_scratch(16)?[0], 3.);
        Ok(())
    }

    #[test]
    fn growth_zeroes_contents() -> Result<()> {
        let mut workspace = Workspace::new(Device::host());
        workspace.host_scratch(4)?.fill(1.);
        let scratch = workspace.host_scratch(128)?;
        assert_eq!(scratch.len(), 128);
        assert!(scratch.iter().all(|x| *x == 0.));
        Ok(())
    }

    #[test]
    fn failed_growth_leaves_no_buffer() -> Result<()> {
        let mut workspace = Workspace::new(Device::host()).with_limit(Some(1024));
        workspace.reserve(512)?;
        let error = workspace.reserve(2048).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::Allocation { bytes: 2048, .. })
        ));
        assert_eq!(workspace.size(), 2048);
        assert!(!workspace.is_allocated());
        assert!(workspace.reserve(16).is_err());
        Ok(())
    }
}
