use derive_more::Display;
use std::error::Error as StdError;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The pass a layer was executing when it failed.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Pass {
    /// [`Layer::forward()`](crate::layer::Layer::forward()).
    #[display(fmt = "forward")]
    Forward,
    /// [`Layer::backward()`](crate::layer::Layer::backward()).
    #[display(fmt = "backward")]
    Backward,
    /// [`Layer::update()`](crate::layer::Layer::update()).
    #[display(fmt = "update")]
    Update,
}

/// Errors raised by the graph and the training loop.
///
/// Fallible functions return [`anyhow::Result`]. Failures that callers may want to
/// match on are wrapped in this type and can be recovered with
/// [`anyhow::Error::downcast_ref()`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The network definition or training configuration is malformed.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A layer failed during a pass. The pass was abandoned.
    #[error("{pass} failed at layer {index} ({name}): {source}")]
    Pass {
        pass: Pass,
        index: usize,
        name: String,
        #[source]
        source: BoxError,
    },
    /// An allocation on the device boundary failed.
    #[error("failed to allocate {bytes} bytes for {what}")]
    Allocation {
        what: &'static str,
        bytes: usize,
        #[source]
        source: Option<BoxError>,
    },
    /// A checkpoint could not be decoded or does not match the graph.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
    pub(crate) fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }
    pub(crate) fn pass(pass: Pass, index: usize, name: &str, source: anyhow::Error) -> Self {
        Self::Pass {
            pass,
            index,
            name: name.to_string(),
            source: source.into(),
        }
    }
    /// The index and name of the failing layer, for [`Error::Pass`].
    pub fn failed_layer(&self) -> Option<(usize, &str)> {
        if let Self::Pass { index, name, .. } = self {
            Some((*index, name.as_str()))
        } else {
            None
        }
    }
}
