use bytes::Bytes;

use crate::{
    engine::SampleRef,
    port::{PortId, SourceKey},
};

/// An output unit owned by the host. Always a copy of the engine's sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    /// Nanoseconds, when the engine knows it.
    pub duration: Option<u64>,
    pub pts: Option<u64>,
    pub source_key: Option<SourceKey>,
    pub port: PortId,
}

impl Frame {
    pub(crate) fn copy_from(
        sample: SampleRef<'_>,
        port: PortId,
        source_key: Option<SourceKey>,
    ) -> Self {
        Self {
            data: Bytes::copy_from_slice(sample.data),
            duration: sample.duration,
            pts: sample.pts,
            source_key,
            port,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
