// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The one staging buffer uploads write into.

The buffer only grows.  When a request exceeds the current capacity, a replacement of
`max(next_power_of_two(required), minimum)` elements is allocated and the old one disposed, so
nobody ever observes a buffer mid-resize.

The manager is not synchronized; it lives inside the uploader's [crate::gate::AsyncGate], and
only the gate holder calls it.
*/

use crate::context::{MainContext, smuggle};
use crate::error::AllocationError;
use crate::imp::Backend;
use std::sync::Arc;

/// Capacity allocated for a request of `required` elements.
///
/// ```
/// use texture_streaming::staging::growth_capacity;
/// assert_eq!(growth_capacity(1000, 64), Some(1024));
/// assert_eq!(growth_capacity(3, 64), Some(64));
/// assert_eq!(growth_capacity(usize::MAX, 64), None);
/// ```
pub fn growth_capacity(required: usize, minimum: usize) -> Option<usize> {
    required
        .checked_next_power_of_two()
        .map(|size| size.max(minimum))
}

/// Owns the staging buffer.  See the [module documentation](self).
pub struct StagingBufferManager<B: Backend> {
    backend: Arc<B>,
    context: Arc<dyn MainContext>,
    minimum: usize,
    label: String,
    buffer: Option<B::Buffer>,
    capacity: usize,
    reallocations: usize,
}

impl<B: Backend> StagingBufferManager<B> {
    pub fn new(
        backend: Arc<B>,
        context: Arc<dyn MainContext>,
        minimum: usize,
        label: impl Into<String>,
    ) -> Self {
        StagingBufferManager {
            backend,
            context,
            minimum,
            label: label.into(),
            buffer: None,
            capacity: 0,
            reallocations: 0,
        }
    }

    /// Current capacity in elements; zero before the first allocation.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers allocated so far.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    pub fn buffer(&self) -> Option<&B::Buffer> {
        self.buffer.as_ref()
    }

    /**
    Returns a buffer of at least `required` elements, growing if necessary.

    On failure the previous buffer, if any, stays in place.
    */
    pub async fn ensure(&mut self, required: usize) -> Result<&B::Buffer, AllocationError> {
        if self.buffer.is_none() || self.capacity < required {
            let size = growth_capacity(required, self.minimum).ok_or(AllocationError::TooLarge {
                what: "staging buffer",
                bytes: u64::MAX,
                limit: usize::MAX as u64,
            })?;
            logwise::info_sync!(
                "growing staging buffer from {old} to {new} elements",
                old = self.capacity,
                new = size
            );
            let backend = self.backend.clone();
            let label = format!("{} staging buffer", self.label);
            let created = smuggle(&*self.context, "create staging buffer", move || {
                backend.create_buffer(size, &label)
            })
            .await?;
            let old = self.buffer.replace(created);
            self.capacity = size;
            self.reallocations += 1;
            if let Some(old) = old {
                let backend = self.backend.clone();
                smuggle(&*self.context, "dispose staging buffer", move || {
                    backend.dispose_buffer(old)
                })
                .await;
            }
        }
        //set above when missing
        self.buffer
            .as_ref()
            .ok_or_else(|| AllocationError::Backend("staging buffer missing after allocation".into()))
    }

    /// Disposes the buffer.  A later [Self::ensure] allocates afresh.
    pub async fn dispose(&mut self) {
        if let Some(old) = self.buffer.take() {
            logwise::info_sync!(
                "disposing staging buffer of {capacity} elements",
                capacity = self.capacity
            );
            let backend = self.backend.clone();
            smuggle(&*self.context, "dispose staging buffer", move || {
                backend.dispose_buffer(old)
            })
            .await;
        }
        self.capacity = 0;
    }
}

impl<B: Backend> std::fmt::Debug for StagingBufferManager<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBufferManager")
            .field("capacity", &self.capacity)
            .field("minimum", &self.minimum)
            .field("reallocations", &self.reallocations)
            .field("buffer", &self.buffer)
            .finish()
    }
}
