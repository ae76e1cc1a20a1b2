//! Scratch buffer bundles owned by the sort backends.

use super::sizing::{
    block_histogram_sizes, hierarchical_sizes, BlockHistogramSizes, HierarchicalSizes,
    ELEMENT_STRIDE,
};
use crate::compute::BufferAllocator;
use crate::error::SortResult;

/// A backend's scratch buffers, allocated together and released together.
///
/// `load` either returns every buffer or none: a failed allocation drops the
/// buffers created before it.
pub trait SupportResources<B>: Sized {
    fn load<A: BufferAllocator<Buffer = B>>(allocator: &A, count: u32) -> SortResult<Self>;

    fn release<A: BufferAllocator<Buffer = B>>(self, allocator: &A);

    /// Element count the bundle was sized for.
    fn count(&self) -> u32;
}

pub struct BlockHistogramResources<B> {
    pub alt: B,
    pub alt_payload: B,
    pub pass_hist: B,
    pub global_hist: B,
    pub sizes: BlockHistogramSizes,
}

impl<B> SupportResources<B> for BlockHistogramResources<B> {
    fn load<A: BufferAllocator<Buffer = B>>(allocator: &A, count: u32) -> SortResult<Self> {
        let sizes = block_histogram_sizes(count);
        Ok(Self {
            alt: allocator.create_buffer("DeviceRadixAlt", sizes.alt, ELEMENT_STRIDE)?,
            alt_payload: allocator.create_buffer(
                "DeviceRadixAltPayload",
                sizes.alt,
                ELEMENT_STRIDE,
            )?,
            pass_hist: allocator.create_buffer(
                "DeviceRadixPassHistogram",
                sizes.pass_hist,
                ELEMENT_STRIDE,
            )?,
            global_hist: allocator.create_buffer(
                "DeviceRadixGlobalHistogram",
                sizes.global_hist,
                ELEMENT_STRIDE,
            )?,
            sizes,
        })
    }

    fn release<A: BufferAllocator<Buffer = B>>(self, allocator: &A) {
        allocator.release_buffer(self.alt);
        allocator.release_buffer(self.alt_payload);
        allocator.release_buffer(self.pass_hist);
        allocator.release_buffer(self.global_hist);
    }

    fn count(&self) -> u32 {
        self.sizes.alt
    }
}

pub struct HierarchicalResources<B> {
    pub key_scratch: B,
    pub payload_scratch: B,
    pub sum_table: B,
    pub reduced_sum_table: B,
    pub sizes: HierarchicalSizes,
}

impl<B> SupportResources<B> for HierarchicalResources<B> {
    fn load<A: BufferAllocator<Buffer = B>>(allocator: &A, count: u32) -> SortResult<Self> {
        let sizes = hierarchical_sizes(count);
        Ok(Self {
            key_scratch: allocator.create_buffer(
                "ParallelSortKeyScratch",
                sizes.scratch,
                ELEMENT_STRIDE,
            )?,
            payload_scratch: allocator.create_buffer(
                "ParallelSortPayloadScratch",
                sizes.scratch,
                ELEMENT_STRIDE,
            )?,
            sum_table: allocator.create_buffer(
                "ParallelSortSumTable",
                sizes.sum_table,
                ELEMENT_STRIDE,
            )?,
            reduced_sum_table: allocator.create_buffer(
                "ParallelSortReducedSumTable",
                sizes.reduced_sum_table,
                ELEMENT_STRIDE,
            )?,
            sizes,
        })
    }

    fn release<A: BufferAllocator<Buffer = B>>(self, allocator: &A) {
        allocator.release_buffer(self.key_scratch);
        allocator.release_buffer(self.payload_scratch);
        allocator.release_buffer(self.sum_table);
        allocator.release_buffer(self.reduced_sum_table);
    }

    fn count(&self) -> u32 {
        self.sizes.scratch
    }
}

/// Inputs of one sort: the caller's buffers plus the scratch bundle sized for them.
pub struct SortArgs<B, R> {
    pub count: u32,
    pub input_keys: B,
    pub input_values: B,
    resources: Option<R>,
}

impl<B, R: SupportResources<B>> SortArgs<B, R> {
    pub fn new(count: u32, input_keys: B, input_values: B, resources: R) -> Self {
        Self {
            count,
            input_keys,
            input_values,
            resources: Some(resources),
        }
    }

    pub fn resources(&self) -> Option<&R> {
        self.resources.as_ref()
    }

    /// Release the scratch bundle. Safe to call again once released.
    pub fn dispose<A: BufferAllocator<Buffer = B>>(&mut self, allocator: &A) {
        if let Some(resources) = self.resources.take() {
            log::debug!("releasing sort scratch for {} keys", resources.count());
            resources.release(allocator);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::compute::host::{HostBuffer, HostDevice};
    use crate::error::SortError;

    /// Fails every allocation after the first `remaining`.
    struct FlakyDevice {
        inner: HostDevice,
        remaining: Cell<u32>,
    }

    impl BufferAllocator for FlakyDevice {
        type Buffer = HostBuffer;

        fn create_buffer(&self, label: &str, count: u32, stride: u32) -> SortResult<HostBuffer> {
            if self.remaining.get() == 0 {
                return Err(SortError::Allocation(format!("{label}: out of memory")));
            }
            self.remaining.set(self.remaining.get() - 1);
            self.inner.create_buffer(label, count, stride)
        }

        fn release_buffer(&self, buffer: HostBuffer) {
            self.inner.release_buffer(buffer);
        }
    }

    #[test]
    fn test_block_histogram_bundle_lengths() {
        let device = HostDevice::new();
        let count = 2 * 3840 + 17;
        let res = BlockHistogramResources::load(&device, count).unwrap();
        assert_eq!(res.alt.len(), count as usize);
        assert_eq!(res.alt_payload.len(), count as usize);
        assert_eq!(res.pass_hist.len(), 3 * 256);
        assert_eq!(res.global_hist.len(), 256 * 4);
        assert_eq!(res.count(), count);
        assert_eq!(device.live_buffers(), 4);
        res.release(&device);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn test_hierarchical_bundle_lengths() {
        let device = HostDevice::new();
        let res = HierarchicalResources::load(&device, 100_000).unwrap();
        // 196 blocks, reduced into one.
        assert_eq!(res.sum_table.len(), 16 * 196);
        assert_eq!(res.reduced_sum_table.len(), 16);
        assert_eq!(res.key_scratch.len(), 100_000);
        assert_eq!(res.payload_scratch.len(), 100_000);
    }

    #[test]
    fn test_failed_load_leaks_nothing() {
        let device = FlakyDevice {
            inner: HostDevice::new(),
            remaining: Cell::new(2),
        };
        let result = HierarchicalResources::load(&device, 1000);
        assert!(matches!(result, Err(SortError::Allocation(_))));
        assert_eq!(device.inner.live_buffers(), 0);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let device = HostDevice::new();
        let keys = device.buffer_from("keys", &[3, 1, 2]);
        let values = device.buffer_from("values", &[0, 1, 2]);
        let res = BlockHistogramResources::load(&device, 3).unwrap();
        let mut args = SortArgs::new(3, keys, values, res);
        assert_eq!(device.live_buffers(), 6);

        args.dispose(&device);
        assert!(args.resources().is_none());
        assert_eq!(device.live_buffers(), 2);
        args.dispose(&device);
        assert_eq!(device.live_buffers(), 2);
    }
}
