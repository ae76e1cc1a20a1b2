//! GPU radix sort for splat depth ordering.
//!
//! Sorts 32-bit keys together with a 32-bit payload (usually the splat index)
//! on a compute target. Two backends are available:
//!
//! - [`SortType::BlockHistogram`]: 8-bit digits, four passes. Block-histogram
//!   reduce-then-scan after GPUSorting (MIT).
//! - [`SortType::Hierarchical`]: 4-bit digits, eight passes over at most
//!   800 workgroups. After the FidelityFX parallel sort (MIT).
//!
//! [`GpuSorter`] owns the selected backend and its scratch buffers. Both
//! backends run an even number of passes, so the sorted keys and payloads end
//! up back in the caller's buffers.

pub mod block_histogram;
pub mod hierarchical;
pub mod resources;
pub mod sizing;

use std::fmt;
use std::str::FromStr;

use crate::compute::host::HostKernelSet;
use crate::compute::{BufferAllocator, CommandRecorder, KernelSet};
use crate::error::{SortError, SortResult};
use block_histogram::{BlockHistogramArgs, BlockHistogramSort};
use hierarchical::{HierarchicalArgs, HierarchicalSort};
use resources::{SortArgs, SupportResources};
use sizing::{
    result_location, SortLocation, DEVICE_RADIX_SORT_PASSES, ELEMENT_STRIDE,
    PARALLEL_SORT_PASSES,
};

/// Which radix sort backend a [`GpuSorter`] runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SortType {
    #[default]
    None,
    BlockHistogram,
    Hierarchical,
}

impl SortType {
    pub const ALL: [SortType; 3] = [
        SortType::None,
        SortType::BlockHistogram,
        SortType::Hierarchical,
    ];

    /// Host kernels of the backend's program, `None` for [`SortType::None`].
    pub fn host_kernels(self) -> Option<HostKernelSet> {
        match self {
            SortType::None => None,
            SortType::BlockHistogram => Some(block_histogram::host_kernels()),
            SortType::Hierarchical => Some(hierarchical::host_kernels()),
        }
    }

    /// WGSL program of the backend, `None` for [`SortType::None`].
    #[cfg(feature = "gpu")]
    pub fn wgpu_program(self) -> Option<crate::compute::wgpu_target::WgpuProgram> {
        match self {
            SortType::None => None,
            SortType::BlockHistogram => Some(block_histogram::wgpu_program()),
            SortType::Hierarchical => Some(hierarchical::wgpu_program()),
        }
    }

    fn passes(self) -> u32 {
        match self {
            SortType::None => 0,
            SortType::BlockHistogram => DEVICE_RADIX_SORT_PASSES,
            SortType::Hierarchical => PARALLEL_SORT_PASSES,
        }
    }
}

impl fmt::Display for SortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SortType::None => "none",
            SortType::BlockHistogram => "block-histogram",
            SortType::Hierarchical => "hierarchical",
        };
        f.write_str(name)
    }
}

impl FromStr for SortType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SortType::None),
            "block-histogram" | "block" => Ok(SortType::BlockHistogram),
            "hierarchical" | "parallel" => Ok(SortType::Hierarchical),
            other => Err(format!(
                "unknown sort type `{other}`, expected none, block-histogram or hierarchical"
            )),
        }
    }
}

enum Backend<K, B> {
    None,
    BlockHistogram {
        sort: BlockHistogramSort<K>,
        args: Option<BlockHistogramArgs<B>>,
    },
    Hierarchical {
        sort: HierarchicalSort<K>,
        args: Option<HierarchicalArgs<B>>,
    },
}

/// Sorts key/payload buffers with one selected backend.
///
/// The kernel set passed to [`GpuSorter::new`] must hold the program of the
/// selected backend, see [`SortType::host_kernels`] and
/// `SortType::wgpu_program`.
pub struct GpuSorter<K, B> {
    sort_type: SortType,
    backend: Backend<K, B>,
}

impl<K: Copy, B: Clone> GpuSorter<K, B> {
    pub fn new<S: KernelSet<Kernel = K>>(sort_type: SortType, kernels: &S) -> Self {
        let backend = match sort_type {
            SortType::None => Backend::None,
            SortType::BlockHistogram => Backend::BlockHistogram {
                sort: BlockHistogramSort::new(kernels),
                args: None,
            },
            SortType::Hierarchical => Backend::Hierarchical {
                sort: HierarchicalSort::new(kernels),
                args: None,
            },
        };
        let sorter = Self { sort_type, backend };
        if sort_type != SortType::None && !sorter.valid() {
            log::warn!("{sort_type} sort is unavailable: kernels missing or unsupported");
        }
        sorter
    }

    pub fn sort_type(&self) -> SortType {
        self.sort_type
    }

    /// Whether a backend is selected and all its kernels validated.
    pub fn valid(&self) -> bool {
        match &self.backend {
            Backend::None => false,
            Backend::BlockHistogram { sort, .. } => sort.valid(),
            Backend::Hierarchical { sort, .. } => sort.valid(),
        }
    }

    /// Element count of the current scratch bundle, zero when uninitialized.
    pub fn count(&self) -> u32 {
        match &self.backend {
            Backend::None => 0,
            Backend::BlockHistogram { args, .. } => args.as_ref().map_or(0, |a| a.count),
            Backend::Hierarchical { args, .. } => args.as_ref().map_or(0, |a| a.count),
        }
    }

    /// Largest count [`initialize`](Self::initialize) accepts with `allocator`.
    pub fn max_count<A: BufferAllocator>(&self, allocator: &A) -> u64 {
        let by_buffers = allocator.max_buffer_elements(ELEMENT_STRIDE);
        let by_backend = match &self.backend {
            Backend::None => 0,
            Backend::BlockHistogram { sort, .. } => sort.max_count(),
            // Workgroup counts are bounded by the threadgroup cap.
            Backend::Hierarchical { .. } => u64::from(u32::MAX),
        };
        by_buffers.min(by_backend)
    }

    /// Adopt `keys` and `payloads` as the buffers to sort and size the scratch
    /// bundle for `count` elements.
    ///
    /// The bundle is kept when `count` matches the previous call. Otherwise
    /// the old bundle is released before the new one is allocated.
    pub fn initialize<A: BufferAllocator<Buffer = B>>(
        &mut self,
        allocator: &A,
        count: u32,
        keys: &B,
        payloads: &B,
    ) -> SortResult<()> {
        if self.sort_type == SortType::None {
            log::debug!("no sort backend selected, skipping initialization");
            return Ok(());
        }
        if !self.valid() {
            return Err(SortError::InvalidBackend(self.sort_type));
        }
        let limit = self.max_count(allocator);
        if u64::from(count) > limit {
            return Err(SortError::CountTooLarge {
                sort_type: self.sort_type,
                count,
                limit,
            });
        }

        match &mut self.backend {
            Backend::None => Ok(()),
            Backend::BlockHistogram { args, .. } => {
                reinitialize(args, allocator, count, keys, payloads)
            }
            Backend::Hierarchical { args, .. } => {
                reinitialize(args, allocator, count, keys, payloads)
            }
        }
    }

    /// Record the whole sort into `cmd` and report where the result will be.
    pub fn dispatch<R>(&self, cmd: &mut R) -> SortResult<SortLocation>
    where
        R: CommandRecorder<Kernel = K, Buffer = B>,
    {
        match &self.backend {
            Backend::None => Err(SortError::NoBackend),
            Backend::BlockHistogram { sort, args } => {
                if !sort.valid() {
                    return Err(SortError::InvalidBackend(self.sort_type));
                }
                sort.dispatch(cmd, args.as_ref().ok_or(SortError::NotInitialized)?)
            }
            Backend::Hierarchical { sort, args } => {
                if !sort.valid() {
                    return Err(SortError::InvalidBackend(self.sort_type));
                }
                sort.dispatch(cmd, args.as_ref().ok_or(SortError::NotInitialized)?)
            }
        }
    }

    /// Keys and payloads holding the result once a dispatch has executed.
    pub fn sorted_buffers(&self) -> Option<(&B, &B)> {
        let location = result_location(self.sort_type.passes());
        match &self.backend {
            Backend::None => None,
            Backend::BlockHistogram { args, .. } => {
                let args = args.as_ref()?;
                match location {
                    SortLocation::Input => Some((&args.input_keys, &args.input_values)),
                    SortLocation::Alternate => args
                        .resources()
                        .map(|r| (&r.alt, &r.alt_payload)),
                }
            }
            Backend::Hierarchical { args, .. } => {
                let args = args.as_ref()?;
                match location {
                    SortLocation::Input => Some((&args.input_keys, &args.input_values)),
                    SortLocation::Alternate => args
                        .resources()
                        .map(|r| (&r.key_scratch, &r.payload_scratch)),
                }
            }
        }
    }

    /// Release the scratch bundle. Does nothing when already released.
    pub fn dispose_resources<A: BufferAllocator<Buffer = B>>(&mut self, allocator: &A) {
        match &mut self.backend {
            Backend::None => {}
            Backend::BlockHistogram { args, .. } => {
                if let Some(mut args) = args.take() {
                    args.dispose(allocator);
                }
            }
            Backend::Hierarchical { args, .. } => {
                if let Some(mut args) = args.take() {
                    args.dispose(allocator);
                }
            }
        }
    }
}

fn reinitialize<A, B, R>(
    slot: &mut Option<SortArgs<B, R>>,
    allocator: &A,
    count: u32,
    keys: &B,
    payloads: &B,
) -> SortResult<()>
where
    A: BufferAllocator<Buffer = B>,
    B: Clone,
    R: SupportResources<B>,
{
    if let Some(args) = slot.as_mut() {
        if args.count == count && args.resources().is_some() {
            args.input_keys = keys.clone();
            args.input_values = payloads.clone();
            return Ok(());
        }
    }
    if let Some(mut old) = slot.take() {
        old.dispose(allocator);
    }

    log::debug!("allocating sort scratch for {count} keys");
    let resources = R::load(allocator, count)?;
    *slot = Some(SortArgs::new(count, keys.clone(), payloads.clone(), resources));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::host::{HostBuffer, HostDevice, HostKernel, HostRecorder};

    type HostSorter = GpuSorter<HostKernel, HostBuffer>;

    fn sorter(sort_type: SortType) -> HostSorter {
        let kernels = sort_type
            .host_kernels()
            .unwrap_or_else(block_histogram::host_kernels);
        GpuSorter::new(sort_type, &kernels)
    }

    /// Host device with a tiny buffer limit.
    struct SmallDevice(HostDevice);

    impl BufferAllocator for SmallDevice {
        type Buffer = HostBuffer;

        fn create_buffer(&self, label: &str, count: u32, stride: u32) -> SortResult<HostBuffer> {
            self.0.create_buffer(label, count, stride)
        }

        fn release_buffer(&self, buffer: HostBuffer) {
            self.0.release_buffer(buffer);
        }

        fn max_buffer_elements(&self, _stride: u32) -> u64 {
            1000
        }
    }

    #[test]
    fn test_sort_type_names_round_trip() {
        for sort_type in SortType::ALL {
            assert_eq!(sort_type.to_string().parse::<SortType>(), Ok(sort_type));
        }
        assert!("bitonic".parse::<SortType>().is_err());
    }

    #[test]
    fn test_none_backend_is_inactive() {
        let device = HostDevice::new();
        let keys = device.buffer_from("keys", &[2, 1]);
        let values = device.buffer_from("values", &[0, 1]);
        let mut sorter = sorter(SortType::None);

        assert!(!sorter.valid());
        sorter.initialize(&device, 2, &keys, &values).unwrap();
        assert_eq!(device.live_buffers(), 2);

        let mut cmd = HostRecorder::new();
        assert_eq!(sorter.dispatch(&mut cmd), Err(SortError::NoBackend));
        assert!(cmd.is_empty());
        assert!(sorter.sorted_buffers().is_none());
    }

    #[test]
    fn test_invalid_backend_rejects_initialize_and_dispatch() {
        let device = HostDevice::new();
        let keys = device.buffer_from("keys", &[2, 1]);
        let kernels = hierarchical::host_kernels().with_unsupported(hierarchical::KERNEL_SCATTER);
        let mut sorter: HostSorter = GpuSorter::new(SortType::Hierarchical, &kernels);

        assert!(!sorter.valid());
        assert_eq!(
            sorter.initialize(&device, 2, &keys, &keys),
            Err(SortError::InvalidBackend(SortType::Hierarchical))
        );
        let mut cmd = HostRecorder::new();
        assert_eq!(
            sorter.dispatch(&mut cmd),
            Err(SortError::InvalidBackend(SortType::Hierarchical))
        );
    }

    #[test]
    fn test_wrong_program_invalidates_backend() {
        let kernels = hierarchical::host_kernels();
        let sorter: HostSorter = GpuSorter::new(SortType::BlockHistogram, &kernels);
        assert!(!sorter.valid());
    }

    #[test]
    fn test_dispatch_before_initialize() {
        let sorter = sorter(SortType::BlockHistogram);
        let mut cmd = HostRecorder::new();
        assert_eq!(sorter.dispatch(&mut cmd), Err(SortError::NotInitialized));
    }

    #[test]
    fn test_reinitialize_reuses_or_replaces_scratch() {
        let device = HostDevice::new();
        let keys = device.buffer_from("keys", &[0; 100]);
        let values = device.buffer_from("values", &[0; 100]);
        let mut sorter = sorter(SortType::Hierarchical);

        sorter.initialize(&device, 100, &keys, &values).unwrap();
        assert_eq!(device.live_buffers(), 6);

        let other_keys = device.buffer_from("other keys", &[0; 100]);
        sorter.initialize(&device, 100, &other_keys, &values).unwrap();
        assert_eq!(device.live_buffers(), 7);
        let (sorted_keys, _) = sorter.sorted_buffers().unwrap();
        assert!(sorted_keys.same_buffer(&other_keys));

        let small_keys = device.buffer_from("small keys", &[0; 10]);
        let small_values = device.buffer_from("small values", &[0; 10]);
        sorter
            .initialize(&device, 10, &small_keys, &small_values)
            .unwrap();
        assert_eq!(sorter.count(), 10);
        // Four scratch buffers plus the five caller buffers.
        assert_eq!(device.live_buffers(), 9);

        sorter.dispose_resources(&device);
        sorter.dispose_resources(&device);
        assert_eq!(sorter.count(), 0);
        assert_eq!(device.live_buffers(), 5);
    }

    #[test]
    fn test_count_above_buffer_limit() {
        let device = SmallDevice(HostDevice::new());
        let keys = device.0.buffer_from("keys", &[0; 4]);
        let mut sorter = sorter(SortType::BlockHistogram);

        sorter.initialize(&device, 1000, &keys, &keys).unwrap();
        assert_eq!(
            sorter.initialize(&device, 1001, &keys, &keys),
            Err(SortError::CountTooLarge {
                sort_type: SortType::BlockHistogram,
                count: 1001,
                limit: 1000,
            })
        );
        // The previous bundle survives a rejected request.
        assert_eq!(sorter.count(), 1000);
    }

    #[test]
    fn test_dispatch_sorts_in_place() {
        let device = HostDevice::new();
        for sort_type in [SortType::BlockHistogram, SortType::Hierarchical] {
            let keys = device.buffer_from("keys", &[9, 0xffff_ffff, 3, 0, 3]);
            let values = device.buffer_from("values", &[0, 1, 2, 3, 4]);
            let mut sorter = sorter(sort_type);
            sorter.initialize(&device, 5, &keys, &values).unwrap();

            let mut cmd = HostRecorder::new();
            assert_eq!(sorter.dispatch(&mut cmd), Ok(SortLocation::Input));
            cmd.submit().unwrap();

            let (sorted_keys, sorted_values) = sorter.sorted_buffers().unwrap();
            assert_eq!(sorted_keys.to_vec(), vec![0, 3, 3, 9, 0xffff_ffff]);
            assert_eq!(sorted_values.to_vec(), vec![3, 2, 4, 0, 1]);
        }
    }
}
