//! Compute target abstraction used by the sort backends.
//!
//! The sorter needs three services from its environment:
//!
//! - [`BufferAllocator`]: linear buffers of a given element count and stride.
//! - [`KernelSet`]: a compiled program whose kernels can be looked up by name
//!   and queried for support on the current device.
//! - [`CommandRecorder`]: records parameter bindings and dispatches, in order,
//!   for later submission.
//!
//! Two targets ship with the crate: [`host`] executes the kernels on the CPU
//! one workgroup at a time, and `wgpu_target` (feature `gpu`) runs WGSL
//! programs through `wgpu`.

pub mod host;
#[cfg(feature = "gpu")]
pub mod wgpu_target;

use crate::error::SortResult;

/// Allocates the linear buffers the sorter works on.
///
/// Buffer handles are cheap to clone and free their memory when the last
/// clone is dropped; [`release_buffer`](Self::release_buffer) releases it
/// immediately.
pub trait BufferAllocator {
    type Buffer: Clone;

    /// Create a buffer holding `count` elements of `stride` bytes each.
    fn create_buffer(&self, label: &str, count: u32, stride: u32) -> SortResult<Self::Buffer>;

    fn release_buffer(&self, buffer: Self::Buffer);

    /// Largest element count a single buffer of `stride` bytes can hold.
    fn max_buffer_elements(&self, stride: u32) -> u64 {
        u64::from(u32::MAX) / u64::from(stride.max(1))
    }
}

/// A compiled set of named compute kernels.
pub trait KernelSet {
    type Kernel: Copy;

    fn find_kernel(&self, name: &str) -> Option<Self::Kernel>;

    fn is_supported(&self, kernel: Self::Kernel) -> bool;

    /// Largest workgroup count accepted by a single dispatch.
    fn max_dispatch_groups(&self) -> u32 {
        u32::MAX
    }
}

/// Records kernel parameters, bindings and dispatches on one command stream.
///
/// Integer parameters are shared by every kernel of the program, buffer
/// bindings belong to a single kernel. Both are captured when
/// [`dispatch`](Self::dispatch) is called, so later updates never affect an
/// earlier dispatch. Each dispatch observes every write of the dispatches
/// recorded before it.
pub trait CommandRecorder {
    type Kernel: Copy;
    type Buffer;

    fn set_int(&mut self, name: &str, value: u32);

    fn set_buffer(&mut self, kernel: Self::Kernel, name: &str, buffer: &Self::Buffer);

    fn dispatch(&mut self, kernel: Self::Kernel, groups: u32) -> SortResult<()>;
}

/// Looks up every kernel in `names` and checks it is supported.
///
/// Returns `None` when any kernel is absent or unsupported.
pub(crate) fn resolve_kernels<S: KernelSet, const N: usize>(
    set: &S,
    names: [&str; N],
) -> Option<[S::Kernel; N]> {
    let mut found = Vec::with_capacity(N);
    for name in names {
        let kernel = set.find_kernel(name)?;
        if !set.is_supported(kernel) {
            log::debug!("kernel `{name}` is not supported by the compute target");
            return None;
        }
        found.push(kernel);
    }
    found.try_into().ok()
}
