//! Radix sorting of splat depth keys on the GPU.
//!
//! ```no_run
//! # #[cfg(feature = "gpu")]
//! # fn main() -> splatsort::SortResult<()> {
//! use splatsort::compute::wgpu_target::{WgpuDevice, WgpuKernelSet, WgpuRecorder};
//! use splatsort::{GpuSorter, SortType};
//!
//! let device = WgpuDevice::request()?;
//! let sort_type = SortType::BlockHistogram;
//! let program = sort_type.wgpu_program().ok_or(splatsort::SortError::NoBackend)?;
//! let kernels = WgpuKernelSet::new(&device, &program);
//!
//! let depths = [0.5f32, 0.1, 0.9].map(|d| d.to_bits());
//! let keys = device.buffer_from("depth keys", &depths);
//! let indices = device.buffer_from("splat indices", &[0, 1, 2]);
//!
//! let mut sorter = GpuSorter::new(sort_type, &kernels);
//! sorter.initialize(&device, 3, &keys, &indices)?;
//! let mut cmd = WgpuRecorder::new(&device, &kernels);
//! sorter.dispatch(&mut cmd)?;
//! cmd.submit();
//! assert_eq!(device.read_u32(&indices, 3)?, vec![1, 0, 2]);
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "gpu"))]
//! # fn main() {}
//! ```

pub mod compute;
pub mod error;
pub mod radix_sort;

pub use error::{SortError, SortResult};
pub use radix_sort::sizing::SortLocation;
pub use radix_sort::{GpuSorter, SortType};
