//! Host compute target.
//!
//! Buffers live in host memory and kernels are plain Rust functions. A
//! [`HostRecorder`] collects dispatches exactly like a GPU command encoder
//! would; [`HostRecorder::submit`] then runs them in recording order, one
//! workgroup after another. Kernels written for this target must produce the
//! same result regardless of workgroup execution order, the same as their
//! WGSL counterparts.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::rc::Rc;

use super::{BufferAllocator, CommandRecorder, KernelSet};
use crate::error::{SortError, SortResult};

/// Element stride supported by host buffers.
const HOST_STRIDE: u32 = 4;

/// Allocates [`HostBuffer`]s and keeps count of the ones still alive.
#[derive(Default)]
pub struct HostDevice {
    live: Rc<Cell<usize>>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers created by this device that have not been freed.
    pub fn live_buffers(&self) -> usize {
        self.live.get()
    }

    /// Create a buffer initialized with `data`.
    pub fn buffer_from(&self, label: &str, data: &[u32]) -> HostBuffer {
        self.live.set(self.live.get() + 1);
        HostBuffer {
            storage: Rc::new(HostStorage {
                label: label.to_string(),
                data: RefCell::new(data.to_vec()),
                live: Rc::clone(&self.live),
            }),
        }
    }
}

impl BufferAllocator for HostDevice {
    type Buffer = HostBuffer;

    fn create_buffer(&self, label: &str, count: u32, stride: u32) -> SortResult<HostBuffer> {
        if stride != HOST_STRIDE {
            return Err(SortError::Allocation(format!(
                "{label}: host buffers hold 32-bit elements, got a stride of {stride} bytes"
            )));
        }
        Ok(self.buffer_from(label, &vec![0; count as usize]))
    }

    fn release_buffer(&self, buffer: HostBuffer) {
        drop(buffer);
    }
}

struct HostStorage {
    label: String,
    data: RefCell<Vec<u32>>,
    live: Rc<Cell<usize>>,
}

impl Drop for HostStorage {
    fn drop(&mut self) {
        self.live.set(self.live.get().saturating_sub(1));
    }
}

/// Shared handle to a host-memory buffer of 32-bit elements.
#[derive(Clone)]
pub struct HostBuffer {
    storage: Rc<HostStorage>,
}

impl HostBuffer {
    pub fn label(&self) -> &str {
        &self.storage.label
    }

    pub fn len(&self) -> usize {
        self.storage.data.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_buffer(&self, other: &HostBuffer) -> bool {
        Rc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.storage.data.borrow().clone()
    }

    /// Overwrite the whole buffer. `data` must match the buffer length.
    pub fn upload(&self, data: &[u32]) -> SortResult<()> {
        let mut contents = self
            .storage
            .data
            .try_borrow_mut()
            .map_err(|_| SortError::BufferAliased(self.label().to_string()))?;
        if contents.len() != data.len() {
            return Err(SortError::Device(format!(
                "cannot upload {} elements into `{}` of {} elements",
                data.len(),
                self.label(),
                contents.len()
            )));
        }
        contents.copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("label", &self.storage.label)
            .field("len", &self.len())
            .finish()
    }
}

/// Entry point of a host kernel, called once per workgroup.
pub type HostKernelFn = fn(&KernelContext<'_>, u32) -> SortResult<()>;

#[derive(Clone, Copy)]
pub struct HostKernel {
    name: &'static str,
    entry: HostKernelFn,
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostKernel").field(&self.name).finish()
    }
}

impl HostKernel {
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// A named collection of host kernels forming one program.
pub struct HostKernelSet {
    label: &'static str,
    kernels: Vec<HostKernel>,
    unsupported: Vec<&'static str>,
}

impl HostKernelSet {
    pub fn new(label: &'static str, kernels: &[(&'static str, HostKernelFn)]) -> Self {
        Self {
            label,
            kernels: kernels
                .iter()
                .map(|&(name, entry)| HostKernel { name, entry })
                .collect(),
            unsupported: Vec::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Drop a kernel from the set, as if the program never defined it.
    pub fn without_kernel(mut self, name: &str) -> Self {
        self.kernels.retain(|k| k.name != name);
        self
    }

    /// Keep the kernel but report it as unsupported by the target.
    pub fn with_unsupported(mut self, name: &'static str) -> Self {
        self.unsupported.push(name);
        self
    }
}

impl KernelSet for HostKernelSet {
    type Kernel = HostKernel;

    fn find_kernel(&self, name: &str) -> Option<HostKernel> {
        self.kernels.iter().find(|k| k.name == name).copied()
    }

    fn is_supported(&self, kernel: HostKernel) -> bool {
        !self.unsupported.contains(&kernel.name)
    }
}

/// One recorded dispatch with the parameters and bindings it captured.
#[derive(Clone, Debug)]
pub struct HostDispatch {
    kernel: HostKernel,
    groups: u32,
    params: BTreeMap<String, u32>,
    bindings: BTreeMap<String, HostBuffer>,
}

impl HostDispatch {
    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name
    }

    pub fn groups(&self) -> u32 {
        self.groups
    }

    pub fn param(&self, name: &str) -> Option<u32> {
        self.params.get(name).copied()
    }

    pub fn binding(&self, name: &str) -> Option<&HostBuffer> {
        self.bindings.get(name)
    }

    fn execute(&self) -> SortResult<()> {
        let ctx = KernelContext {
            kernel: self.kernel.name,
            params: &self.params,
            bindings: &self.bindings,
        };
        for group in 0..self.groups {
            (self.kernel.entry)(&ctx, group)?;
        }
        Ok(())
    }
}

/// Command list for the host target.
#[derive(Default)]
pub struct HostRecorder {
    params: BTreeMap<String, u32>,
    bindings: HashMap<&'static str, BTreeMap<String, HostBuffer>>,
    dispatches: Vec<HostDispatch>,
}

impl HostRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatches(&self) -> &[HostDispatch] {
        &self.dispatches
    }

    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }

    /// Run every recorded dispatch in order.
    pub fn submit(self) -> SortResult<()> {
        for dispatch in &self.dispatches {
            dispatch.execute()?;
        }
        Ok(())
    }
}

impl CommandRecorder for HostRecorder {
    type Kernel = HostKernel;
    type Buffer = HostBuffer;

    fn set_int(&mut self, name: &str, value: u32) {
        self.params.insert(name.to_string(), value);
    }

    fn set_buffer(&mut self, kernel: HostKernel, name: &str, buffer: &HostBuffer) {
        self.bindings
            .entry(kernel.name)
            .or_default()
            .insert(name.to_string(), buffer.clone());
    }

    fn dispatch(&mut self, kernel: HostKernel, groups: u32) -> SortResult<()> {
        self.dispatches.push(HostDispatch {
            kernel,
            groups,
            params: self.params.clone(),
            bindings: self.bindings.get(kernel.name).cloned().unwrap_or_default(),
        });
        Ok(())
    }
}

/// What a host kernel sees while it runs: the captured parameters and the
/// buffers bound to it.
pub struct KernelContext<'a> {
    kernel: &'static str,
    params: &'a BTreeMap<String, u32>,
    bindings: &'a BTreeMap<String, HostBuffer>,
}

impl<'a> KernelContext<'a> {
    pub fn int(&self, name: &str) -> SortResult<u32> {
        self.params
            .get(name)
            .copied()
            .ok_or_else(|| SortError::MissingParam {
                kernel: self.kernel.to_string(),
                name: name.to_string(),
            })
    }

    fn buffer(&self, name: &str, min_len: usize) -> SortResult<&'a HostBuffer> {
        let buffer = self
            .bindings
            .get(name)
            .ok_or_else(|| SortError::MissingBinding {
                kernel: self.kernel.to_string(),
                name: name.to_string(),
            })?;
        let len = buffer.len();
        if len < min_len {
            return Err(SortError::Device(format!(
                "kernel `{}` needs {min_len} elements in `{}`, it holds {len}",
                self.kernel,
                buffer.label()
            )));
        }
        Ok(buffer)
    }

    /// Borrow the buffer bound to `name`, which must hold at least `min_len` elements.
    pub fn read(&self, name: &str, min_len: usize) -> SortResult<Ref<'a, Vec<u32>>> {
        let buffer = self.buffer(name, min_len)?;
        buffer
            .storage
            .data
            .try_borrow()
            .map_err(|_| SortError::BufferAliased(buffer.label().to_string()))
    }

    pub fn write(&self, name: &str, min_len: usize) -> SortResult<RefMut<'a, Vec<u32>>> {
        let buffer = self.buffer(name, min_len)?;
        buffer
            .storage
            .data
            .try_borrow_mut()
            .map_err(|_| SortError::BufferAliased(buffer.label().to_string()))
    }
}
