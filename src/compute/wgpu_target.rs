//! `wgpu` compute target.
//!
//! A [`WgpuProgram`] is one WGSL module plus the names of its integer
//! parameters and storage buffers. Parameters are packed in declaration order
//! into a uniform struct at binding 0; buffer `i` of the program lives at
//! binding `i + 1`. Every kernel gets its own bind group layout holding only the
//! buffers it touches.

use std::collections::HashMap;
use std::sync::Arc;

use wgpu::util::DeviceExt;

use super::{BufferAllocator, CommandRecorder, KernelSet};
use crate::error::{SortError, SortResult};

/// Buffers are shared handles so the sorter and the caller can both hold them.
pub type WgpuBuffer = Arc<wgpu::Buffer>;

const STORAGE_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

pub struct WgpuDevice {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
}

impl WgpuDevice {
    /// Wrap a device owned by an existing renderer.
    pub fn from_parts(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self { device, queue }
    }

    /// Open the default adapter without a surface.
    pub fn request() -> SortResult<Self> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    force_fallback_adapter: false,
                    compatible_surface: None,
                })
                .await
                .map_err(|e| SortError::Device(format!("no suitable adapter: {e}")))?;
            log::info!("sorting on {:?}", adapter.get_info().name);

            let (device, queue) = adapter
                .request_device(&wgpu::DeviceDescriptor {
                    label: Some("Splat Sort Device"),
                    required_limits: adapter.limits(),
                    ..Default::default()
                })
                .await
                .map_err(|e| SortError::Device(e.to_string()))?;
            Ok(Self { device, queue })
        })
    }

    /// Create a storage buffer holding `data`.
    pub fn buffer_from(&self, label: &str, data: &[u32]) -> WgpuBuffer {
        // Zero-sized buffers cannot be bound.
        let contents: &[u32] = if data.is_empty() { &[0] } else { data };
        Arc::new(
            self.device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some(label),
                    contents: bytemuck::cast_slice(contents),
                    usage: STORAGE_USAGE,
                }),
        )
    }

    pub fn upload(&self, buffer: &WgpuBuffer, data: &[u32]) {
        self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
    }

    /// Copy the first `count` elements of `buffer` back to the host. Waits for
    /// all submitted work.
    pub fn read_u32(&self, buffer: &WgpuBuffer, count: u32) -> SortResult<Vec<u32>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let size = u64::from(count) * 4;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Splat Sort Readback"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Splat Sort Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| SortError::Device(e.to_string()))?;
        rx.recv()
            .map_err(|e| SortError::Device(e.to_string()))?
            .map_err(|e| SortError::Device(e.to_string()))?;

        let data = bytemuck::cast_slice::<u8, u32>(&slice.get_mapped_range()).to_vec();
        staging.unmap();
        Ok(data)
    }

    fn max_binding_bytes(&self) -> u64 {
        let limits = self.device.limits();
        limits
            .max_buffer_size
            .min(u64::from(limits.max_storage_buffer_binding_size))
    }
}

impl BufferAllocator for WgpuDevice {
    type Buffer = WgpuBuffer;

    fn create_buffer(&self, label: &str, count: u32, stride: u32) -> SortResult<WgpuBuffer> {
        let size = (u64::from(count) * u64::from(stride)).max(4);
        if size > self.max_binding_bytes() {
            return Err(SortError::Allocation(format!(
                "{label}: {size} bytes exceeds the device binding limit of {}",
                self.max_binding_bytes()
            )));
        }
        Ok(Arc::new(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: STORAGE_USAGE,
            mapped_at_creation: false,
        })))
    }

    fn release_buffer(&self, buffer: WgpuBuffer) {
        buffer.destroy();
    }

    fn max_buffer_elements(&self, stride: u32) -> u64 {
        self.max_binding_bytes() / u64::from(stride.max(1))
    }
}

/// One entry point of a program and the buffers it binds.
#[derive(Debug, Clone, Copy)]
pub struct KernelDesc {
    pub name: &'static str,
    pub entry_point: &'static str,
    pub buffers: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct WgpuProgram {
    pub label: &'static str,
    pub source: String,
    pub params: &'static [&'static str],
    pub buffers: &'static [&'static str],
    pub kernels: &'static [KernelDesc],
}

impl WgpuProgram {
    fn binding_of(&self, buffer: &str) -> Option<u32> {
        self.buffers
            .iter()
            .position(|&b| b == buffer)
            .map(|i| i as u32 + 1)
    }
}

struct CompiledKernel {
    name: &'static str,
    /// (buffer name, binding) for every buffer the kernel touches.
    bindings: Vec<(&'static str, u32)>,
    layout: wgpu::BindGroupLayout,
    pipeline: Option<wgpu::ComputePipeline>,
}

/// Index of a kernel within its [`WgpuKernelSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WgpuKernel(usize);

pub struct WgpuKernelSet {
    label: &'static str,
    params: &'static [&'static str],
    kernels: Vec<CompiledKernel>,
    max_dispatch_groups: u32,
}

fn storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: false },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl WgpuKernelSet {
    /// Compile `program`. A kernel whose pipeline fails validation is kept but
    /// reported as unsupported.
    pub fn new(device: &WgpuDevice, program: &WgpuProgram) -> Self {
        let device_ref = &device.device;

        device_ref.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device_ref.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(program.label),
            source: wgpu::ShaderSource::Wgsl(program.source.as_str().into()),
        });
        let module_ok = match pollster::block_on(device_ref.pop_error_scope()) {
            Some(err) => {
                log::warn!("{} failed to compile: {err}", program.label);
                false
            }
            None => true,
        };

        let kernels = program
            .kernels
            .iter()
            .map(|desc| {
                let mut entries = vec![wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }];
                let bindings: Vec<_> = desc
                    .buffers
                    .iter()
                    .filter_map(|&name| program.binding_of(name).map(|b| (name, b)))
                    .collect();
                entries.extend(bindings.iter().map(|&(_, b)| storage_entry(b)));
                let layout = device_ref.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(desc.name),
                    entries: &entries,
                });

                let pipeline = if module_ok {
                    device_ref.push_error_scope(wgpu::ErrorFilter::Validation);
                    let pipeline_layout =
                        device_ref.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                            label: Some(desc.name),
                            bind_group_layouts: &[&layout],
                            push_constant_ranges: &[],
                        });
                    let pipeline =
                        device_ref.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                            label: Some(desc.name),
                            layout: Some(&pipeline_layout),
                            module: &shader,
                            entry_point: Some(desc.entry_point),
                            compilation_options: Default::default(),
                            cache: None,
                        });
                    match pollster::block_on(device_ref.pop_error_scope()) {
                        Some(err) => {
                            log::warn!("kernel `{}` is unsupported: {err}", desc.name);
                            None
                        }
                        None => Some(pipeline),
                    }
                } else {
                    None
                };

                CompiledKernel {
                    name: desc.name,
                    bindings,
                    layout,
                    pipeline,
                }
            })
            .collect();

        Self {
            label: program.label,
            params: program.params,
            kernels,
            max_dispatch_groups: device_ref.limits().max_compute_workgroups_per_dimension,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl KernelSet for WgpuKernelSet {
    type Kernel = WgpuKernel;

    fn find_kernel(&self, name: &str) -> Option<WgpuKernel> {
        self.kernels
            .iter()
            .position(|k| k.name == name)
            .map(WgpuKernel)
    }

    fn is_supported(&self, kernel: WgpuKernel) -> bool {
        self.kernels
            .get(kernel.0)
            .is_some_and(|k| k.pipeline.is_some())
    }

    fn max_dispatch_groups(&self) -> u32 {
        self.max_dispatch_groups
    }
}

/// Records sort dispatches into a `wgpu` command encoder.
///
/// Every dispatch gets its own compute pass, so `wgpu` orders its storage
/// writes before any later dispatch reads them.
pub struct WgpuRecorder<'a> {
    device: &'a WgpuDevice,
    kernels: &'a WgpuKernelSet,
    encoder: wgpu::CommandEncoder,
    params: HashMap<String, u32>,
    bindings: HashMap<usize, HashMap<String, WgpuBuffer>>,
}

impl<'a> WgpuRecorder<'a> {
    pub fn new(device: &'a WgpuDevice, kernels: &'a WgpuKernelSet) -> Self {
        let encoder = device
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(kernels.label),
            });
        Self {
            device,
            kernels,
            encoder,
            params: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    /// Uniform contents: program parameters in declaration order, padded to
    /// 16 bytes. Parameters never set read as zero.
    fn uniform_data(&self) -> Vec<u32> {
        let mut data: Vec<u32> = self
            .kernels
            .params
            .iter()
            .map(|&name| self.params.get(name).copied().unwrap_or(0))
            .collect();
        data.resize(data.len().div_ceil(4).max(1) * 4, 0);
        data
    }

    pub fn finish(self) -> wgpu::CommandBuffer {
        self.encoder.finish()
    }

    pub fn submit(self) {
        let queue = &self.device.queue;
        queue.submit(Some(self.encoder.finish()));
    }
}

impl CommandRecorder for WgpuRecorder<'_> {
    type Kernel = WgpuKernel;
    type Buffer = WgpuBuffer;

    fn set_int(&mut self, name: &str, value: u32) {
        self.params.insert(name.to_string(), value);
    }

    fn set_buffer(&mut self, kernel: WgpuKernel, name: &str, buffer: &WgpuBuffer) {
        self.bindings
            .entry(kernel.0)
            .or_default()
            .insert(name.to_string(), Arc::clone(buffer));
    }

    fn dispatch(&mut self, kernel: WgpuKernel, groups: u32) -> SortResult<()> {
        let compiled = self
            .kernels
            .kernels
            .get(kernel.0)
            .ok_or_else(|| SortError::Device(format!("unknown kernel index {}", kernel.0)))?;
        let pipeline = compiled.pipeline.as_ref().ok_or_else(|| {
            SortError::Device(format!("kernel `{}` is not supported", compiled.name))
        })?;
        if groups > self.kernels.max_dispatch_groups {
            return Err(SortError::Device(format!(
                "kernel `{}` dispatched with {groups} workgroups, the device allows {}",
                compiled.name, self.kernels.max_dispatch_groups
            )));
        }

        let device = &self.device.device;
        let uniform = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Splat Sort Params"),
            contents: bytemuck::cast_slice(&self.uniform_data()),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let bound = self.bindings.get(&kernel.0);
        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: uniform.as_entire_binding(),
        }];
        for &(name, binding) in &compiled.bindings {
            let buffer = bound
                .and_then(|b| b.get(name))
                .ok_or_else(|| SortError::MissingBinding {
                    kernel: compiled.name.to_string(),
                    name: name.to_string(),
                })?;
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            });
        }
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(compiled.name),
            layout: &compiled.layout,
            entries: &entries,
        });

        let mut pass = self
            .encoder
            .begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(compiled.name),
                timestamp_writes: None,
            });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(groups, 1, 1);
        Ok(())
    }
}
