//! Block-histogram radix sort: 8-bit LSD, reduce-then-scan.
//!
//! Each of the four passes runs three kernels over the keys:
//!
//! 1. **Upsweep** counts the pass digit in every partition of
//!    [`DEVICE_RADIX_SORT_PARTITION_SIZE`] keys into the pass histogram and
//!    adds the counts into the global histogram.
//! 2. **Scan** turns the pass histogram into output offsets, one workgroup per
//!    digit. The global histogram supplies the base offset of each digit.
//! 3. **Downsweep** walks every partition again and scatters keys and payloads
//!    into the alternate buffers.
//!
//! The global histogram is cleared once, before the first pass, by
//! `InitDeviceRadixSort`. Algorithm after GPUSorting by Thomas Smith (MIT):
//! https://github.com/b0nes164/GPUSorting

use super::resources::{BlockHistogramResources, SortArgs};
use super::sizing::{
    result_location, SortLocation, DEVICE_RADIX_SORT_BITS, DEVICE_RADIX_SORT_PARTITION_SIZE,
    DEVICE_RADIX_SORT_PASSES, DEVICE_RADIX_SORT_RADIX, DEVICE_RADIX_SORT_WG_SIZE,
};
use super::SortType;
use crate::compute::host::{HostKernelSet, KernelContext};
use crate::compute::{resolve_kernels, CommandRecorder, KernelSet};
use crate::error::{SortError, SortResult};

pub const KERNEL_INIT: &str = "InitDeviceRadixSort";
pub const KERNEL_UPSWEEP: &str = "Upsweep";
pub const KERNEL_SCAN: &str = "Scan";
pub const KERNEL_DOWNSWEEP: &str = "Downsweep";

// Downsweep and scan index histogram bins by invocation.
const _: () = assert!(DEVICE_RADIX_SORT_WG_SIZE == DEVICE_RADIX_SORT_RADIX);

/// Scratch buffers and arguments of one block-histogram sort.
pub type BlockHistogramArgs<B> = SortArgs<B, BlockHistogramResources<B>>;

#[derive(Clone, Copy)]
struct Kernels<K> {
    init: K,
    upsweep: K,
    scan: K,
    downsweep: K,
}

pub struct BlockHistogramSort<K> {
    kernels: Option<Kernels<K>>,
    max_dispatch_groups: u32,
}

impl<K: Copy> BlockHistogramSort<K> {
    pub fn new<S: KernelSet<Kernel = K>>(set: &S) -> Self {
        let kernels = resolve_kernels(
            set,
            [KERNEL_INIT, KERNEL_UPSWEEP, KERNEL_SCAN, KERNEL_DOWNSWEEP],
        )
        .map(|[init, upsweep, scan, downsweep]| Kernels {
            init,
            upsweep,
            scan,
            downsweep,
        });
        Self {
            kernels,
            max_dispatch_groups: set.max_dispatch_groups(),
        }
    }

    pub fn valid(&self) -> bool {
        self.kernels.is_some()
    }

    /// Largest element count one dispatch can sort on this kernel set.
    pub fn max_count(&self) -> u64 {
        let by_groups =
            u64::from(self.max_dispatch_groups) * u64::from(DEVICE_RADIX_SORT_PARTITION_SIZE);
        by_groups.min(u64::from(u32::MAX))
    }

    /// Record the full four-pass sort.
    ///
    /// Nothing is recorded for an empty input. Fails without recording
    /// anything when the kernels did not validate.
    pub fn dispatch<R>(
        &self,
        cmd: &mut R,
        args: &BlockHistogramArgs<R::Buffer>,
    ) -> SortResult<SortLocation>
    where
        R: CommandRecorder<Kernel = K>,
    {
        let kernels = self
            .kernels
            .ok_or(SortError::InvalidBackend(SortType::BlockHistogram))?;
        let resources = args.resources().ok_or(SortError::NotInitialized)?;
        if args.count == 0 {
            return Ok(SortLocation::Input);
        }
        debug_assert_eq!(resources.sizes.alt, args.count);

        let mut src_keys = &args.input_keys;
        let mut src_payload = &args.input_values;
        let mut dst_keys = &resources.alt;
        let mut dst_payload = &resources.alt_payload;

        let thread_blocks = resources.sizes.thread_blocks;
        cmd.set_int("numKeys", args.count);
        cmd.set_int("threadBlocks", thread_blocks);

        cmd.set_buffer(kernels.upsweep, "passHist", &resources.pass_hist);
        cmd.set_buffer(kernels.upsweep, "globalHist", &resources.global_hist);
        cmd.set_buffer(kernels.scan, "passHist", &resources.pass_hist);
        cmd.set_buffer(kernels.scan, "globalHist", &resources.global_hist);
        cmd.set_buffer(kernels.downsweep, "passHist", &resources.pass_hist);

        cmd.set_buffer(kernels.init, "globalHist", &resources.global_hist);
        cmd.dispatch(kernels.init, 1)?;

        for pass in 0..DEVICE_RADIX_SORT_PASSES {
            cmd.set_int("radixShift", pass * DEVICE_RADIX_SORT_BITS);

            cmd.set_buffer(kernels.upsweep, "sort", src_keys);
            cmd.dispatch(kernels.upsweep, thread_blocks)?;

            cmd.dispatch(kernels.scan, DEVICE_RADIX_SORT_RADIX)?;

            cmd.set_buffer(kernels.downsweep, "sort", src_keys);
            cmd.set_buffer(kernels.downsweep, "sortPayload", src_payload);
            cmd.set_buffer(kernels.downsweep, "alt", dst_keys);
            cmd.set_buffer(kernels.downsweep, "altPayload", dst_payload);
            cmd.dispatch(kernels.downsweep, thread_blocks)?;

            std::mem::swap(&mut src_keys, &mut dst_keys);
            std::mem::swap(&mut src_payload, &mut dst_payload);
        }

        Ok(result_location(DEVICE_RADIX_SORT_PASSES))
    }
}

const RADIX: usize = DEVICE_RADIX_SORT_RADIX as usize;
const RADIX_MASK: u32 = DEVICE_RADIX_SORT_RADIX - 1;

fn digit(key: u32, shift: u32) -> usize {
    ((key >> shift) & RADIX_MASK) as usize
}

fn partition(block: u32, count: u32) -> std::ops::Range<usize> {
    let start = block.saturating_mul(DEVICE_RADIX_SORT_PARTITION_SIZE).min(count);
    let end = start.saturating_add(DEVICE_RADIX_SORT_PARTITION_SIZE).min(count);
    start as usize..end as usize
}

fn host_init(ctx: &KernelContext<'_>, _group: u32) -> SortResult<()> {
    let len = RADIX * DEVICE_RADIX_SORT_PASSES as usize;
    let mut global = ctx.write("globalHist", len)?;
    global[..len].fill(0);
    Ok(())
}

fn host_upsweep(ctx: &KernelContext<'_>, block: u32) -> SortResult<()> {
    let count = ctx.int("numKeys")?;
    let shift = ctx.int("radixShift")?;
    let thread_blocks = ctx.int("threadBlocks")? as usize;

    let keys = ctx.read("sort", count as usize)?;
    let mut hist = [0u32; RADIX];
    for &key in &keys[partition(block, count)] {
        hist[digit(key, shift)] += 1;
    }

    let mut pass_hist = ctx.write("passHist", thread_blocks * RADIX)?;
    let mut global = ctx.write("globalHist", RADIX * DEVICE_RADIX_SORT_PASSES as usize)?;
    let section = (shift / DEVICE_RADIX_SORT_BITS) as usize * RADIX;
    for (bin, &n) in hist.iter().enumerate() {
        pass_hist[bin * thread_blocks + block as usize] = n;
        global[section + bin] += n;
    }
    Ok(())
}

fn host_scan(ctx: &KernelContext<'_>, bin: u32) -> SortResult<()> {
    let shift = ctx.int("radixShift")?;
    let thread_blocks = ctx.int("threadBlocks")? as usize;
    let bin = bin as usize;

    let global = ctx.read("globalHist", RADIX * DEVICE_RADIX_SORT_PASSES as usize)?;
    let section = (shift / DEVICE_RADIX_SORT_BITS) as usize * RADIX;
    let mut offset: u32 = global[section..section + bin].iter().sum();

    let mut pass_hist = ctx.write("passHist", thread_blocks * RADIX)?;
    for entry in &mut pass_hist[bin * thread_blocks..(bin + 1) * thread_blocks] {
        let n = *entry;
        *entry = offset;
        offset += n;
    }
    Ok(())
}

fn host_downsweep(ctx: &KernelContext<'_>, block: u32) -> SortResult<()> {
    let count = ctx.int("numKeys")?;
    let shift = ctx.int("radixShift")?;
    let thread_blocks = ctx.int("threadBlocks")? as usize;
    let n = count as usize;

    let pass_hist = ctx.read("passHist", thread_blocks * RADIX)?;
    let mut offsets = [0u32; RADIX];
    for (bin, offset) in offsets.iter_mut().enumerate() {
        *offset = pass_hist[bin * thread_blocks + block as usize];
    }

    let keys = ctx.read("sort", n)?;
    let payload = ctx.read("sortPayload", n)?;
    let mut alt = ctx.write("alt", n)?;
    let mut alt_payload = ctx.write("altPayload", n)?;
    for i in partition(block, count) {
        let d = digit(keys[i], shift);
        let dest = offsets[d] as usize;
        alt[dest] = keys[i];
        alt_payload[dest] = payload[i];
        offsets[d] += 1;
    }
    Ok(())
}

/// The block-histogram program for the host compute target.
pub fn host_kernels() -> HostKernelSet {
    HostKernelSet::new(
        "DeviceRadixSort",
        &[
            (KERNEL_INIT, host_init),
            (KERNEL_UPSWEEP, host_upsweep),
            (KERNEL_SCAN, host_scan),
            (KERNEL_DOWNSWEEP, host_downsweep),
        ],
    )
}

#[cfg(feature = "gpu")]
pub fn wgpu_program() -> crate::compute::wgpu_target::WgpuProgram {
    use crate::compute::wgpu_target::{KernelDesc, WgpuProgram};

    let source = format!(
        "const PARTITION_SIZE: u32 = {}u;\n\
         const RADIX: u32 = {}u;\n\
         const RADIX_BITS: u32 = {}u;\n\
         const PASSES: u32 = {}u;\n\
         const WG_SIZE: u32 = {}u;\n\
         {}",
        DEVICE_RADIX_SORT_PARTITION_SIZE,
        DEVICE_RADIX_SORT_RADIX,
        DEVICE_RADIX_SORT_BITS,
        DEVICE_RADIX_SORT_PASSES,
        DEVICE_RADIX_SORT_WG_SIZE,
        include_str!("block_histogram.wgsl")
    );

    WgpuProgram {
        label: "Device Radix Sort",
        source,
        params: &["numKeys", "radixShift", "threadBlocks"],
        buffers: &[
            "sort",
            "sortPayload",
            "alt",
            "altPayload",
            "passHist",
            "globalHist",
        ],
        kernels: &[
            KernelDesc {
                name: KERNEL_INIT,
                entry_point: "init_device_radix_sort",
                buffers: &["globalHist"],
            },
            KernelDesc {
                name: KERNEL_UPSWEEP,
                entry_point: "upsweep",
                buffers: &["sort", "passHist", "globalHist"],
            },
            KernelDesc {
                name: KERNEL_SCAN,
                entry_point: "scan_pass_histogram",
                buffers: &["passHist", "globalHist"],
            },
            KernelDesc {
                name: KERNEL_DOWNSWEEP,
                entry_point: "downsweep",
                buffers: &["sort", "sortPayload", "alt", "altPayload", "passHist"],
            },
        ],
    }
}
