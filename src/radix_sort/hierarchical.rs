//! Hierarchical radix sort: 4-bit LSD over a bounded number of workgroups.
//!
//! Each of the eight passes runs five kernels:
//!
//! - `Count`: per-workgroup 16-bin histogram of the pass digit, written as one
//!   column of the bin-major sum table.
//! - `Reduce`: sums groups of up to one block of sum-table entries per bin into
//!   the reduced sum table.
//! - `Scan`: exclusive prefix sum of the reduced sum table, single workgroup.
//! - `ScanAdd`: exclusive prefix sum of every sum-table chunk, offset by the
//!   matching reduced entry. The sum table then holds the output offset of every
//!   (bin, workgroup) pair.
//! - `Scatter`: each workgroup re-reads its blocks and moves keys and payloads
//!   into the destination buffers.
//!
//! Based on the AMD FidelityFX parallel sort (MIT), v1.1.1:
//! https://github.com/GPUOpen-Effects/FidelityFX-ParallelSort

use super::resources::{HierarchicalResources, SortArgs};
use super::sizing::{
    hierarchical_group_range, hierarchical_layout, result_location, HierarchicalLayout,
    SortLocation, PARALLEL_SORT_BIN_COUNT, PARALLEL_SORT_BITS_PER_PASS, PARALLEL_SORT_BLOCK_SIZE,
    PARALLEL_SORT_PASSES,
};
use super::SortType;
use crate::compute::host::{HostKernelSet, KernelContext};
use crate::compute::{resolve_kernels, CommandRecorder, KernelSet};
use crate::error::{SortError, SortResult};

pub const KERNEL_COUNT: &str = "Count";
pub const KERNEL_REDUCE: &str = "Reduce";
pub const KERNEL_SCAN: &str = "Scan";
pub const KERNEL_SCAN_ADD: &str = "ScanAdd";
pub const KERNEL_SCATTER: &str = "Scatter";

pub type HierarchicalArgs<B> = SortArgs<B, HierarchicalResources<B>>;

#[derive(Clone, Copy)]
struct Kernels<K> {
    count: K,
    reduce: K,
    scan: K,
    scan_add: K,
    scatter: K,
}

pub struct HierarchicalSort<K> {
    kernels: Option<Kernels<K>>,
}

impl<K: Copy> HierarchicalSort<K> {
    pub fn new<S: KernelSet<Kernel = K>>(set: &S) -> Self {
        let kernels = resolve_kernels(
            set,
            [
                KERNEL_COUNT,
                KERNEL_REDUCE,
                KERNEL_SCAN,
                KERNEL_SCAN_ADD,
                KERNEL_SCATTER,
            ],
        )
        .map(|[count, reduce, scan, scan_add, scatter]| Kernels {
            count,
            reduce,
            scan,
            scan_add,
            scatter,
        });
        Self { kernels }
    }

    pub fn valid(&self) -> bool {
        self.kernels.is_some()
    }

    /// Record the full eight-pass sort.
    ///
    /// Nothing is recorded for an empty input. Fails without recording
    /// anything when the kernels did not validate.
    pub fn dispatch<R>(
        &self,
        cmd: &mut R,
        args: &HierarchicalArgs<R::Buffer>,
    ) -> SortResult<SortLocation>
    where
        R: CommandRecorder<Kernel = K>,
    {
        let kernels = self
            .kernels
            .ok_or(SortError::InvalidBackend(SortType::Hierarchical))?;
        let resources = args.resources().ok_or(SortError::NotInitialized)?;
        if args.count == 0 {
            return Ok(SortLocation::Input);
        }
        debug_assert_eq!(resources.sizes.scratch, args.count);

        let mut src_keys = &args.input_keys;
        let mut src_payload = &args.input_values;
        let mut dst_keys = &resources.key_scratch;
        let mut dst_payload = &resources.payload_scratch;

        let layout = hierarchical_layout(args.count);
        cmd.set_int("numKeys", args.count);
        cmd.set_int("numBlocksPerThreadGroup", layout.blocks_per_thread_group);
        cmd.set_int("numThreadGroups", layout.num_thread_groups);
        cmd.set_int(
            "numThreadGroupsWithAdditionalBlocks",
            layout.num_thread_groups_with_additional_blocks,
        );
        cmd.set_int(
            "numReduceThreadgroupPerBin",
            layout.num_reduce_threadgroup_per_bin,
        );
        cmd.set_int("numScanValues", layout.num_scan_values);

        cmd.set_buffer(kernels.count, "sumTable", &resources.sum_table);
        cmd.set_buffer(kernels.reduce, "sumTable", &resources.sum_table);
        cmd.set_buffer(kernels.reduce, "reducedSumTable", &resources.reduced_sum_table);
        cmd.set_buffer(kernels.scan, "reducedSumTable", &resources.reduced_sum_table);
        cmd.set_buffer(kernels.scan_add, "sumTable", &resources.sum_table);
        cmd.set_buffer(kernels.scan_add, "reducedSumTable", &resources.reduced_sum_table);
        cmd.set_buffer(kernels.scatter, "sumTable", &resources.sum_table);

        for pass in 0..PARALLEL_SORT_PASSES {
            cmd.set_int("shift", pass * PARALLEL_SORT_BITS_PER_PASS);

            cmd.set_buffer(kernels.count, "sourceKeys", src_keys);
            cmd.dispatch(kernels.count, layout.num_thread_groups)?;

            cmd.dispatch(kernels.reduce, layout.num_reduced_thread_groups)?;

            cmd.dispatch(kernels.scan, 1)?;

            cmd.dispatch(kernels.scan_add, layout.num_reduced_thread_groups)?;

            cmd.set_buffer(kernels.scatter, "sourceKeys", src_keys);
            cmd.set_buffer(kernels.scatter, "destKeys", dst_keys);
            cmd.set_buffer(kernels.scatter, "sourcePayloads", src_payload);
            cmd.set_buffer(kernels.scatter, "destPayloads", dst_payload);
            cmd.dispatch(kernels.scatter, layout.num_thread_groups)?;

            std::mem::swap(&mut src_keys, &mut dst_keys);
            std::mem::swap(&mut src_payload, &mut dst_payload);
        }

        Ok(result_location(PARALLEL_SORT_PASSES))
    }
}

const BINS: usize = PARALLEL_SORT_BIN_COUNT as usize;
const BLOCK: usize = PARALLEL_SORT_BLOCK_SIZE as usize;
const BIN_MASK: u32 = PARALLEL_SORT_BIN_COUNT - 1;

fn digit(key: u32, shift: u32) -> usize {
    ((key >> shift) & BIN_MASK) as usize
}

fn layout_from_params(ctx: &KernelContext<'_>) -> SortResult<HierarchicalLayout> {
    let num_scan_values = ctx.int("numScanValues")?;
    Ok(HierarchicalLayout {
        num_thread_groups: ctx.int("numThreadGroups")?,
        blocks_per_thread_group: ctx.int("numBlocksPerThreadGroup")?,
        num_thread_groups_with_additional_blocks: ctx.int("numThreadGroupsWithAdditionalBlocks")?,
        num_reduced_thread_groups: num_scan_values,
        num_reduce_threadgroup_per_bin: ctx.int("numReduceThreadgroupPerBin")?,
        num_scan_values,
    })
}

/// Keys handled by workgroup `group`, clamped to the key count.
fn group_keys(layout: &HierarchicalLayout, group: u32, count: u32) -> std::ops::Range<usize> {
    let (start, blocks) = hierarchical_group_range(layout, group);
    let start = start.min(count);
    let end = start
        .saturating_add(blocks.saturating_mul(PARALLEL_SORT_BLOCK_SIZE))
        .min(count);
    start as usize..end as usize
}

/// Sum-table entries of one bin covered by reduce workgroup `group`, as
/// (row start, chunk range within the row).
fn reduce_chunk(layout: &HierarchicalLayout, group: u32) -> (usize, std::ops::Range<usize>) {
    let per_bin = layout.num_reduce_threadgroup_per_bin;
    let bin = (group / per_bin) as usize;
    let groups = layout.num_thread_groups as usize;
    let start = ((group % per_bin) as usize * BLOCK).min(groups);
    let end = (start + BLOCK).min(groups);
    (bin * groups, start..end)
}

fn host_count(ctx: &KernelContext<'_>, group: u32) -> SortResult<()> {
    let count = ctx.int("numKeys")?;
    let shift = ctx.int("shift")?;
    let layout = layout_from_params(ctx)?;
    let groups = layout.num_thread_groups as usize;

    let keys = ctx.read("sourceKeys", count as usize)?;
    let mut hist = [0u32; BINS];
    for &key in &keys[group_keys(&layout, group, count)] {
        hist[digit(key, shift)] += 1;
    }

    let mut sum_table = ctx.write("sumTable", BINS * groups)?;
    for (bin, &n) in hist.iter().enumerate() {
        sum_table[bin * groups + group as usize] = n;
    }
    Ok(())
}

fn host_reduce(ctx: &KernelContext<'_>, group: u32) -> SortResult<()> {
    let layout = layout_from_params(ctx)?;
    let sum_table = ctx.read("sumTable", BINS * layout.num_thread_groups as usize)?;
    let mut reduced = ctx.write("reducedSumTable", layout.num_scan_values as usize)?;

    let (row, chunk) = reduce_chunk(&layout, group);
    reduced[group as usize] = sum_table[row + chunk.start..row + chunk.end].iter().sum();
    Ok(())
}

fn host_scan(ctx: &KernelContext<'_>, _group: u32) -> SortResult<()> {
    let values = ctx.int("numScanValues")? as usize;
    let mut reduced = ctx.write("reducedSumTable", values)?;
    let mut sum = 0u32;
    for entry in &mut reduced[..values] {
        let n = *entry;
        *entry = sum;
        sum += n;
    }
    Ok(())
}

fn host_scan_add(ctx: &KernelContext<'_>, group: u32) -> SortResult<()> {
    let layout = layout_from_params(ctx)?;
    let reduced = ctx.read("reducedSumTable", layout.num_scan_values as usize)?;
    let mut sum_table = ctx.write("sumTable", BINS * layout.num_thread_groups as usize)?;

    let (row, chunk) = reduce_chunk(&layout, group);
    let mut sum = reduced[group as usize];
    for entry in &mut sum_table[row + chunk.start..row + chunk.end] {
        let n = *entry;
        *entry = sum;
        sum += n;
    }
    Ok(())
}

fn host_scatter(ctx: &KernelContext<'_>, group: u32) -> SortResult<()> {
    let count = ctx.int("numKeys")?;
    let shift = ctx.int("shift")?;
    let layout = layout_from_params(ctx)?;
    let groups = layout.num_thread_groups as usize;
    let n = count as usize;

    let sum_table = ctx.read("sumTable", BINS * groups)?;
    let mut offsets = [0u32; BINS];
    for (bin, offset) in offsets.iter_mut().enumerate() {
        *offset = sum_table[bin * groups + group as usize];
    }

    let keys = ctx.read("sourceKeys", n)?;
    let payloads = ctx.read("sourcePayloads", n)?;
    let mut dest_keys = ctx.write("destKeys", n)?;
    let mut dest_payloads = ctx.write("destPayloads", n)?;
    for i in group_keys(&layout, group, count) {
        let d = digit(keys[i], shift);
        let dest = offsets[d] as usize;
        dest_keys[dest] = keys[i];
        dest_payloads[dest] = payloads[i];
        offsets[d] += 1;
    }
    Ok(())
}

/// The hierarchical program for the host compute target.
pub fn host_kernels() -> HostKernelSet {
    HostKernelSet::new(
        "ParallelSort",
        &[
            (KERNEL_COUNT, host_count),
            (KERNEL_REDUCE, host_reduce),
            (KERNEL_SCAN, host_scan),
            (KERNEL_SCAN_ADD, host_scan_add),
            (KERNEL_SCATTER, host_scatter),
        ],
    )
}

#[cfg(feature = "gpu")]
pub fn wgpu_program() -> crate::compute::wgpu_target::WgpuProgram {
    use super::sizing::{PARALLEL_SORT_ELEMENTS_PER_THREAD, PARALLEL_SORT_THREADGROUP_SIZE};
    use crate::compute::wgpu_target::{KernelDesc, WgpuProgram};

    let source = format!(
        "const ELEMENTS_PER_THREAD: u32 = {}u;\n\
         const THREADGROUP_SIZE: u32 = {}u;\n\
         const BIN_COUNT: u32 = {}u;\n\
         const BLOCK_SIZE: u32 = {}u;\n\
         {}",
        PARALLEL_SORT_ELEMENTS_PER_THREAD,
        PARALLEL_SORT_THREADGROUP_SIZE,
        PARALLEL_SORT_BIN_COUNT,
        PARALLEL_SORT_BLOCK_SIZE,
        include_str!("hierarchical.wgsl")
    );

    WgpuProgram {
        label: "Parallel Sort",
        source,
        params: &[
            "numKeys",
            "numBlocksPerThreadGroup",
            "numThreadGroups",
            "numThreadGroupsWithAdditionalBlocks",
            "numReduceThreadgroupPerBin",
            "numScanValues",
            "shift",
        ],
        buffers: &[
            "sourceKeys",
            "destKeys",
            "sourcePayloads",
            "destPayloads",
            "sumTable",
            "reducedSumTable",
        ],
        kernels: &[
            KernelDesc {
                name: KERNEL_COUNT,
                entry_point: "count_keys",
                buffers: &["sourceKeys", "sumTable"],
            },
            KernelDesc {
                name: KERNEL_REDUCE,
                entry_point: "reduce_counts",
                buffers: &["sumTable", "reducedSumTable"],
            },
            KernelDesc {
                name: KERNEL_SCAN,
                entry_point: "scan_reduced",
                buffers: &["reducedSumTable"],
            },
            KernelDesc {
                name: KERNEL_SCAN_ADD,
                entry_point: "scan_add",
                buffers: &["sumTable", "reducedSumTable"],
            },
            KernelDesc {
                name: KERNEL_SCATTER,
                entry_point: "scatter_keys",
                buffers: &[
                    "sourceKeys",
                    "destKeys",
                    "sourcePayloads",
                    "destPayloads",
                    "sumTable",
                ],
            },
        ],
    }
}
