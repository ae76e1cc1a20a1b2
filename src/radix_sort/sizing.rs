//! Scratch sizing and workgroup layout for both sort backends.
//!
//! Everything here is a pure function of the element count. All sizes are in
//! 32-bit elements, never bytes.

/// Stride of every sort buffer, in bytes.
pub const ELEMENT_STRIDE: u32 = 4;

/// Width of the sort keys in bits.
pub const KEY_BITS: u32 = 32;

// Block-histogram sort (8 bits per pass).

/// Keys processed by one threadblock in the upsweep and downsweep kernels.
pub const DEVICE_RADIX_SORT_PARTITION_SIZE: u32 = 3840;
pub const DEVICE_RADIX_SORT_BITS: u32 = 8;
pub const DEVICE_RADIX_SORT_RADIX: u32 = 1 << DEVICE_RADIX_SORT_BITS;
pub const DEVICE_RADIX_SORT_PASSES: u32 = KEY_BITS / DEVICE_RADIX_SORT_BITS;
/// Threads per workgroup of every block-histogram kernel.
pub const DEVICE_RADIX_SORT_WG_SIZE: u32 = 256;

// Hierarchical sort (4 bits per pass).

pub const PARALLEL_SORT_ELEMENTS_PER_THREAD: u32 = 4;
pub const PARALLEL_SORT_THREADGROUP_SIZE: u32 = 128;
pub const PARALLEL_SORT_BITS_PER_PASS: u32 = 4;
pub const PARALLEL_SORT_BIN_COUNT: u32 = 1 << PARALLEL_SORT_BITS_PER_PASS;
pub const PARALLEL_SORT_PASSES: u32 = KEY_BITS / PARALLEL_SORT_BITS_PER_PASS;
pub const PARALLEL_SORT_BLOCK_SIZE: u32 =
    PARALLEL_SORT_ELEMENTS_PER_THREAD * PARALLEL_SORT_THREADGROUP_SIZE;
/// Upper bound on concurrently running workgroups. Hardware specific, this
/// value trades occupancy against the size of the sum table.
pub const PARALLEL_SORT_MAX_THREADGROUPS_TO_RUN: u32 = 800;

pub fn div_round_up(x: u32, y: u32) -> u32 {
    x.div_ceil(y)
}

/// Scratch element counts of the block-histogram sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHistogramSizes {
    pub thread_blocks: u32,
    /// Per-threadblock histograms, `thread_blocks * RADIX`.
    pub pass_hist: u32,
    /// One histogram per pass, `RADIX * PASSES`.
    pub global_hist: u32,
    /// Alternate key and payload buffers.
    pub alt: u32,
}

pub fn block_histogram_sizes(count: u32) -> BlockHistogramSizes {
    let thread_blocks = div_round_up(count, DEVICE_RADIX_SORT_PARTITION_SIZE);
    BlockHistogramSizes {
        thread_blocks,
        pass_hist: thread_blocks * DEVICE_RADIX_SORT_RADIX,
        global_hist: DEVICE_RADIX_SORT_RADIX * DEVICE_RADIX_SORT_PASSES,
        alt: count,
    }
}

/// Scratch element counts of the hierarchical sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchicalSizes {
    pub num_blocks: u32,
    pub num_reduced_blocks: u32,
    pub sum_table: u32,
    pub reduced_sum_table: u32,
    /// Scratch key and payload buffers.
    pub scratch: u32,
}

pub fn hierarchical_sizes(count: u32) -> HierarchicalSizes {
    let num_blocks = div_round_up(count, PARALLEL_SORT_BLOCK_SIZE);
    let num_reduced_blocks = div_round_up(num_blocks, PARALLEL_SORT_BLOCK_SIZE);
    HierarchicalSizes {
        num_blocks,
        num_reduced_blocks,
        sum_table: PARALLEL_SORT_BIN_COUNT * num_blocks,
        reduced_sum_table: PARALLEL_SORT_BIN_COUNT * num_reduced_blocks,
        scratch: count,
    }
}

/// How the hierarchical sort spreads its blocks over workgroups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchicalLayout {
    /// Workgroups dispatched for the count and scatter kernels.
    pub num_thread_groups: u32,
    pub blocks_per_thread_group: u32,
    /// The last this-many workgroups process one extra block each.
    pub num_thread_groups_with_additional_blocks: u32,
    /// Workgroups dispatched for the reduce and scan-add kernels.
    pub num_reduced_thread_groups: u32,
    pub num_reduce_threadgroup_per_bin: u32,
    /// Entries of the reduced sum table covered by the scan kernel.
    pub num_scan_values: u32,
}

pub fn hierarchical_layout(count: u32) -> HierarchicalLayout {
    let num_blocks = div_round_up(count, PARALLEL_SORT_BLOCK_SIZE);

    let (num_thread_groups, blocks_per_thread_group, with_additional) =
        if num_blocks < PARALLEL_SORT_MAX_THREADGROUPS_TO_RUN {
            (num_blocks, 1, 0)
        } else {
            (
                PARALLEL_SORT_MAX_THREADGROUPS_TO_RUN,
                num_blocks / PARALLEL_SORT_MAX_THREADGROUPS_TO_RUN,
                num_blocks % PARALLEL_SORT_MAX_THREADGROUPS_TO_RUN,
            )
        };

    // Each reduce workgroup sums up to one block worth of workgroup rows.
    let reduce_groups_per_bin = if PARALLEL_SORT_BLOCK_SIZE > num_thread_groups {
        1
    } else {
        div_round_up(num_thread_groups, PARALLEL_SORT_BLOCK_SIZE)
    };
    let num_reduced_thread_groups = PARALLEL_SORT_BIN_COUNT * reduce_groups_per_bin;

    HierarchicalLayout {
        num_thread_groups,
        blocks_per_thread_group,
        num_thread_groups_with_additional_blocks: with_additional,
        num_reduced_thread_groups,
        num_reduce_threadgroup_per_bin: reduce_groups_per_bin,
        num_scan_values: num_reduced_thread_groups,
    }
}

/// First element and number of blocks processed by workgroup `group`.
pub fn hierarchical_group_range(layout: &HierarchicalLayout, group: u32) -> (u32, u32) {
    let mut start = PARALLEL_SORT_BLOCK_SIZE * layout.blocks_per_thread_group * group;
    let mut blocks = layout.blocks_per_thread_group;
    let first_extended =
        layout.num_thread_groups - layout.num_thread_groups_with_additional_blocks;
    if group >= first_extended {
        start += (group - first_extended) * PARALLEL_SORT_BLOCK_SIZE;
        blocks += 1;
    }
    (start, blocks)
}

/// Which buffer pair holds the sort result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortLocation {
    /// The caller's key and payload buffers.
    Input,
    /// The backend's alternate (scratch) buffers.
    Alternate,
}

/// Every pass moves the data to the other buffer pair.
pub fn result_location(passes: u32) -> SortLocation {
    if passes % 2 == 0 {
        SortLocation::Input
    } else {
        SortLocation::Alternate
    }
}
