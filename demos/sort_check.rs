// Sorts random splat depths on the GPU with each backend and checks the result.
//
// Usage: cargo run --example sort_check -- [count] [block-histogram|hierarchical]

use std::time::Instant;

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use splatsort::compute::wgpu_target::{WgpuDevice, WgpuKernelSet, WgpuRecorder};
use splatsort::{GpuSorter, SortType};

fn check(device: &WgpuDevice, sort_type: SortType, depths: &[f32]) -> anyhow::Result<()> {
    let program = sort_type
        .wgpu_program()
        .context("no program for the selected sort type")?;
    let kernels = WgpuKernelSet::new(device, &program);
    let mut sorter = GpuSorter::new(sort_type, &kernels);
    if !sorter.valid() {
        bail!("{sort_type} kernels failed to validate on this adapter");
    }

    // Non-negative floats order like their bit patterns.
    let keys: Vec<u32> = depths.iter().map(|d| d.to_bits()).collect();
    let indices: Vec<u32> = (0..keys.len() as u32).collect();
    let count = keys.len() as u32;
    let key_buffer = device.buffer_from("Depth Keys", &keys);
    let index_buffer = device.buffer_from("Splat Indices", &indices);

    sorter.initialize(device, count, &key_buffer, &index_buffer)?;
    let mut cmd = WgpuRecorder::new(device, &kernels);
    sorter.dispatch(&mut cmd)?;

    let start = Instant::now();
    cmd.submit();
    let (sorted_keys, sorted_indices) = sorter
        .sorted_buffers()
        .context("sorter lost its buffers")?;
    let gpu_keys = device.read_u32(sorted_keys, count)?;
    let gpu_indices = device.read_u32(sorted_indices, count)?;
    log::info!(
        "{sort_type}: {count} keys sorted and read back in {:.2?}",
        start.elapsed()
    );

    let mut expected: Vec<(u32, u32)> = keys.into_iter().zip(indices).collect();
    expected.sort_by_key(|&(key, _)| key);
    for (i, (&(key, index), (&gpu_key, &gpu_index))) in expected
        .iter()
        .zip(gpu_keys.iter().zip(&gpu_indices))
        .enumerate()
    {
        if key != gpu_key || index != gpu_index {
            bail!(
                "{sort_type}: mismatch at {i}: expected ({key}, {index}), got ({gpu_key}, {gpu_index})"
            );
        }
    }

    sorter.dispose_resources(device);
    println!("{sort_type}: ok ({count} keys)");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let count: usize = match args.next() {
        Some(arg) => arg.parse().context("count must be a number")?,
        None => 1_000_000,
    };
    let sort_types = match args.next() {
        Some(arg) => vec![arg.parse::<SortType>().map_err(anyhow::Error::msg)?],
        None => vec![SortType::BlockHistogram, SortType::Hierarchical],
    };

    let device = WgpuDevice::request()?;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let depths: Vec<f32> = (0..count).map(|_| rng.gen_range(0.0..100.0)).collect();

    for sort_type in sort_types {
        check(&device, sort_type, &depths)?;
    }
    Ok(())
}
