use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use splatsort::compute::host::{HostBuffer, HostDevice, HostKernel, HostRecorder};
use splatsort::radix_sort::sizing::{
    block_histogram_sizes, DEVICE_RADIX_SORT_PARTITION_SIZE, PARALLEL_SORT_BLOCK_SIZE,
};
use splatsort::{GpuSorter, SortError, SortLocation, SortType};

const BACKENDS: [SortType; 2] = [SortType::BlockHistogram, SortType::Hierarchical];
const P: usize = DEVICE_RADIX_SORT_PARTITION_SIZE as usize;

fn new_sorter(sort_type: SortType) -> GpuSorter<HostKernel, HostBuffer> {
    let kernels = sort_type.host_kernels().expect("backend has host kernels");
    let sorter = GpuSorter::new(sort_type, &kernels);
    assert!(sorter.valid());
    sorter
}

/// Runs one full sort and returns the keys and payloads it produced.
fn sort(sort_type: SortType, keys: &[u32], values: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let device = HostDevice::new();
    let key_buffer = device.buffer_from("keys", keys);
    let value_buffer = device.buffer_from("values", values);

    let mut sorter = new_sorter(sort_type);
    sorter
        .initialize(&device, keys.len() as u32, &key_buffer, &value_buffer)
        .unwrap();
    let mut cmd = HostRecorder::new();
    assert_eq!(sorter.dispatch(&mut cmd).unwrap(), SortLocation::Input);
    cmd.submit().unwrap();

    let (sorted_keys, sorted_values) = sorter.sorted_buffers().unwrap();
    let result = (sorted_keys.to_vec(), sorted_values.to_vec());
    sorter.dispose_resources(&device);
    result
}

/// Stable reference sort of (key, payload) pairs.
fn reference(keys: &[u32], values: &[u32]) -> (Vec<u32>, Vec<u32>) {
    let mut pairs: Vec<(u32, u32)> = keys.iter().copied().zip(values.iter().copied()).collect();
    pairs.sort_by_key(|&(key, _)| key);
    pairs.into_iter().unzip()
}

fn assert_sorts_like_reference(sort_type: SortType, keys: &[u32]) {
    let values: Vec<u32> = (0..keys.len() as u32).collect();
    let (sorted_keys, sorted_values) = sort(sort_type, keys, &values);
    let (expected_keys, expected_values) = reference(keys, &values);
    assert!(
        sorted_keys.windows(2).all(|w| w[0] <= w[1]),
        "{sort_type}: keys are not ordered"
    );
    assert_eq!(sorted_keys, expected_keys, "{sort_type}: keys differ");
    assert_eq!(sorted_values, expected_values, "{sort_type}: payloads differ");
}

#[test]
fn test_stable_scenario() {
    for sort_type in BACKENDS {
        let (keys, values) = sort(sort_type, &[5, 3, 5, 1, 4], &[10, 11, 12, 13, 14]);
        assert_eq!(keys, vec![1, 3, 4, 5, 5], "{sort_type}");
        assert_eq!(values, vec![13, 11, 14, 10, 12], "{sort_type}");
    }
}

#[test]
fn test_single_element_is_unchanged() {
    for sort_type in BACKENDS {
        assert_eq!(sort(sort_type, &[42], &[7]), (vec![42], vec![7]));
    }
}

#[test]
fn test_empty_sort_is_a_no_op() {
    let device = HostDevice::new();
    let keys = device.buffer_from("keys", &[]);
    let values = device.buffer_from("values", &[]);
    for sort_type in BACKENDS {
        let mut sorter = new_sorter(sort_type);
        sorter.initialize(&device, 0, &keys, &values).unwrap();

        let mut cmd = HostRecorder::new();
        assert_eq!(sorter.dispatch(&mut cmd), Ok(SortLocation::Input));
        assert!(cmd.is_empty(), "{sort_type} recorded work for zero keys");
        cmd.submit().unwrap();
        assert!(keys.is_empty() && values.is_empty());
    }
}

#[test]
fn test_random_keys_across_partitions() {
    let mut rng = StdRng::seed_from_u64(7);
    let count = 2 * P + 17;
    let keys: Vec<u32> = (0..count).map(|_| rng.gen()).collect();
    for sort_type in BACKENDS {
        assert_sorts_like_reference(sort_type, &keys);
    }

    let sizes = block_histogram_sizes(count as u32);
    assert_eq!(sizes.pass_hist, 3 * 256);
    assert_eq!(sizes.global_hist, 256 * 4);
}

#[test]
fn test_partition_boundaries() {
    let mut rng = StdRng::seed_from_u64(11);
    let block = PARALLEL_SORT_BLOCK_SIZE as usize;
    for count in [P - 1, P, P + 1, block - 1, block + 1] {
        let keys: Vec<u32> = (0..count).map(|_| rng.gen()).collect();
        for sort_type in BACKENDS {
            assert_sorts_like_reference(sort_type, &keys);
        }
    }
}

#[test]
fn test_many_workgroups() {
    // Past the hierarchical threadgroup cap, so groups take several blocks.
    let mut rng = StdRng::seed_from_u64(23);
    let count = 900 * PARALLEL_SORT_BLOCK_SIZE as usize + 333;
    let keys: Vec<u32> = (0..count).map(|_| rng.gen()).collect();
    for sort_type in BACKENDS {
        assert_sorts_like_reference(sort_type, &keys);
    }
}

#[test]
fn test_reverse_sorted_keys() {
    let keys: Vec<u32> = (0..10_000u32).rev().map(|k| k * 429_497).collect();
    for sort_type in BACKENDS {
        assert_sorts_like_reference(sort_type, &keys);
    }
}

#[test]
fn test_all_equal_keys_keep_payload_order() {
    let keys = vec![0xdead_beef; 5000];
    let values: Vec<u32> = (0..5000).collect();
    for sort_type in BACKENDS {
        let (sorted_keys, sorted_values) = sort(sort_type, &keys, &values);
        assert_eq!(sorted_keys, keys);
        assert_eq!(sorted_values, values, "{sort_type}");
    }
}

#[test]
fn test_duplicate_heavy_keys_are_stable() {
    let mut rng = StdRng::seed_from_u64(3);
    // Few distinct keys spread over every digit position.
    let palette = [0u32, 1, 0x0100_0000, 0xffff_ffff, 0x00f0_0f00, 0x8000_0001];
    let keys: Vec<u32> = (0..20_000)
        .map(|_| palette[rng.gen_range(0..palette.len())])
        .collect();
    for sort_type in BACKENDS {
        assert_sorts_like_reference(sort_type, &keys);
    }
}

#[test]
fn test_float_depths_sort_front_to_back() {
    let mut rng = StdRng::seed_from_u64(99);
    let depths: Vec<f32> = (0..4000).map(|_| rng.gen_range(0.0..1000.0)).collect();
    let keys: Vec<u32> = depths.iter().map(|d| d.to_bits()).collect();
    let indices: Vec<u32> = (0..4000).collect();
    for sort_type in BACKENDS {
        let (_, order) = sort(sort_type, &keys, &indices);
        let sorted: Vec<f32> = order.iter().map(|&i| depths[i as usize]).collect();
        assert!(sorted.windows(2).all(|w| w[0] <= w[1]), "{sort_type}");
    }
}

#[test]
fn test_payloads_stay_with_their_keys() {
    let mut rng = StdRng::seed_from_u64(5);
    let keys: Vec<u32> = (0..3000).map(|_| rng.gen_range(0..200)).collect();
    // Payload derived from key and position, so any mix-up is visible.
    let values: Vec<u32> = keys
        .iter()
        .enumerate()
        .map(|(i, &k)| (k << 16) | i as u32)
        .collect();
    for sort_type in BACKENDS {
        let (sorted_keys, sorted_values) = sort(sort_type, &keys, &values);
        for (&k, &v) in sorted_keys.iter().zip(&sorted_values) {
            assert_eq!(v >> 16, k);
        }
        let mut seen: Vec<u32> = sorted_values.iter().map(|v| v & 0xffff).collect();
        seen.sort_unstable();
        assert!(seen.iter().copied().eq(0..3000));
    }
}

#[test]
fn test_resorting_sorted_input_is_identity() {
    let mut rng = StdRng::seed_from_u64(17);
    let mut keys: Vec<u32> = (0..6000).map(|_| rng.gen()).collect();
    keys.sort_unstable();
    let values: Vec<u32> = (0..6000).collect();
    for sort_type in BACKENDS {
        let first = sort(sort_type, &keys, &values);
        assert_eq!(first, (keys.clone(), values.clone()));
        let second = sort(sort_type, &first.0, &first.1);
        assert_eq!(second, first);
    }
}

#[test]
fn test_sort_every_frame_with_changing_counts() {
    let device = HostDevice::new();
    let mut rng = StdRng::seed_from_u64(1);
    for sort_type in BACKENDS {
        let mut sorter = new_sorter(sort_type);
        for count in [1000usize, 1000, 4000, 0, 250] {
            let keys: Vec<u32> = (0..count).map(|_| rng.gen()).collect();
            let values: Vec<u32> = (0..count as u32).collect();
            let key_buffer = device.buffer_from("keys", &keys);
            let value_buffer = device.buffer_from("values", &values);

            sorter
                .initialize(&device, count as u32, &key_buffer, &value_buffer)
                .unwrap();
            let mut cmd = HostRecorder::new();
            sorter.dispatch(&mut cmd).unwrap();
            cmd.submit().unwrap();

            assert_eq!(
                (key_buffer.to_vec(), value_buffer.to_vec()),
                reference(&keys, &values)
            );
        }
        sorter.dispose_resources(&device);
    }
    // Every scratch bundle and caller buffer is gone.
    assert_eq!(device.live_buffers(), 0);
}

#[test]
fn test_none_backend_rejects_dispatch() {
    let kernels = SortType::BlockHistogram.host_kernels().unwrap();
    let sorter: GpuSorter<HostKernel, HostBuffer> = GpuSorter::new(SortType::None, &kernels);
    assert!(!sorter.valid());
    assert!(SortType::None.host_kernels().is_none());

    let mut cmd = HostRecorder::new();
    assert_eq!(sorter.dispatch(&mut cmd), Err(SortError::NoBackend));
}

#[test]
fn test_missing_kernel_fails_before_recording() {
    let device = HostDevice::new();
    let keys = device.buffer_from("keys", &[1, 2, 3]);
    let kernels = SortType::BlockHistogram
        .host_kernels()
        .unwrap()
        .without_kernel("Downsweep");
    let mut sorter: GpuSorter<HostKernel, HostBuffer> =
        GpuSorter::new(SortType::BlockHistogram, &kernels);

    assert_eq!(
        sorter.initialize(&device, 3, &keys, &keys),
        Err(SortError::InvalidBackend(SortType::BlockHistogram))
    );
    let mut cmd = HostRecorder::new();
    assert!(sorter.dispatch(&mut cmd).is_err());
    assert!(cmd.is_empty());
}
