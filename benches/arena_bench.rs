//! Arena Benchmark Suite
//!
//! - reserve + seal + release cycles for growing reservation counts
//! - packing overhead (padding) per alignment pattern
//! - whole-category fill through `as_view` vs per-tensor fills
//!
//! Run with: `cargo bench --bench arena_bench`

use std::hint::black_box;
use std::time::{Duration, Instant};

use mlpforge::memory::strategy_for;
use mlpforge::{AllocatorKind, Device, DeviceStream, MemoryArena, TensorView};

const ITERATIONS: usize = 50;

fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;
    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn per_iter(total: Duration) -> f64 {
    total.as_secs_f64() * 1e6 / ITERATIONS as f64
}

fn bench_seal_cycle(device: &Device, kind: AllocatorKind, count: usize) -> anyhow::Result<()> {
    let mut total = Duration::ZERO;
    let mut capacity = 0;
    for _ in 0..ITERATIONS {
        let start = Instant::now();
        let mut arena = MemoryArena::new("bench", strategy_for(kind, device));
        for i in 0..count {
            arena.reserve(64 + (i % 7) * 96, 256)?;
        }
        capacity = black_box(arena.seal()?);
        arena.release()?;
        total += start.elapsed();
    }
    println!(
        "  {:<16} {:>5} reservations: {:>9.2} us/cycle  ({})",
        kind.to_string(),
        count,
        per_iter(total),
        format_bytes(capacity)
    );
    Ok(())
}

fn bench_padding(device: &Device) -> anyhow::Result<()> {
    let patterns: [(&str, &[usize]); 3] = [
        ("uniform 256", &[256]),
        ("mixed 4..256", &[4, 16, 64, 256]),
        ("page 4096", &[4096, 8]),
    ];
    for (name, alignments) in patterns {
        let mut arena = MemoryArena::new("padding", strategy_for(AllocatorKind::DevicePrimary, device));
        for i in 0..256 {
            arena.reserve(100 + i, alignments[i % alignments.len()])?;
        }
        arena.seal()?;
        let stats = arena.stats()?;
        println!(
            "  {:<16} requested {:>10}  capacity {:>10}  padding {:>5.1}%",
            name,
            format_bytes(stats.requested_bytes),
            format_bytes(stats.capacity),
            100.0 * stats.padding_bytes() as f64 / stats.capacity.max(1) as f64
        );
        arena.release()?;
    }
    Ok(())
}

fn bench_category_fill(device: &Device) -> anyhow::Result<()> {
    let stream = DeviceStream::new(device)?;
    let mut arena = MemoryArena::new("grads", strategy_for(AllocatorKind::DevicePrimary, device));
    let tensors: Vec<TensorView<f32>> = (0..64)
        .map(|i| arena.reserve_tensor(format!("t{}", i), &[128, 64]))
        .collect::<Result<_, _>>()?;
    arena.seal()?;
    let whole = arena.as_view::<f32>()?;

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        for t in &tensors {
            t.fill_zero(&stream)?;
        }
        stream.synchronize()?;
    }
    let separate = start.elapsed();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        whole.fill_zero(&stream)?;
        stream.synchronize()?;
    }
    let single = start.elapsed();

    println!("  per-tensor fills ({:>3}): {:>9.2} us", tensors.len(), per_iter(separate));
    println!("  whole-arena fill:        {:>9.2} us", per_iter(single));
    arena.release()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    mlpforge::init_logging_default();
    let device = Device::open(0)?;

    println!("Seal/release cycle:");
    for kind in [
        AllocatorKind::DevicePrimary,
        AllocatorKind::PinnedHost,
        AllocatorKind::Managed,
    ] {
        for count in [16, 256, 4096] {
            bench_seal_cycle(&device, kind, count)?;
        }
    }

    println!("\nPacking overhead:");
    bench_padding(&device)?;

    println!("\nCategory zeroing:");
    bench_category_fill(&device)?;
    Ok(())
}
