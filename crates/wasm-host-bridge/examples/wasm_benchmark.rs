//! Host Bridge Benchmarks
//!
//! Run with: cargo run -p wasm-host-bridge --example wasm_benchmark --release

use std::time::Instant;

use wasm_host_bridge::{CallBenchmark, ModuleInstance, NativeSignature, NativeType, Runtime, RuntimeConfig, Value};

const BENCH_WAT: &str = r#"
(module
  (import "env" "native_millis" (func $millis (result i32)))
  (memory (export "memory") 1)
  (func (export "version") (result i32) (i32.const 1))
  (func (export "negate") (param i32) (result i32)
    (i32.sub (i32.const 0) (local.get 0)))
  (func (export "add") (param i32 i32) (result i32)
    (i32.add (local.get 0) (local.get 1)))
  (func (export "uptime") (result i32) (call $millis))
  (func (export "sum_to") (param $n i32) (result i32)
    (local $acc i32)
    (block $done
      (loop $next
        (br_if $done (i32.eqz (local.get $n)))
        (local.set $acc (i32.add (local.get $acc) (local.get $n)))
        (local.set $n (i32.sub (local.get $n) (i32.const 1)))
        (br $next)))
    (local.get $acc))
  (func (export "fill") (param $len i32)
    (memory.fill (i32.const 0) (i32.const 0xAB) (local.get $len)))
)
"#;

fn main() {
    println!("=== Host Bridge Benchmarks ===\n");

    let bytes = wat::parse_str(BENCH_WAT).unwrap();

    bench_module_loading(&bytes);
    bench_function_calls(&bytes);
    bench_host_import(&bytes);
    bench_memory_operations(&bytes);
    bench_with_fuel_metering(&bytes);
    bench_native_comparison(&bytes);

    println!("\n=== Benchmark Complete ===");
}

fn runtime(config: RuntimeConfig) -> Runtime {
    let runtime = Runtime::initialize(config).unwrap();
    runtime
        .register(
            "native_millis",
            NativeSignature::new(&[], Some(NativeType::U32)),
            |_call| Ok(Some(Value::from_u32(0))),
        )
        .unwrap();
    runtime
}

fn bench_module_loading(bytes: &[u8]) {
    println!("## Load + Unload");

    let runtime = runtime(RuntimeConfig::default());
    let mut times = Vec::new();

    // Warm up
    ModuleInstance::load_with_defaults(&runtime, bytes).unwrap().unload();

    for _ in 0..100 {
        let start = Instant::now();
        let instance = ModuleInstance::load_with_defaults(&runtime, bytes).unwrap();
        times.push(start.elapsed().as_micros() as u64);
        instance.unload();
    }

    print_stats("load", &times);
    println!("  {}", runtime.memory_usage());
    println!();
}

fn bench_function_calls(bytes: &[u8]) {
    println!("## Function Call Overhead");

    let runtime = runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, bytes).unwrap();
    let iterations = 2_000;

    let bench = CallBenchmark::measure(&mut instance, "version", &[], iterations).unwrap();
    println!("  () -> i32 (version):       {}", bench.summary());

    let bench = CallBenchmark::measure(&mut instance, "negate", &[7], iterations).unwrap();
    println!("  (i32) -> i32 (negate):     {}", bench.summary());

    let bench = CallBenchmark::measure(&mut instance, "add", &[42, 58], iterations).unwrap();
    println!("  (i32, i32) -> i32 (add):   {}", bench.summary());

    // Typed path, no word marshaling
    let mut bench = CallBenchmark::new();
    for i in 0..iterations {
        let stats = instance.invoke("add", &[Value::I32(i as i32), Value::I32(1)]).unwrap();
        bench.record(&stats);
    }
    println!("  invoke (add):              {}", bench.summary());

    println!();
}

fn bench_host_import(bytes: &[u8]) {
    println!("## Native Import Round Trip");

    let runtime = runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, bytes).unwrap();

    let bench = CallBenchmark::measure(&mut instance, "uptime", &[], 2_000).unwrap();
    println!("  uptime -> native_millis:   {}", bench.summary());
    println!();
}

fn bench_memory_operations(bytes: &[u8]) {
    println!("## Linear Memory");

    let runtime = runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, bytes).unwrap();

    for len in [1024u32, 16 * 1024, 64 * 1024] {
        let bench = CallBenchmark::measure(&mut instance, "fill", &[len], 500).unwrap();
        println!("  fill {:>6} bytes:         {}", len, bench.summary());
    }
    println!();
}

fn bench_with_fuel_metering(bytes: &[u8]) {
    println!("## Fuel Metering");

    for fuel in [None, Some(10_000_000u64)] {
        let config = match fuel {
            Some(fuel) => RuntimeConfig::default().fuel_limit(fuel),
            None => RuntimeConfig::default(),
        };
        let runtime = runtime(config);
        let mut instance = ModuleInstance::load_with_defaults(&runtime, bytes).unwrap();

        let bench = CallBenchmark::measure(&mut instance, "sum_to", &[10_000], 200).unwrap();
        let label = if fuel.is_some() { "metered" } else { "unmetered" };
        println!("  sum_to(10000) {:<10} {}", label, bench.summary());
    }
    println!();
}

fn bench_native_comparison(bytes: &[u8]) {
    println!("## Native Comparison");

    let runtime = runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, bytes).unwrap();

    let mut argv = [10_000];
    let stats = instance.call("sum_to", 1, &mut argv).unwrap();
    let wasm_us = stats.execution_time_us;

    let start = Instant::now();
    let native = std::hint::black_box((1..=10_000u32).fold(0u32, |acc, n| acc.wrapping_add(n)));
    let native_us = start.elapsed().as_micros() as u64;

    assert_eq!(argv[0], native);
    println!("  sum_to(10000): wasm {} us, native {} us", wasm_us, native_us);
}

fn print_stats(name: &str, times: &[u64]) {
    let mut sorted = times.to_vec();
    sorted.sort_unstable();
    let mean = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
    println!(
        "  {}: n={} min={}us mean={:.1}us p50={}us max={}us",
        name,
        sorted.len(),
        sorted[0],
        mean,
        sorted[sorted.len() / 2],
        sorted[sorted.len() - 1]
    );
}
