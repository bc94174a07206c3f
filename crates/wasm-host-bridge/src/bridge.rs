//! Invocation bridge.
//!
//! Marshals the word-based argument buffer into typed values and runs the
//! call on a dedicated worker thread whose stack is sized from the
//! instance's execution stack. The caller blocks until the worker is
//! joined. A guest trap, a panicking host function or a timeout all come
//! back as errors on the calling thread; the instance stays usable.
//!
//! ```rust,ignore
//! let mut argv = [42, 58];
//! let stats = instance.call("add", 2, &mut argv)?;
//! assert_eq!(argv[0], 100);
//! println!("took {}us", stats.execution_time_us);
//! ```

use std::any::Any;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{BridgeError, Result, Trap, TrapKind};
use crate::instance::ModuleInstance;
use crate::interpreter::{CallBudget, InterruptHandle, Interpreter};
use crate::value::{FuncSignature, Value};

/// Name given to call worker threads.
const WORKER_NAME: &str = "wasm-call";

/// Outcome of a successful call with timing information.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CallStats {
    /// The single result, if the function returns one
    #[serde(skip)]
    pub result: Option<Value>,
    /// Execution time in microseconds, including worker setup
    pub execution_time_us: u64,
    /// Fuel consumed (if fuel metering enabled)
    pub fuel_consumed: Option<u64>,
}

/// Call `function` on `instance` using the word calling convention.
///
/// `argv[..argc]` holds the arguments, one 32-bit word each (`i32` as its
/// bit pattern, `f32` via [`f32::to_bits`]). On success the result, if any,
/// overwrites `argv[0]`. On failure `argv` is unspecified and
/// [`ModuleInstance::last_error`] holds the detail.
pub fn call<I: Interpreter>(
    instance: &mut ModuleInstance<'_, I>,
    function: &str,
    argc: usize,
    argv: &mut [u32],
) -> Result<CallStats> {
    let result = call_words(instance, function, argc, argv);
    instance.track(result)
}

/// Call `function` with typed arguments. Same checks as [`call`] except
/// that 64-bit values are accepted.
pub fn invoke<I: Interpreter>(
    instance: &mut ModuleInstance<'_, I>,
    function: &str,
    args: &[Value],
) -> Result<CallStats> {
    let result = invoke_values(instance, function, args);
    instance.track(result)
}

fn signature_of<I: Interpreter>(instance: &ModuleInstance<'_, I>, function: &str) -> Result<FuncSignature> {
    instance
        .exports
        .get(function)
        .cloned()
        .ok_or_else(|| BridgeError::ExportNotFound(function.to_string()))
}

fn check_single_result(function: &str, signature: &FuncSignature) -> Result<()> {
    if signature.results.len() > 1 {
        return Err(BridgeError::UnsupportedSignature {
            function: function.to_string(),
            detail: format!("{} results, at most one is supported", signature.results.len()),
        });
    }
    Ok(())
}

fn call_words<I: Interpreter>(
    instance: &mut ModuleInstance<'_, I>,
    function: &str,
    argc: usize,
    argv: &mut [u32],
) -> Result<CallStats> {
    let signature = signature_of(instance, function)?;

    if argc != signature.params.len() {
        return Err(BridgeError::ArgCountMismatch {
            function: function.to_string(),
            expected: signature.params.len(),
            actual: argc,
        });
    }

    check_single_result(function, &signature)?;
    if let Some(kind) = signature.params.iter().chain(&signature.results).find(|k| !k.is_word()) {
        return Err(BridgeError::UnsupportedSignature {
            function: function.to_string(),
            detail: format!("{kind} does not fit in a 32-bit word"),
        });
    }

    let needed = argc.max(signature.results.len());
    if argv.len() < needed {
        return Err(BridgeError::ArgBufferTooSmall {
            function: function.to_string(),
            needed,
            actual: argv.len(),
        });
    }

    let args: Vec<Value> = signature
        .params
        .iter()
        .zip(argv.iter())
        .filter_map(|(kind, word)| Value::from_word(*kind, *word))
        .collect();

    let stats = dispatch(instance, function, &args)?;

    if let Some(value) = stats.result {
        argv[0] = value.to_word().ok_or_else(|| BridgeError::UnsupportedSignature {
            function: function.to_string(),
            detail: format!("{} result does not fit in a 32-bit word", value.kind()),
        })?;
    }
    Ok(stats)
}

fn invoke_values<I: Interpreter>(
    instance: &mut ModuleInstance<'_, I>,
    function: &str,
    args: &[Value],
) -> Result<CallStats> {
    let signature = signature_of(instance, function)?;

    if args.len() != signature.params.len() {
        return Err(BridgeError::ArgCountMismatch {
            function: function.to_string(),
            expected: signature.params.len(),
            actual: args.len(),
        });
    }

    check_single_result(function, &signature)?;

    for (index, (expected, arg)) in signature.params.iter().zip(args).enumerate() {
        if *expected != arg.kind() {
            return Err(BridgeError::ArgTypeMismatch {
                function: function.to_string(),
                index,
                expected: *expected,
                actual: arg.kind(),
            });
        }
    }

    dispatch(instance, function, args)
}

/// Run one call on a scoped worker thread and wait for it.
fn dispatch<I: Interpreter>(
    instance: &mut ModuleInstance<'_, I>,
    function: &str,
    args: &[Value],
) -> Result<CallStats> {
    let runtime = instance.runtime;
    let config = runtime.config();
    let interpreter = runtime.interpreter();

    let timeout = (config.call_timeout_ms > 0).then(|| Duration::from_millis(config.call_timeout_ms));
    let budget = CallBudget {
        interruptible: timeout.is_some(),
        fuel: config.fuel_limit,
    };
    let interrupt = interpreter.interrupt_handle(&instance.raw);
    let worker_stack = instance.limits.stack_size.saturating_add(config.worker_stack_headroom);

    tracing::debug!(function, args = args.len(), worker_stack, "dispatching call");

    let start = Instant::now();
    let raw = &mut instance.raw;

    let (joined, timed_out) = thread::scope(|scope| {
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let worker = thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .stack_size(worker_stack)
            .spawn_scoped(scope, move || {
                let result = interpreter.invoke(raw, function, args, &budget);
                let _ = done_tx.send(());
                result
            })
            .map_err(|e| BridgeError::ResourceExhausted(format!("call worker for '{}': {}", function, e)))?;

        let mut timed_out = false;
        if let Some(limit) = timeout {
            // A disconnect means the worker is already gone (it panicked)
            if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(limit) {
                interrupt.interrupt();
                timed_out = true;
            }
        }

        Ok::<_, BridgeError>((worker.join(), timed_out))
    })?;

    let execution_time_us = start.elapsed().as_micros() as u64;

    let result = match joined {
        Ok(result) => result,
        Err(payload) => Err(BridgeError::Trap {
            function: function.to_string(),
            trap: Trap::new(TrapKind::HostPanic, panic_message(payload.as_ref())),
        }),
    };

    let result = match result {
        // The call may have finished just as the deadline passed
        Err(BridgeError::Trap { trap, .. }) if timed_out && trap.kind == TrapKind::Interrupted => {
            Err(BridgeError::Timeout {
                function: function.to_string(),
                timeout_ms: config.call_timeout_ms,
            })
        }
        other => other,
    };

    match &result {
        Ok(value) => tracing::debug!(function, result = ?value, execution_time_us, "call returned"),
        Err(BridgeError::Timeout { timeout_ms, .. }) => {
            tracing::warn!(function, timeout_ms, "guest call timed out and was interrupted")
        }
        Err(err) => match err.trap() {
            Some(trap) => tracing::warn!(function, kind = %trap.kind, detail = %trap.detail, "guest call trapped"),
            None => tracing::debug!(function, error = %err, "call failed"),
        },
    }

    let fuel_consumed = budget
        .fuel
        .zip(interpreter.remaining_fuel(&instance.raw))
        .map(|(granted, left)| granted.saturating_sub(left));

    Ok(CallStats {
        result: result?,
        execution_time_us,
        fuel_consumed,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("host function panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("host function panicked: {}", msg)
    } else {
        "host function panicked".to_string()
    }
}

/// Benchmark helper for measuring call overhead.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallBenchmark {
    samples: Vec<u64>,
    fuel: Vec<u64>,
}

impl CallBenchmark {
    /// Create a new benchmark collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Call `function` `iterations` times with a fresh copy of `args` each
    /// time, recording every call. Stops at the first failure.
    pub fn measure<I: Interpreter>(
        instance: &mut ModuleInstance<'_, I>,
        function: &str,
        args: &[u32],
        iterations: usize,
    ) -> Result<Self> {
        let expected = instance
            .exported_function(function)
            .ok_or_else(|| BridgeError::ExportNotFound(function.to_string()))?;
        let argc = args.len();
        let words = argc.max(expected.result_count()).max(1);

        let mut bench = Self::new();
        for _ in 0..iterations {
            let mut argv = vec![0u32; words];
            argv[..argc].copy_from_slice(args);
            let stats = instance.call(function, argc, &mut argv)?;
            bench.record(&stats);
        }
        Ok(bench)
    }

    /// Record one call.
    pub fn record(&mut self, stats: &CallStats) {
        self.samples.push(stats.execution_time_us);
        if let Some(fuel) = stats.fuel_consumed {
            self.fuel.push(fuel);
        }
    }

    /// Get the number of samples.
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Get the mean execution time in microseconds.
    pub fn mean_us(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64
    }

    /// Get a percentile value.
    pub fn percentile(&self, p: usize) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = (p * sorted.len() / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Get min execution time.
    pub fn min_us(&self) -> u64 {
        self.samples.iter().copied().min().unwrap_or(0)
    }

    /// Get max execution time.
    pub fn max_us(&self) -> u64 {
        self.samples.iter().copied().max().unwrap_or(0)
    }

    /// Mean fuel per call, if metering was on.
    pub fn mean_fuel(&self) -> Option<f64> {
        if self.fuel.is_empty() {
            return None;
        }
        Some(self.fuel.iter().sum::<u64>() as f64 / self.fuel.len() as f64)
    }

    /// One-line summary of the results.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "n={} min={}us mean={:.1}us p50={}us p99={}us max={}us",
            self.count(),
            self.min_us(),
            self.mean_us(),
            self.percentile(50),
            self.percentile(99),
            self.max_us()
        );
        if let Some(fuel) = self.mean_fuel() {
            line.push_str(&format!(" fuel={:.0}", fuel));
        }
        line
    }
}
