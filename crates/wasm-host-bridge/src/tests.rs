//! Bridge tests against a scripted interpreter.
//!
//! These drive the load and dispatch paths without compiling any
//! bytecode, which makes worker placement, panics and interruption easy
//! to provoke deterministically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::*;
use crate::interpreter::{ExportDecl, MemoryDecl};

const HEADER: &[u8] = b"\0asm\x01\0\0\0";

#[derive(Clone, Default)]
struct ScriptedInterpreter {
    info: ModuleInfo,
}

struct ScriptedInstance {
    interrupted: Arc<AtomicBool>,
}

struct ScriptedInterrupt(Arc<AtomicBool>);

impl InterruptHandle for ScriptedInterrupt {
    fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl ScriptedInterpreter {
    fn with_exports(exports: &[(&str, FuncSignature)]) -> Self {
        let exports = exports
            .iter()
            .map(|(name, signature)| ExportDecl {
                name: name.to_string(),
                signature: signature.clone(),
            })
            .collect();
        Self {
            info: ModuleInfo {
                exports,
                ..Default::default()
            },
        }
    }
}

impl Interpreter for ScriptedInterpreter {
    type Module = ModuleInfo;
    type Linker = ();
    type Instance = ScriptedInstance;
    type Interrupt = ScriptedInterrupt;

    fn load(&self, _bytecode: &[u8], _limits: &InstanceLimits) -> Result<ModuleInfo> {
        Ok(self.info.clone())
    }

    fn describe(&self, module: &ModuleInfo) -> ModuleInfo {
        module.clone()
    }

    fn link(&self, _module: &ModuleInfo, _imports: &NativeImportTable) -> Result<()> {
        Ok(())
    }

    fn instantiate(&self, _module: &ModuleInfo, _linker: &(), _limits: &InstanceLimits) -> Result<ScriptedInstance> {
        Ok(ScriptedInstance {
            interrupted: Arc::new(AtomicBool::new(false)),
        })
    }

    fn invoke(
        &self,
        instance: &mut ScriptedInstance,
        function: &str,
        args: &[Value],
        budget: &CallBudget,
    ) -> Result<Option<Value>> {
        instance.interrupted.store(false, Ordering::SeqCst);
        match function {
            "add" => {
                let sum = args.iter().filter_map(Value::as_i32).fold(0i32, i32::wrapping_add);
                Ok(Some(Value::I32(sum)))
            }
            "on_worker" => {
                let on_worker = thread::current().name() == Some("wasm-call");
                Ok(Some(Value::I32(on_worker as i32)))
            }
            "panic" => panic!("sensor bus fault"),
            "spin" => loop {
                if budget.interruptible && instance.interrupted.load(Ordering::SeqCst) {
                    return Err(BridgeError::Trap {
                        function: function.to_string(),
                        trap: Trap::new(TrapKind::Interrupted, "interrupted"),
                    });
                }
                thread::sleep(Duration::from_millis(1));
            },
            other => Err(BridgeError::ExportNotFound(other.to_string())),
        }
    }

    fn interrupt_handle(&self, instance: &ScriptedInstance) -> ScriptedInterrupt {
        ScriptedInterrupt(Arc::clone(&instance.interrupted))
    }

    fn remaining_fuel(&self, _instance: &ScriptedInstance) -> Option<u64> {
        None
    }
}

fn binary_i32() -> FuncSignature {
    FuncSignature::new(&[ValueKind::I32, ValueKind::I32], &[ValueKind::I32])
}

fn nullary_i32() -> FuncSignature {
    FuncSignature::new(&[], &[ValueKind::I32])
}

fn scripted_runtime(config: RuntimeConfig) -> Runtime<ScriptedInterpreter> {
    let interpreter = ScriptedInterpreter::with_exports(&[
        ("add", binary_i32()),
        ("on_worker", nullary_i32()),
        ("panic", nullary_i32()),
        ("spin", nullary_i32()),
        ("pair", FuncSignature::new(&[], &[ValueKind::I32, ValueKind::I32])),
        ("wide", FuncSignature::new(&[ValueKind::I64], &[ValueKind::I64])),
    ]);
    Runtime::with_interpreter(config, interpreter).unwrap()
}

#[test]
fn test_call_marshals_words() {
    let runtime = scripted_runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, HEADER).unwrap();

    let mut argv = [42, 58];
    let stats = instance.call("add", 2, &mut argv).unwrap();
    assert_eq!(argv[0], 100);
    assert_eq!(stats.result, Some(Value::I32(100)));

    // Negative results come back as their bit pattern
    let mut argv = [5, (-8i32) as u32];
    instance.call("add", 2, &mut argv).unwrap();
    assert_eq!(argv[0] as i32, -3);
}

#[test]
fn test_call_runs_on_worker_thread() {
    let runtime = scripted_runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, HEADER).unwrap();

    let mut argv = [0];
    instance.call("on_worker", 0, &mut argv).unwrap();
    assert_eq!(argv[0], 1);
}

#[test]
fn test_call_checks_before_dispatch() {
    let runtime = scripted_runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, HEADER).unwrap();

    let mut argv = [1, 2, 3];
    assert!(matches!(
        instance.call("add", 3, &mut argv),
        Err(BridgeError::ArgCountMismatch { expected: 2, actual: 3, .. })
    ));

    let mut short = [1];
    assert!(matches!(
        instance.call("add", 2, &mut short),
        Err(BridgeError::ArgBufferTooSmall { needed: 2, actual: 1, .. })
    ));

    let mut empty: [u32; 0] = [];
    assert!(matches!(
        instance.call("on_worker", 0, &mut empty),
        Err(BridgeError::ArgBufferTooSmall { needed: 1, .. })
    ));

    let mut argv = [0, 0];
    assert!(matches!(
        instance.call("pair", 0, &mut argv),
        Err(BridgeError::UnsupportedSignature { .. })
    ));
    // An unsupported signature is reported even when argv is also short
    let mut one = [0];
    assert!(matches!(
        instance.call("pair", 0, &mut one),
        Err(BridgeError::UnsupportedSignature { .. })
    ));
    assert!(matches!(
        instance.call("wide", 1, &mut argv),
        Err(BridgeError::UnsupportedSignature { .. })
    ));

    assert!(matches!(
        instance.call("Add", 2, &mut argv),
        Err(BridgeError::ExportNotFound(name)) if name == "Add"
    ));
    assert_eq!(instance.last_error(), Some("export not found: Add"));
}

#[test]
fn test_invoke_checks_types() {
    let runtime = scripted_runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, HEADER).unwrap();

    let stats = instance.invoke("add", &[Value::I32(2), Value::I32(3)]).unwrap();
    assert_eq!(stats.result, Some(Value::I32(5)));

    assert!(matches!(
        instance.invoke("add", &[Value::I32(2), Value::F32(3.0)]),
        Err(BridgeError::ArgTypeMismatch { index: 1, expected: ValueKind::I32, actual: ValueKind::F32, .. })
    ));
    assert!(matches!(
        instance.invoke("add", &[Value::I32(2)]),
        Err(BridgeError::ArgCountMismatch { .. })
    ));
}

#[test]
fn test_host_panic_is_contained() {
    let runtime = scripted_runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, HEADER).unwrap();
    let marker = String::from("caller state");

    let mut argv = [0];
    let err = instance.call("panic", 0, &mut argv).unwrap_err();
    let trap = err.trap().expect("panic should surface as a trap");
    assert_eq!(trap.kind, TrapKind::HostPanic);
    assert!(trap.detail.contains("sensor bus fault"));
    assert_eq!(err.category(), ErrorCategory::Invocation);
    assert_eq!(marker, "caller state");

    let mut argv = [20, 22];
    instance.call("add", 2, &mut argv).unwrap();
    assert_eq!(argv[0], 42);
}

#[test]
fn test_timeout_interrupts_and_instance_survives() {
    let runtime = scripted_runtime(RuntimeConfig::default().call_timeout_ms(50));
    let mut instance = ModuleInstance::load_with_defaults(&runtime, HEADER).unwrap();

    let mut argv = [0];
    let err = instance.call("spin", 0, &mut argv).unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { timeout_ms: 50, .. }));
    assert!(instance.last_error().unwrap().contains("timed out"));

    let mut argv = [1, 1];
    instance.call("add", 2, &mut argv).unwrap();
    assert_eq!(argv[0], 2);
}

#[test]
fn test_load_rejects_header_before_locking() {
    let runtime = scripted_runtime(RuntimeConfig::default());
    let err = ModuleInstance::load_with_defaults(&runtime, b"\0asm").unwrap_err();
    assert!(matches!(err, BridgeError::MalformedBytecode(_)));
    assert_eq!(err.category(), ErrorCategory::Load);
    // A rejected header never seals the table
    assert!(!runtime.is_sealed());
    assert!(runtime.last_error().unwrap().starts_with("malformed bytecode"));
}

#[test]
fn test_load_rejects_invalid_sizes() {
    let runtime = scripted_runtime(RuntimeConfig::default());
    assert!(matches!(
        ModuleInstance::load(&runtime, HEADER, 16, 64 * 1024),
        Err(BridgeError::InvalidSize { what: "stack", .. })
    ));
    assert!(matches!(
        ModuleInstance::load(&runtime, HEADER, 16 * 1024, 0),
        Err(BridgeError::InvalidSize { what: "memory", .. })
    ));
}

#[test]
fn test_load_checks_memory_limit_and_imports() {
    let mut interpreter = ScriptedInterpreter::default();
    interpreter.info.memory = Some(MemoryDecl {
        min_bytes: 128 * 1024,
        max_bytes: None,
    });
    let runtime = Runtime::with_interpreter(RuntimeConfig::default(), interpreter.clone()).unwrap();
    assert!(matches!(
        ModuleInstance::load(&runtime, HEADER, 16 * 1024, 64 * 1024),
        Err(BridgeError::MemoryLimit { required: 131072, limit: 65536 })
    ));

    interpreter.info.memory = None;
    interpreter.info.imports = vec![ImportDecl {
        module: "env".to_string(),
        name: "native_digital_write".to_string(),
        kind: ImportKind::Function(FuncSignature::new(&[ValueKind::I32, ValueKind::I32], &[])),
    }];
    let runtime = Runtime::with_interpreter(RuntimeConfig::default(), interpreter).unwrap();
    let err = ModuleInstance::load_with_defaults(&runtime, HEADER).unwrap_err();
    assert_eq!(err.to_string(), "unresolved import: env.native_digital_write");
    assert_eq!(runtime.memory_usage().used, 0);
}

#[test]
fn test_regions_follow_instance_lifetime() {
    let mut interpreter = ScriptedInterpreter::default();
    interpreter.info.memory = Some(MemoryDecl {
        min_bytes: 64 * 1024,
        max_bytes: None,
    });
    let runtime = Runtime::with_interpreter(RuntimeConfig::default().heap_size(96 * 1024), interpreter).unwrap();

    let first = ModuleInstance::load(&runtime, HEADER, 16 * 1024, 64 * 1024).unwrap();
    assert_eq!(first.reserved_bytes(), 80 * 1024);
    assert_eq!(runtime.memory_usage().used, 80 * 1024);

    // No room for a second instance while the first is alive
    assert!(matches!(
        ModuleInstance::load(&runtime, HEADER, 16 * 1024, 64 * 1024),
        Err(BridgeError::ArenaExhausted { .. })
    ));
    // A failed load leaves nothing behind
    assert_eq!(runtime.memory_usage().live_regions, 2);

    first.unload();
    assert_eq!(runtime.memory_usage().used, 0);

    let second = ModuleInstance::load(&runtime, HEADER, 16 * 1024, 64 * 1024).unwrap();
    drop(second);
    let usage = runtime.memory_usage();
    assert_eq!(usage.used, 0);
    assert_eq!(usage.peak, 80 * 1024);
}

#[test]
fn test_multiple_memories_rejected() {
    let mut interpreter = ScriptedInterpreter::default();
    interpreter.info.memory = Some(MemoryDecl {
        min_bytes: 64 * 1024,
        max_bytes: None,
    });
    interpreter.info.memory_count = 2;
    let runtime = Runtime::with_interpreter(RuntimeConfig::default(), interpreter).unwrap();

    let err = ModuleInstance::load_with_defaults(&runtime, HEADER).unwrap_err();
    assert!(matches!(err, BridgeError::MalformedBytecode(ref detail) if detail.contains("2 linear memories")));
    assert_eq!(runtime.memory_usage().live_regions, 0);
}

#[test]
fn test_benchmark_measure() {
    let runtime = scripted_runtime(RuntimeConfig::default());
    let mut instance = ModuleInstance::load_with_defaults(&runtime, HEADER).unwrap();

    let bench = CallBenchmark::measure(&mut instance, "add", &[2, 2], 10).unwrap();
    assert_eq!(bench.count(), 10);
    assert!(bench.summary().contains("n=10"));

    assert!(matches!(
        CallBenchmark::measure(&mut instance, "missing", &[], 1),
        Err(BridgeError::ExportNotFound(_))
    ));
}
