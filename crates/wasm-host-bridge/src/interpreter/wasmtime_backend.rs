//! Interpreter implementation using wasmtime.
//!
//! Each module gets its own [`Engine`] so the guest stack limit
//! (`max_wasm_stack`) and the epoch counter used for interruption are
//! scoped to a single instance.

use wasmtime::{
    Caller, Config, Engine, Extern, ExternType, FuncType, Linker, Module, OptLevel, Store, StoreLimits,
    StoreLimitsBuilder, Val, ValType,
};

use super::{
    CallBudget, ExportDecl, ImportDecl, ImportKind, InstanceLimits, InterruptHandle, Interpreter, MemoryDecl,
    ModuleInfo,
};
use crate::config::{RuntimeConfig, WASM_PAGE_SIZE};
use crate::error::{BridgeError, HostError, Result, Trap, TrapKind};
use crate::imports::{GuestMemory, HostCall, NativeImportTable, NativeType};
use crate::value::{FuncSignature, Value, ValueKind};

/// Epoch deadline used when a call is not interruptible.
const NO_DEADLINE: u64 = u64::MAX / 2;

/// Tables a single instance may create.
const MAX_TABLES: usize = 4;

/// Per-store host state.
pub struct HostState {
    limits: StoreLimits,
}

/// wasmtime-backed interpreter.
#[derive(Debug, Clone)]
pub struct WasmtimeInterpreter {
    optimization_level: u8,
    fuel_limit: Option<u64>,
    max_table_elements: usize,
}

/// A compiled module bound to its own engine.
pub struct WasmtimeModule {
    module: Module,
}

/// An instantiated module.
pub struct WasmtimeInstance {
    store: Store<HostState>,
    instance: wasmtime::Instance,
}

/// Interrupts calls by bumping the instance engine's epoch.
#[derive(Clone)]
pub struct EpochInterrupt {
    engine: Engine,
}

impl InterruptHandle for EpochInterrupt {
    fn interrupt(&self) {
        self.engine.increment_epoch();
    }
}

impl WasmtimeInterpreter {
    /// Create the interpreter and check that an engine can be built.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let interpreter = Self {
            optimization_level: config.optimization_level,
            fuel_limit: config.fuel_limit,
            max_table_elements: config.max_table_elements,
        };
        interpreter.engine(config.default_stack_size)?;
        Ok(interpreter)
    }

    fn engine(&self, stack_size: usize) -> Result<Engine> {
        let mut engine_config = Config::new();

        engine_config.cranelift_opt_level(match self.optimization_level {
            0 => OptLevel::None,
            1 => OptLevel::Speed,
            _ => OptLevel::SpeedAndSize,
        });

        // Guest frames beyond this trap with a stack overflow
        engine_config.max_wasm_stack(stack_size);

        // One linear memory per instance, matching the single arena region
        engine_config.wasm_multi_memory(false);

        // Deadlines are set per call; see `invoke`
        engine_config.epoch_interruption(true);

        if self.fuel_limit.is_some() {
            engine_config.consume_fuel(true);
        }

        Engine::new(&engine_config)
            .map_err(|e| BridgeError::Interpreter(format!("engine creation failed: {}", e)))
    }
}

impl Interpreter for WasmtimeInterpreter {
    type Module = WasmtimeModule;
    type Linker = Linker<HostState>;
    type Instance = WasmtimeInstance;
    type Interrupt = EpochInterrupt;

    fn load(&self, bytecode: &[u8], limits: &InstanceLimits) -> Result<WasmtimeModule> {
        let engine = self.engine(limits.stack_size)?;
        let module = Module::new(&engine, bytecode)
            .map_err(|e| BridgeError::MalformedBytecode(format!("{:#}", e)))?;
        Ok(WasmtimeModule { module })
    }

    fn describe(&self, module: &WasmtimeModule) -> ModuleInfo {
        let module = &module.module;

        let imports = module
            .imports()
            .map(|import| ImportDecl {
                module: import.module().to_string(),
                name: import.name().to_string(),
                kind: match import.ty() {
                    ExternType::Func(ty) => ImportKind::Function(signature_of(&ty)),
                    ExternType::Memory(_) => ImportKind::Memory,
                    _ => ImportKind::Other,
                },
            })
            .collect();

        let mut exports = Vec::new();
        let mut declared_max = None;
        for export in module.exports() {
            match export.ty() {
                ExternType::Func(ty) => exports.push(ExportDecl {
                    name: export.name().to_string(),
                    signature: signature_of(&ty),
                }),
                ExternType::Memory(ty) => declared_max = ty.maximum(),
                _ => {}
            }
        }

        let required = module.resources_required();
        let memory = (required.num_memories > 0).then(|| MemoryDecl {
            min_bytes: required.max_initial_memory_size.unwrap_or(0) * WASM_PAGE_SIZE,
            max_bytes: declared_max.map(|pages| pages * WASM_PAGE_SIZE),
        });

        ModuleInfo {
            imports,
            exports,
            memory,
            memory_count: required.num_memories as usize,
        }
    }

    fn link(&self, module: &WasmtimeModule, imports: &NativeImportTable) -> Result<Linker<HostState>> {
        let engine = module.module.engine();
        let mut linker: Linker<HostState> = Linker::new(engine);

        for import in imports.iter() {
            let signature = import.signature();
            let ty = FuncType::new(
                engine,
                signature.params().iter().map(|p| val_type(*p)),
                signature.result().into_iter().map(val_type),
            );
            let native = import.clone();

            linker
                .func_new(
                    import.namespace(),
                    import.name(),
                    ty,
                    move |mut caller: Caller<'_, HostState>, params: &[Val], results: &mut [Val]| {
                        let args = params
                            .iter()
                            .map(value_of)
                            .collect::<Option<Vec<_>>>()
                            .ok_or_else(|| wasmtime::Error::msg("unsupported parameter type"))?;

                        let memory = caller.get_export("memory").and_then(Extern::into_memory);
                        let data = match memory {
                            Some(memory) => Some(memory.data_mut(&mut caller)),
                            None => None,
                        };
                        let mut call =
                            HostCall::new(native.name(), native.signature(), &args, data.map(GuestMemory::new));

                        let returned = native.invoke(&mut call).map_err(wasmtime::Error::new)?;
                        if let (Some(slot), Some(value)) = (results.first_mut(), returned) {
                            *slot = val_of(value);
                        }
                        Ok(())
                    },
                )
                .map_err(|e| {
                    BridgeError::Interpreter(format!(
                        "failed to link {}.{}: {}",
                        import.namespace(),
                        import.name(),
                        e
                    ))
                })?;
        }

        Ok(linker)
    }

    fn instantiate(
        &self,
        module: &WasmtimeModule,
        linker: &Linker<HostState>,
        limits: &InstanceLimits,
    ) -> Result<WasmtimeInstance> {
        let engine = module.module.engine();
        let store_limits = StoreLimitsBuilder::new()
            .memory_size(limits.memory_size)
            .memories(1)
            .tables(MAX_TABLES)
            .table_elements(self.max_table_elements)
            .instances(1)
            .build();
        let mut store = Store::new(engine, HostState { limits: store_limits });
        store.limiter(|state| &mut state.limits);
        store.set_epoch_deadline(NO_DEADLINE);

        // The start routine needs fuel too
        if let Some(fuel) = self.fuel_limit {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::Interpreter(format!("fuel setup failed: {}", e)))?;
        }

        let instance = linker
            .instantiate(&mut store, &module.module)
            .map_err(|e| BridgeError::InstantiationTrap(classify_trap(&e)))?;

        Ok(WasmtimeInstance { store, instance })
    }

    fn invoke(
        &self,
        instance: &mut WasmtimeInstance,
        function: &str,
        args: &[Value],
        budget: &CallBudget,
    ) -> Result<Option<Value>> {
        let WasmtimeInstance { store, instance } = instance;

        let func = instance
            .get_func(&mut *store, function)
            .ok_or_else(|| BridgeError::ExportNotFound(function.to_string()))?;

        if let Some(fuel) = budget.fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| BridgeError::Interpreter(format!("fuel setup failed: {}", e)))?;
        }
        store.set_epoch_deadline(if budget.interruptible { 1 } else { NO_DEADLINE });

        let params: Vec<Val> = args.iter().map(|v| val_of(*v)).collect();
        let result_count = func.ty(&*store).results().len();
        let mut results = vec![Val::I32(0); result_count];

        func.call(&mut *store, &params, &mut results)
            .map_err(|e| BridgeError::Trap {
                function: function.to_string(),
                trap: classify_trap(&e),
            })?;

        match results.first() {
            None => Ok(None),
            Some(val) => value_of(val).map(Some).ok_or_else(|| BridgeError::UnsupportedSignature {
                function: function.to_string(),
                detail: "result is not a numeric value".to_string(),
            }),
        }
    }

    fn interrupt_handle(&self, instance: &WasmtimeInstance) -> EpochInterrupt {
        EpochInterrupt {
            engine: instance.store.engine().clone(),
        }
    }

    fn remaining_fuel(&self, instance: &WasmtimeInstance) -> Option<u64> {
        instance.store.get_fuel().ok()
    }
}

fn signature_of(ty: &FuncType) -> FuncSignature {
    FuncSignature {
        params: ty.params().map(|t| kind_of(&t)).collect(),
        results: ty.results().map(|t| kind_of(&t)).collect(),
    }
}

fn kind_of(ty: &ValType) -> ValueKind {
    match ty {
        ValType::I32 => ValueKind::I32,
        ValType::I64 => ValueKind::I64,
        ValType::F32 => ValueKind::F32,
        ValType::F64 => ValueKind::F64,
        ValType::V128 => ValueKind::V128,
        _ => ValueKind::Ref,
    }
}

fn val_type(ty: NativeType) -> ValType {
    match ty.lower() {
        ValueKind::I64 => ValType::I64,
        ValueKind::F32 => ValType::F32,
        ValueKind::F64 => ValType::F64,
        _ => ValType::I32,
    }
}

fn val_of(value: Value) -> Val {
    match value {
        Value::I32(v) => Val::I32(v),
        Value::I64(v) => Val::I64(v),
        Value::F32(v) => Val::F32(v.to_bits()),
        Value::F64(v) => Val::F64(v.to_bits()),
    }
}

fn value_of(val: &Val) -> Option<Value> {
    match val {
        Val::I32(v) => Some(Value::I32(*v)),
        Val::I64(v) => Some(Value::I64(*v)),
        Val::F32(bits) => Some(Value::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Some(Value::F64(f64::from_bits(*bits))),
        _ => None,
    }
}

/// Map an interpreter error onto a trap category.
fn classify_trap(err: &wasmtime::Error) -> Trap {
    let detail = err.root_cause().to_string();

    if err.downcast_ref::<HostError>().is_some() {
        return Trap::new(TrapKind::HostFunction, detail);
    }

    let kind = match err.downcast_ref::<wasmtime::Trap>() {
        Some(wasmtime::Trap::StackOverflow) => TrapKind::StackOverflow,
        Some(wasmtime::Trap::MemoryOutOfBounds) | Some(wasmtime::Trap::HeapMisaligned) => {
            TrapKind::MemoryOutOfBounds
        }
        Some(wasmtime::Trap::UnreachableCodeReached) => TrapKind::Unreachable,
        Some(wasmtime::Trap::IntegerDivisionByZero)
        | Some(wasmtime::Trap::IntegerOverflow)
        | Some(wasmtime::Trap::BadConversionToInteger) => TrapKind::Arithmetic,
        Some(wasmtime::Trap::TableOutOfBounds)
        | Some(wasmtime::Trap::IndirectCallToNull)
        | Some(wasmtime::Trap::BadSignature) => TrapKind::IndirectCall,
        Some(wasmtime::Trap::OutOfFuel) => TrapKind::FuelExhausted,
        Some(wasmtime::Trap::Interrupt) => TrapKind::Interrupted,
        _ => TrapKind::Other,
    };
    Trap::new(kind, detail)
}
