//! Board host functions for GPIO-style guest modules.
//!
//! Guests drive pins, read sensors, keep time and print through eight
//! native imports in the runtime's default namespace:
//!
//! ```wat
//! (import "env" "native_pin_mode" (func (param i32 i32)))
//! (import "env" "native_digital_write" (func (param i32 i32)))
//! (import "env" "native_digital_read" (func (param i32) (result i32)))
//! (import "env" "native_analog_read" (func (param i32) (result i32)))
//! (import "env" "native_millis" (func (result i32)))
//! (import "env" "native_delay" (func (param i32)))
//! (import "env" "native_print_string" (func (param i32)))
//! (import "env" "native_print_int" (func (param i32)))
//! ```
//!
//! Every argument is vetted before it reaches the [`Board`]: pins must be
//! in range, modes must be known, delays are capped at [`MAX_DELAY_MS`] and
//! strings are read from guest memory with a bounded, bounds-checked
//! [`GuestMemory::read_cstr`](crate::GuestMemory::read_cstr).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{HostError, Result};
use crate::imports::{NativeSignature, NativeType};
use crate::interpreter::Interpreter;
use crate::runtime::Runtime;
use crate::value::Value;

/// Longest delay a guest may request in one call.
pub const MAX_DELAY_MS: u32 = 60_000;

/// Longest string `native_print_string` reads, terminator excluded.
pub const MAX_PRINT_LEN: usize = 256;

/// Full-scale reading of the 12-bit analog inputs.
pub const ANALOG_MAX: u16 = 4095;

/// Pin direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinMode {
    /// Floating input
    Input,
    /// Push-pull output
    Output,
    /// Input with pull-up
    InputPullup,
}

impl PinMode {
    /// Decode the guest's mode number (0 INPUT, 1 OUTPUT, 2 INPUT_PULLUP).
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(PinMode::Input),
            1 => Some(PinMode::Output),
            2 => Some(PinMode::InputPullup),
            _ => None,
        }
    }
}

/// Hardware capabilities exposed to guests.
pub trait Board: Send {
    /// Number of GPIO pins; valid pins are `0..pin_count()`.
    fn pin_count(&self) -> u32;

    /// Configure a pin.
    fn pin_mode(&mut self, pin: u32, mode: PinMode);

    /// Drive a pin high or low.
    fn digital_write(&mut self, pin: u32, high: bool);

    /// Sample a pin.
    fn digital_read(&mut self, pin: u32) -> bool;

    /// Sample an analog input (0..=[`ANALOG_MAX`]).
    fn analog_read(&mut self, pin: u32) -> u16;

    /// Milliseconds since boot; wraps.
    fn millis(&self) -> u32;

    /// Block for `ms` milliseconds.
    fn delay(&mut self, ms: u32);

    /// Write text to the console.
    fn print(&mut self, text: &str);
}

/// Board host functions exposed to guest modules.
pub struct BoardHostFunctions;

impl BoardHostFunctions {
    /// Register all eight board imports against `board`.
    pub fn register<I, B>(runtime: &Runtime<I>, board: Arc<Mutex<B>>) -> Result<()>
    where
        I: Interpreter,
        B: Board + 'static,
    {
        // GPIO
        Self::register_pin_mode(runtime, &board)?;
        Self::register_digital_write(runtime, &board)?;
        Self::register_digital_read(runtime, &board)?;
        Self::register_analog_read(runtime, &board)?;

        // Timing
        Self::register_millis(runtime, &board)?;
        Self::register_delay(runtime, &board)?;

        // Console
        Self::register_print_string(runtime, &board)?;
        Self::register_print_int(runtime, &board)?;

        Ok(())
    }

    // ========================================================================
    // GPIO
    // ========================================================================

    fn register_pin_mode<I: Interpreter, B: Board + 'static>(runtime: &Runtime<I>, board: &Arc<Mutex<B>>) -> Result<()> {
        let board = Arc::clone(board);
        runtime.register(
            "native_pin_mode",
            NativeSignature::new(&[NativeType::I32, NativeType::I32], None),
            move |call| {
                let mut board = lock(&board);
                let pin = checked_pin(&*board, call.arg_i32(0)?)?;
                let raw = call.arg_i32(1)?;
                let mode = PinMode::from_raw(raw)
                    .ok_or_else(|| HostError::InvalidArgument(format!("unknown pin mode {}", raw)))?;
                board.pin_mode(pin, mode);
                Ok(None)
            },
        )
    }

    fn register_digital_write<I: Interpreter, B: Board + 'static>(
        runtime: &Runtime<I>,
        board: &Arc<Mutex<B>>,
    ) -> Result<()> {
        let board = Arc::clone(board);
        runtime.register(
            "native_digital_write",
            NativeSignature::new(&[NativeType::I32, NativeType::I32], None),
            move |call| {
                let mut board = lock(&board);
                let pin = checked_pin(&*board, call.arg_i32(0)?)?;
                board.digital_write(pin, call.arg_i32(1)? != 0);
                Ok(None)
            },
        )
    }

    fn register_digital_read<I: Interpreter, B: Board + 'static>(
        runtime: &Runtime<I>,
        board: &Arc<Mutex<B>>,
    ) -> Result<()> {
        let board = Arc::clone(board);
        runtime.register(
            "native_digital_read",
            NativeSignature::new(&[NativeType::I32], Some(NativeType::I32)),
            move |call| {
                let mut board = lock(&board);
                let pin = checked_pin(&*board, call.arg_i32(0)?)?;
                let level = board.digital_read(pin);
                Ok(Some(Value::I32(level as i32)))
            },
        )
    }

    fn register_analog_read<I: Interpreter, B: Board + 'static>(
        runtime: &Runtime<I>,
        board: &Arc<Mutex<B>>,
    ) -> Result<()> {
        let board = Arc::clone(board);
        runtime.register(
            "native_analog_read",
            NativeSignature::new(&[NativeType::I32], Some(NativeType::I32)),
            move |call| {
                let mut board = lock(&board);
                let pin = checked_pin(&*board, call.arg_i32(0)?)?;
                let value = board.analog_read(pin).min(ANALOG_MAX);
                Ok(Some(Value::I32(i32::from(value))))
            },
        )
    }

    // ========================================================================
    // Timing
    // ========================================================================

    fn register_millis<I: Interpreter, B: Board + 'static>(runtime: &Runtime<I>, board: &Arc<Mutex<B>>) -> Result<()> {
        let board = Arc::clone(board);
        runtime.register(
            "native_millis",
            NativeSignature::new(&[], Some(NativeType::U32)),
            move |_call| Ok(Some(Value::from_u32(lock(&board).millis()))),
        )
    }

    fn register_delay<I: Interpreter, B: Board + 'static>(runtime: &Runtime<I>, board: &Arc<Mutex<B>>) -> Result<()> {
        let board = Arc::clone(board);
        runtime.register(
            "native_delay",
            NativeSignature::new(&[NativeType::U32], None),
            move |call| {
                let ms = call.arg_u32(0)?;
                if ms > MAX_DELAY_MS {
                    return Err(HostError::InvalidArgument(format!(
                        "delay of {} ms exceeds the {} ms cap",
                        ms, MAX_DELAY_MS
                    )));
                }
                lock(&board).delay(ms);
                Ok(None)
            },
        )
    }

    // ========================================================================
    // Console
    // ========================================================================

    fn register_print_string<I: Interpreter, B: Board + 'static>(
        runtime: &Runtime<I>,
        board: &Arc<Mutex<B>>,
    ) -> Result<()> {
        let board = Arc::clone(board);
        runtime.register(
            "native_print_string",
            NativeSignature::new(&[NativeType::Ptr], None),
            move |call| {
                let ptr = call.arg_ptr(0)?;
                let text = call.memory()?.read_cstr(ptr, MAX_PRINT_LEN)?;
                lock(&board).print(text);
                Ok(None)
            },
        )
    }

    fn register_print_int<I: Interpreter, B: Board + 'static>(
        runtime: &Runtime<I>,
        board: &Arc<Mutex<B>>,
    ) -> Result<()> {
        let board = Arc::clone(board);
        runtime.register(
            "native_print_int",
            NativeSignature::new(&[NativeType::I32], None),
            move |call| {
                let value = call.arg_i32(0)?;
                lock(&board).print(&value.to_string());
                Ok(None)
            },
        )
    }
}

fn lock<B>(board: &Mutex<B>) -> MutexGuard<'_, B> {
    board.lock().unwrap_or_else(PoisonError::into_inner)
}

fn checked_pin<B: Board + ?Sized>(board: &B, raw: i32) -> std::result::Result<u32, HostError> {
    u32::try_from(raw)
        .ok()
        .filter(|pin| *pin < board.pin_count())
        .ok_or_else(|| {
            HostError::InvalidArgument(format!("pin {} out of range 0..{}", raw, board.pin_count()))
        })
}

#[derive(Debug, Clone, Copy)]
struct PinState {
    mode: PinMode,
    high: bool,
}

/// Deterministic in-memory board.
///
/// Time only moves when a guest calls `native_delay` (or the host calls
/// [`SimulatedBoard::advance`]). Pins keep their last driven level across
/// mode changes; switching to [`PinMode::InputPullup`] pulls an undriven
/// pin high.
#[derive(Debug, Clone)]
pub struct SimulatedBoard {
    pin_count: u32,
    pins: BTreeMap<u32, PinState>,
    analog: BTreeMap<u32, u16>,
    clock_ms: u32,
    output: String,
}

impl Default for SimulatedBoard {
    fn default() -> Self {
        Self::new(40)
    }
}

impl SimulatedBoard {
    /// Create a board with `pin_count` pins, all floating low.
    pub fn new(pin_count: u32) -> Self {
        Self {
            pin_count,
            pins: BTreeMap::new(),
            analog: BTreeMap::new(),
            clock_ms: 0,
            output: String::new(),
        }
    }

    /// Wrap for [`BoardHostFunctions::register`].
    pub fn shared(self) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(self))
    }

    /// Set the value future analog reads of `pin` return.
    pub fn set_analog(&mut self, pin: u32, value: u16) {
        self.analog.insert(pin, value.min(ANALOG_MAX));
    }

    /// Drive an input pin from outside (a button, a jumper).
    pub fn set_input(&mut self, pin: u32, high: bool) {
        self.pins
            .entry(pin)
            .or_insert(PinState {
                mode: PinMode::Input,
                high: false,
            })
            .high = high;
    }

    /// Move the clock forward.
    pub fn advance(&mut self, ms: u32) {
        self.clock_ms = self.clock_ms.wrapping_add(ms);
    }

    /// Configured mode of `pin`, if it was ever set.
    pub fn mode(&self, pin: u32) -> Option<PinMode> {
        self.pins.get(&pin).map(|p| p.mode)
    }

    /// Current level of `pin`.
    pub fn level(&self, pin: u32) -> bool {
        self.pins.get(&pin).is_some_and(|p| p.high)
    }

    /// Everything printed so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    /// Drain the captured output.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}

impl Board for SimulatedBoard {
    fn pin_count(&self) -> u32 {
        self.pin_count
    }

    fn pin_mode(&mut self, pin: u32, mode: PinMode) {
        let state = self.pins.entry(pin).or_insert(PinState { mode, high: false });
        state.mode = mode;
        if mode == PinMode::InputPullup {
            state.high = true;
        }
        tracing::trace!(pin, ?mode, "pin mode");
    }

    fn digital_write(&mut self, pin: u32, high: bool) {
        self.pins
            .entry(pin)
            .or_insert(PinState {
                mode: PinMode::Output,
                high,
            })
            .high = high;
        tracing::trace!(pin, high, "digital write");
    }

    fn digital_read(&mut self, pin: u32) -> bool {
        self.level(pin)
    }

    fn analog_read(&mut self, pin: u32) -> u16 {
        self.analog.get(&pin).copied().unwrap_or(0)
    }

    fn millis(&self) -> u32 {
        self.clock_ms
    }

    fn delay(&mut self, ms: u32) {
        self.advance(ms);
    }

    fn print(&mut self, text: &str) {
        tracing::debug!(text, "guest print");
        self.output.push_str(text);
    }
}
