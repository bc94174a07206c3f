//! Board host function tests: guest GPIO, timing and console demos driving
//! a simulated board.

#![cfg(feature = "board")]

use std::sync::{Arc, Mutex};

use wasm_host_bridge::{
    Board, BoardHostFunctions, BridgeError, ModuleInstance, PinMode, Runtime, RuntimeConfig, SimulatedBoard, TrapKind,
};

const BOARD_WAT: &str = r#"
(module
  (import "env" "native_pin_mode" (func $pin_mode (param i32 i32)))
  (import "env" "native_digital_write" (func $digital_write (param i32 i32)))
  (import "env" "native_digital_read" (func $digital_read (param i32) (result i32)))
  (import "env" "native_analog_read" (func $analog_read (param i32) (result i32)))
  (import "env" "native_millis" (func $millis (result i32)))
  (import "env" "native_delay" (func $delay (param i32)))
  (import "env" "native_print_string" (func $print_string (param i32)))
  (import "env" "native_print_int" (func $print_int (param i32)))

  (memory (export "memory") 1)
  (data (i32.const 16) "add\00")
  (data (i32.const 32) ": result=\00")
  (data (i32.const 48) " time=\00")
  (data (i32.const 64) "us\n\00")

  (func (export "blink_led") (param $pin i32) (param $times i32) (param $delay_ms i32)
    (local $i i32)
    (call $pin_mode (local.get $pin) (i32.const 1))
    (block $done
      (loop $next
        (br_if $done (i32.ge_s (local.get $i) (local.get $times)))
        (call $digital_write (local.get $pin) (i32.const 1))
        (call $delay (local.get $delay_ms))
        (call $digital_write (local.get $pin) (i32.const 0))
        (call $delay (local.get $delay_ms))
        (local.set $i (i32.add (local.get $i) (i32.const 1)))
        (br $next))))

  (func (export "read_sensor_category") (param $pin i32) (result i32)
    (local $value i32)
    (local.set $value (call $analog_read (local.get $pin)))
    (if (result i32) (i32.lt_s (local.get $value) (i32.const 1024))
      (then (i32.const 0))
      (else
        (if (result i32) (i32.lt_s (local.get $value) (i32.const 2048))
          (then (i32.const 1))
          (else
            (if (result i32) (i32.lt_s (local.get $value) (i32.const 3072))
              (then (i32.const 2))
              (else (i32.const 3))))))))

  (func (export "measure_elapsed") (param $start i32) (result i32)
    (i32.sub (call $millis) (local.get $start)))

  (func (export "gpio_test_pattern") (param $pin i32) (result i32)
    (call $pin_mode (local.get $pin) (i32.const 1))
    (call $digital_write (local.get $pin) (i32.const 1))
    (call $delay (i32.const 10))
    (call $pin_mode (local.get $pin) (i32.const 0))
    (call $digital_read (local.get $pin)))

  (func (export "print_benchmark_result") (param $name i32) (param $result i32) (param $time_us i32)
    (call $print_string (local.get $name))
    (call $print_string (i32.const 32))
    (call $print_int (local.get $result))
    (call $print_string (i32.const 48))
    (call $print_int (local.get $time_us))
    (call $print_string (i32.const 64)))

  (func (export "complex_native_demo") (param $led i32) (param $sensor i32) (result i32)
    (local $start i32)
    (local.set $start (call $millis))
    (call $pin_mode (local.get $led) (i32.const 1))
    (call $digital_write (local.get $led) (i32.const 1))
    (call $delay (i32.const 100))
    (call $digital_write (local.get $led) (i32.const 0))
    (i32.add
      (i32.rem_s (call $analog_read (local.get $sensor)) (i32.const 1000))
      (i32.sub (call $millis) (local.get $start))))

  (func (export "bad_pin") (call $pin_mode (i32.const 99) (i32.const 1)))
  (func (export "bad_mode") (call $pin_mode (i32.const 2) (i32.const 7)))
  (func (export "long_delay") (call $delay (i32.const 120000)))
  (func (export "print_at") (param i32) (call $print_string (local.get 0)))
)
"#;

struct Fixture {
    runtime: Runtime,
    board: Arc<Mutex<SimulatedBoard>>,
    bytes: Vec<u8>,
}

impl Fixture {
    fn new() -> Self {
        let runtime = Runtime::initialize(RuntimeConfig::esp32()).expect("failed to initialize runtime");
        let board = SimulatedBoard::default().shared();
        BoardHostFunctions::register(&runtime, Arc::clone(&board)).expect("failed to register board imports");
        let bytes = wat::parse_str(BOARD_WAT).expect("fixture should assemble");
        Self { runtime, board, bytes }
    }

    fn instance(&self) -> ModuleInstance<'_> {
        ModuleInstance::load_with_defaults(&self.runtime, &self.bytes).expect("failed to load board module")
    }

    fn board(&self) -> std::sync::MutexGuard<'_, SimulatedBoard> {
        self.board.lock().unwrap()
    }
}

#[test]
fn test_registers_all_imports() {
    let fixture = Fixture::new();
    assert_eq!(fixture.runtime.import_count(), 8);

    let info = fixture.runtime.inspect(&fixture.bytes).unwrap();
    for import in &info.imports {
        assert!(fixture.runtime.check_import(import).is_ok(), "{} should resolve", import.name);
    }
}

#[test]
fn test_unregistered_board_fails_to_load() {
    let runtime = Runtime::initialize(RuntimeConfig::esp32()).unwrap();
    let bytes = wat::parse_str(BOARD_WAT).unwrap();
    let err = ModuleInstance::load_with_defaults(&runtime, &bytes).unwrap_err();
    assert!(matches!(err, BridgeError::UnresolvedImport { .. }));
}

#[test]
fn test_blink_led() {
    let fixture = Fixture::new();
    let mut instance = fixture.instance();

    let mut argv = [2, 3, 250];
    let stats = instance.call("blink_led", 3, &mut argv).unwrap();
    assert!(stats.result.is_none());

    let board = fixture.board();
    assert_eq!(board.mode(2), Some(PinMode::Output));
    assert!(!board.level(2));
    assert_eq!(board.millis(), 1500);
}

#[test]
fn test_read_sensor_category() {
    let fixture = Fixture::new();
    let mut instance = fixture.instance();

    for (reading, category) in [(500, 0), (1500, 1), (2500, 2), (4000, 3), (1024, 1)] {
        fixture.board().set_analog(34, reading);
        let mut argv = [34];
        instance.call("read_sensor_category", 1, &mut argv).unwrap();
        assert_eq!(argv[0], category, "reading {reading}");
    }
}

#[test]
fn test_measure_elapsed() {
    let fixture = Fixture::new();
    let mut instance = fixture.instance();

    fixture.board().advance(1000);
    let mut argv = [400];
    instance.call("measure_elapsed", 1, &mut argv).unwrap();
    assert_eq!(argv[0], 600);
}

#[test]
fn test_gpio_test_pattern() {
    let fixture = Fixture::new();
    let mut instance = fixture.instance();

    let mut argv = [5];
    instance.call("gpio_test_pattern", 1, &mut argv).unwrap();
    assert_eq!(argv[0], 1);

    let board = fixture.board();
    assert_eq!(board.mode(5), Some(PinMode::Input));
    assert_eq!(board.millis(), 10);
}

#[test]
fn test_print_benchmark_result() {
    let fixture = Fixture::new();
    let mut instance = fixture.instance();

    let mut argv = [16, 100, 42];
    instance.call("print_benchmark_result", 3, &mut argv).unwrap();
    assert_eq!(fixture.board().output(), "add: result=100 time=42us\n");
}

#[test]
fn test_complex_native_demo() {
    let fixture = Fixture::new();
    let mut instance = fixture.instance();

    fixture.board().set_analog(34, 2345);
    let mut argv = [2, 34];
    instance.call("complex_native_demo", 2, &mut argv).unwrap();
    assert_eq!(argv[0], 345 + 100);
}

#[test]
fn test_host_vetting() {
    let fixture = Fixture::new();
    let mut instance = fixture.instance();

    let cases = [
        ("bad_pin", "pin 99"),
        ("bad_mode", "unknown pin mode 7"),
        ("long_delay", "120000 ms"),
    ];
    for (function, needle) in cases {
        let mut argv = [0];
        let err = instance.call(function, 0, &mut argv).unwrap_err();
        let trap = err.trap().expect("host rejection should trap");
        assert_eq!(trap.kind, TrapKind::HostFunction);
        assert!(trap.detail.contains(needle), "{function}: {}", trap.detail);
    }

    // Nothing reached the board
    let board = fixture.board();
    assert_eq!(board.mode(2), None);
    assert_eq!(board.millis(), 0);
}

#[test]
fn test_print_rejects_bad_pointers() {
    let fixture = Fixture::new();
    let mut instance = fixture.instance();

    let mut argv = [65_536];
    let err = instance.call("print_at", 1, &mut argv).unwrap_err();
    assert_eq!(err.trap().map(|t| t.kind), Some(TrapKind::HostFunction));

    assert!(fixture.board().output().is_empty());
}
