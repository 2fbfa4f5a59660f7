//! Integration tests for the simulation driver.
//!
//! Covers the host lifecycle (powercycle, eval, tick, tick2, reset), the
//! state proxy, trace ring reads, `$readmem`, and the persistence
//! invariants.

use hdlsim_ir::build::*;
use hdlsim_ir::{
    BinaryOp, Expr, ExprKind, ModuleDef, UnaryOp, BLOCK_CHANGE_REQUEST, BLOCK_EVAL,
    BLOCK_EVAL_INITIAL, BLOCK_EVAL_SETTLE,
};
use hdlsim_runtime::{HdlSim, RuntimeError, SignalValue, SimConfig};
use num_bigint::BigUint;

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn sim_of(module: &ModuleDef) -> HdlSim {
    let mut sim = HdlSim::new(module, None, &SimConfig::default())
        .unwrap_or_else(|e| panic!("codegen failed: {e}"));
    sim.init().expect("init failed");
    sim
}

fn changedet(current: &str, shadow: &str) -> Expr {
    Expr::new(
        ExprKind::Binop {
            binop: BinaryOp::ChangeDet,
            left: Box::new(vref(current)),
            right: Box::new(vref(shadow)),
        },
        None,
    )
}

/// A `width`-bit counter incremented on each positive `clk` edge.
fn counter(width: u32) -> ModuleDef {
    ModuleBuilder::new("counter")
        .input("clk", logic(1))
        .output("q", logic(width))
        .signal("clk_last", logic(1))
        .block(
            BLOCK_EVAL,
            vec![
                ifop(
                    binop(
                        BinaryOp::And,
                        logic(1),
                        vref("clk"),
                        unop(UnaryOp::Not, logic(1), vref("clk_last")),
                    ),
                    assign(
                        vref("q"),
                        binop(BinaryOp::Add, logic(width), vref("q"), con(logic(width), 1)),
                    ),
                    None,
                ),
                assign(vref("clk_last"), vref("clk")),
            ],
        )
        .build()
}

fn big(hex: &str) -> BigUint {
    BigUint::parse_bytes(hex.as_bytes(), 16).unwrap()
}

// ══════════════════════════════════════════════════════════════════════════════
// Combinational evaluation & proxy
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn combinational_add() {
    let m = ModuleBuilder::new("adder")
        .input("a", logic(8))
        .output("y", logic(8))
        .block(
            BLOCK_EVAL,
            vec![assign(
                vref("y"),
                binop(BinaryOp::Add, logic(8), vref("a"), con(logic(8), 1)),
            )],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    sim.set("a", 41u32).unwrap();
    sim.eval().unwrap();
    assert_eq!(sim.get("y").unwrap().as_u64(), 42);
    // Wrap-around at the declared width.
    sim.set("a", 255u32).unwrap();
    sim.eval().unwrap();
    assert_eq!(sim.get("y").unwrap().as_u64(), 0);
}

#[test]
fn narrow_write_reads_back_masked() {
    let m = ModuleBuilder::new("t").signal("x", logic(5)).build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    sim.set("x", 0xFFu32).unwrap();
    assert_eq!(sim.get("x").unwrap(), SignalValue::U8(0x1F));
}

#[test]
fn wide_proxy_round_trip() {
    let m = ModuleBuilder::new("t").signal("w", logic(100)).build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    let v = big("89abcdef0123456789abcdef0");
    sim.set("w", v.clone()).unwrap();
    assert_eq!(sim.get("w").unwrap(), SignalValue::Big(v));
}

#[test]
fn unknown_signal_errors() {
    let m = ModuleBuilder::new("t").signal("x", logic(8)).build();
    let sim = sim_of(&m);
    assert!(matches!(
        sim.get("nope"),
        Err(RuntimeError::UnknownSignal(_))
    ));
}

// ══════════════════════════════════════════════════════════════════════════════
// Clocked stepping
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn tick_steps_half_cycles() {
    let mut sim = sim_of(&counter(8));
    sim.powercycle().unwrap();
    assert_eq!(sim.get("q").unwrap().as_u64(), 0);
    sim.tick().unwrap(); // rising edge
    sim.tick().unwrap(); // falling edge
    assert_eq!(sim.get("q").unwrap().as_u64(), 1);
}

#[test]
fn tick2_runs_full_cycles() {
    let mut sim = sim_of(&counter(8));
    sim.powercycle().unwrap();
    sim.tick2(10).unwrap();
    assert_eq!(sim.get("q").unwrap().as_u64(), 10);
}

/// 65-bit counter overflow: seed just below 2^64 and cross the chunk
/// boundary one edge at a time.
#[test]
fn wide_counter_crosses_u64_boundary() {
    let mut sim = sim_of(&counter(65));
    sim.powercycle().unwrap();
    sim.set("q", (BigUint::from(1u8) << 64) - 1u8).unwrap();
    sim.tick2(1).unwrap();
    assert_eq!(
        sim.get("q").unwrap().to_big(),
        BigUint::from(1u8) << 64
    );
    sim.tick2(1).unwrap();
    assert_eq!(
        sim.get("q").unwrap().to_big(),
        (BigUint::from(1u8) << 64) + 1u8
    );
}

#[test]
fn wide_counter_wraps_at_width() {
    let mut sim = sim_of(&counter(65));
    sim.powercycle().unwrap();
    sim.set("q", (BigUint::from(1u8) << 65) - 1u8).unwrap();
    sim.tick2(1).unwrap();
    assert_eq!(sim.get("q").unwrap().to_big(), BigUint::from(0u8));
}

// ══════════════════════════════════════════════════════════════════════════════
// Settle
// ══════════════════════════════════════════════════════════════════════════════

/// A module with the combinational feedback `out = out` must powercycle
/// without raising: the first settle pass leaves the value unchanged.
#[test]
fn settle_converges_on_self_assignment() {
    let m = ModuleBuilder::new("feedback")
        .output("out", logic(8))
        .signal("out_shadow", logic(8))
        .block(BLOCK_EVAL_SETTLE, vec![assign(vref("out"), vref("out"))])
        .block(BLOCK_EVAL, vec![assign(vref("out"), vref("out"))])
        .block(BLOCK_CHANGE_REQUEST, vec![changedet("out", "out_shadow")])
        .build();
    let mut sim = sim_of(&m);
    sim.powercycle().expect("self-assignment must settle");
}

#[test]
fn idempotent_eval_state_bytes() {
    let m = ModuleBuilder::new("adder")
        .input("a", logic(16))
        .output("y", logic(16))
        .block(
            BLOCK_EVAL,
            vec![assign(
                vref("y"),
                binop(BinaryOp::Xor, logic(16), vref("a"), con(logic(16), 0xA5A5)),
            )],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    sim.set("a", 0x1234u32).unwrap();
    sim.eval().unwrap();
    let first = sim.save_state().unwrap();
    sim.eval().unwrap();
    let second = sim.save_state().unwrap();
    assert_eq!(first, second, "eval must be idempotent without input change");
}

// ══════════════════════════════════════════════════════════════════════════════
// State persistence
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn save_restore_round_trip() {
    let mut sim = sim_of(&counter(32));
    sim.powercycle().unwrap();
    sim.tick2(5).unwrap();
    let snapshot = sim.save_state().unwrap();
    let q_at_snapshot = sim.get("q").unwrap().as_u64();

    sim.tick2(7).unwrap();
    assert_ne!(sim.get("q").unwrap().as_u64(), q_at_snapshot);

    sim.load_state(&snapshot).unwrap();
    assert_eq!(sim.get("q").unwrap().as_u64(), q_at_snapshot);
    assert_eq!(sim.save_state().unwrap(), snapshot);
}

#[test]
fn load_state_rejects_wrong_length() {
    let mut sim = sim_of(&counter(8));
    sim.powercycle().unwrap();
    let mut snapshot = sim.save_state().unwrap();
    snapshot.push(0);
    assert!(matches!(
        sim.load_state(&snapshot),
        Err(RuntimeError::StateSizeMismatch { .. })
    ));
}

// ══════════════════════════════════════════════════════════════════════════════
// Initial values & constants
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn array_initial_values_applied() {
    let m = ModuleBuilder::new("t")
        .init_signal("rom", array(logic(16), 4), vec![(0, 0xAAAA), (2, 0x1234)])
        .build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    let bytes = sim.signal_bytes("rom").unwrap();
    assert_eq!(&bytes[0..2], &0xAAAAu16.to_le_bytes());
    assert_eq!(&bytes[2..4], &[0, 0]);
    assert_eq!(&bytes[4..6], &0x1234u16.to_le_bytes());
}

#[test]
fn constants_present_after_powercycle() {
    let m = ModuleBuilder::new("t")
        .signal("s", logic(8))
        .constant("K", logic(32), 0xDEAD_BEEF)
        .big_constant("W", logic(96), big("abcdef0123456789abcdef01"))
        .build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    assert_eq!(sim.get("K").unwrap().as_u64(), 0xDEAD_BEEF);
    assert_eq!(
        sim.get("W").unwrap().to_big(),
        big("abcdef0123456789abcdef01")
    );
}

// ══════════════════════════════════════════════════════════════════════════════
// Builtins
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn finish_sets_flag_and_simulation_continues() {
    let m = ModuleBuilder::new("t")
        .output("y", logic(8))
        .block(BLOCK_EVAL_INITIAL, vec![call("$finish", vec![], 42)])
        .block(
            BLOCK_EVAL,
            vec![assign(vref("y"), con(logic(8), 7))],
        )
        .build();
    let mut sim = sim_of(&m);
    assert!(!sim.is_finished());
    sim.powercycle().unwrap();
    assert!(sim.is_finished());
    assert!(!sim.is_stopped());
    sim.eval().unwrap();
    assert_eq!(sim.get("y").unwrap().as_u64(), 7);
}

#[test]
fn readmem_loads_hex_lines() {
    let m = ModuleBuilder::new("t")
        .signal("mem", array(logic(32), 4))
        .block(
            BLOCK_EVAL_INITIAL,
            vec![call(
                "$readmemh",
                vec![strcon("rom.hex"), vref("mem")],
                0,
            )],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.set_file_provider(|path| {
        (path == "rom.hex").then(|| "DEADBEEF\n// comment\n123\n\nFF\n".to_string())
    });
    sim.powercycle().unwrap();
    let bytes = sim.signal_bytes("mem").unwrap();
    assert_eq!(&bytes[0..4], &0xDEAD_BEEFu32.to_le_bytes());
    assert_eq!(&bytes[4..8], &0x123u32.to_le_bytes());
    assert_eq!(&bytes[8..12], &0xFFu32.to_le_bytes());
    assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
}

#[test]
fn readmem_missing_file_raises_and_leaves_memory() {
    let m = ModuleBuilder::new("t")
        .signal("mem", array(logic(32), 4))
        .block(
            BLOCK_EVAL_INITIAL,
            vec![call("$readmemh", vec![strcon("/nope"), vref("mem")], 0)],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.set_file_provider(|_| None);
    match sim.powercycle() {
        Err(RuntimeError::MissingFile(path)) => assert_eq!(path, "/nope"),
        other => panic!("expected MissingFile, got {other:?}"),
    }
    assert!(sim.signal_bytes("mem").unwrap().iter().all(|&b| b == 0));
}

#[test]
fn readmem_overflow_rejected() {
    let m = ModuleBuilder::new("t")
        .signal("mem", array(logic(32), 2))
        .block(
            BLOCK_EVAL_INITIAL,
            vec![call("$readmemh", vec![strcon("big.hex"), vref("mem")], 0)],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.set_file_provider(|_| Some("1\n2\n3\n".to_string()));
    assert!(matches!(
        sim.powercycle(),
        Err(RuntimeError::ReadmemOverflow { .. })
    ));
}

#[test]
fn rand_is_reproducible_per_seed() {
    let m = ModuleBuilder::new("t")
        .output("r", logic(32))
        .block(
            BLOCK_EVAL,
            vec![assign(vref("r"), call_value("$rand", logic(32)))],
        )
        .build();
    let mut a = sim_of(&m);
    let mut b = sim_of(&m);
    a.powercycle().unwrap();
    b.powercycle().unwrap();
    a.seed_rand(7).unwrap();
    b.seed_rand(7).unwrap();
    a.eval().unwrap();
    b.eval().unwrap();
    assert_eq!(a.get("r").unwrap().as_u64(), b.get("r").unwrap().as_u64());
}

/// `$rand` as a value expression.
fn call_value(name: &str, dtype: hdlsim_ir::DataType) -> Expr {
    Expr::new(
        ExprKind::FuncCall {
            name: name.to_string(),
            args: vec![],
            line: 0,
        },
        Some(dtype),
    )
}

#[test]
fn time_counts_from_powercycle() {
    let m = ModuleBuilder::new("t")
        .output("t", logic(64))
        .block(
            BLOCK_EVAL,
            vec![assign(vref("t"), call_value("$time", logic(64)))],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    sim.eval().unwrap();
    // Milliseconds since powercycle; just ran, so it is small.
    assert!(sim.get("t").unwrap().as_u64() < 10_000);
}

// ══════════════════════════════════════════════════════════════════════════════
// Element selection
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn array_element_store_and_load() {
    let m = ModuleBuilder::new("t")
        .input("x", logic(16))
        .input("i", logic(8))
        .output("y", logic(16))
        .signal("arr", array(logic(16), 8))
        .block(
            BLOCK_EVAL,
            vec![
                assign(
                    arraysel(logic(16), vref("arr"), vref("i")),
                    vref("x"),
                ),
                assign(vref("y"), arraysel(logic(16), vref("arr"), vref("i"))),
            ],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    sim.set("x", 0xBEEFu32).unwrap();
    sim.set("i", 5u32).unwrap();
    sim.eval().unwrap();
    assert_eq!(sim.get("y").unwrap().as_u64(), 0xBEEF);
    let bytes = sim.signal_bytes("arr").unwrap();
    assert_eq!(&bytes[10..12], &0xBEEFu16.to_le_bytes());
}

/// `wordsel` reads and writes 32-bit chunks of a wide parent.
#[test]
fn wordsel_addresses_chunks() {
    let m = ModuleBuilder::new("t")
        .input("x", logic(32))
        .output("y", logic(32))
        .signal("w", logic(96))
        .block(
            BLOCK_EVAL,
            vec![
                assign(
                    binop(BinaryOp::WordSel, logic(32), vref("w"), con(logic(8), 1)),
                    vref("x"),
                ),
                assign(
                    vref("y"),
                    binop(BinaryOp::WordSel, logic(32), vref("w"), con(logic(8), 1)),
                ),
            ],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    sim.set("x", 0x12345678u32).unwrap();
    sim.eval().unwrap();
    assert_eq!(sim.get("y").unwrap().as_u64(), 0x12345678);
    assert_eq!(
        sim.get("w").unwrap().to_big(),
        BigUint::from(0x12345678u64) << 32
    );
}

// ══════════════════════════════════════════════════════════════════════════════
// Trace ring
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn trace_ring_records_each_cycle() {
    let mut sim = sim_of(&counter(8));
    sim.powercycle().unwrap();
    assert_eq!(sim.trace_record_size() % 8, 0);
    sim.tick2(3).unwrap();

    sim.reset_trace();
    assert_eq!(sim.trace_get("q").unwrap().as_u64(), 1);
    sim.next_trace();
    assert_eq!(sim.trace_get("q").unwrap().as_u64(), 2);
    sim.next_trace();
    assert_eq!(sim.trace_get("q").unwrap().as_u64(), 3);
}

#[test]
fn trace_rejects_non_outputs() {
    let mut sim = sim_of(&counter(8));
    sim.powercycle().unwrap();
    sim.tick2(1).unwrap();
    assert!(matches!(
        sim.trace_get("clk_last"),
        Err(RuntimeError::UnknownSignal(_))
    ));
}

// ══════════════════════════════════════════════════════════════════════════════
// Reset convenience
// ══════════════════════════════════════════════════════════════════════════════

#[test]
fn reset_preserves_ui_in_and_pulses_rst_n() {
    let m = ModuleBuilder::new("tt")
        .input("clk", logic(1))
        .input("rst_n", logic(1))
        .input("ui_in", logic(8))
        .output("q", logic(8))
        .signal("clk_last", logic(1))
        .block(
            BLOCK_EVAL,
            vec![
                ifop(
                    binop(
                        BinaryOp::And,
                        logic(1),
                        vref("clk"),
                        unop(UnaryOp::Not, logic(1), vref("clk_last")),
                    ),
                    ifop(
                        vref("rst_n"),
                        assign(
                            vref("q"),
                            binop(BinaryOp::Add, logic(8), vref("q"), vref("ui_in")),
                        ),
                        Some(assign(vref("q"), con(logic(8), 0))),
                    ),
                    None,
                ),
                assign(vref("clk_last"), vref("clk")),
            ],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.powercycle().unwrap();
    sim.set("ui_in", 3u32).unwrap();
    sim.reset().unwrap();
    // ui_in survived the powercycle inside reset().
    assert_eq!(sim.get("ui_in").unwrap().as_u64(), 3);
    assert_eq!(sim.get("rst_n").unwrap().as_u64(), 1);
    // Held in reset for the pulse, so the counter is still clear.
    assert_eq!(sim.get("q").unwrap().as_u64(), 0);
    sim.tick2(4).unwrap();
    assert_eq!(sim.get("q").unwrap().as_u64(), 12);
}

// ══════════════════════════════════════════════════════════════════════════════
// Loop bound
// ══════════════════════════════════════════════════════════════════════════════

/// An infinite `while` in generated code exits silently after the
/// configured iteration cap instead of locking the caller.
#[test]
fn runaway_loop_exits_after_cap() {
    let m = ModuleBuilder::new("t")
        .output("n", logic(32))
        .block(
            BLOCK_EVAL,
            vec![whileop(
                None,
                con(logic(1), 1),
                assign(
                    vref("n"),
                    binop(BinaryOp::Add, logic(32), vref("n"), con(logic(32), 1)),
                ),
                None,
            )],
        )
        .build();
    let config = SimConfig {
        loop_limit: 50,
        ..SimConfig::default()
    };
    let mut sim = HdlSim::new(&m, None, &config).unwrap();
    sim.init().unwrap();
    sim.powercycle().unwrap();
    let n = sim.get("n").unwrap().as_u64();
    assert!(n > 0 && n <= 51, "loop ran {n} iterations");
}
