//! Wide-integer operation tests (widths > 64).
//!
//! Boundary scenarios use literal values; the algebraic laws run under
//! proptest with `BigUint` arithmetic as the reference implementation.

use std::cell::RefCell;

use hdlsim_ir::build::*;
use hdlsim_ir::{BinaryOp, ModuleDef, UnaryOp, BLOCK_EVAL};
use hdlsim_runtime::{HdlSim, SimConfig};
use num_bigint::{BigInt, BigUint};
use proptest::prelude::*;

// ══════════════════════════════════════════════════════════════════════════════
// Helpers
// ══════════════════════════════════════════════════════════════════════════════

fn sim_of(module: &ModuleDef) -> HdlSim {
    let mut sim = HdlSim::new(module, None, &SimConfig::default())
        .unwrap_or_else(|e| panic!("codegen failed: {e}"));
    sim.init().expect("init failed");
    sim.powercycle().expect("powercycle failed");
    sim
}

fn mask(w: u32) -> BigUint {
    (BigUint::from(1u8) << w) - 1u8
}

fn big(hex: &str) -> BigUint {
    BigUint::parse_bytes(hex.as_bytes(), 16).unwrap()
}

/// One module computing every wide operation over inputs `a`, `b`, and a
/// runtime shift amount `s`.
fn wide_alu(w: u32) -> ModuleDef {
    let t = || logic(w);
    ModuleBuilder::new("wide_alu")
        .input("a", t())
        .input("b", t())
        .input("s", logic(8))
        .output("sum", t())
        .output("sumb", t())
        .output("diff", t())
        .output("and_o", t())
        .output("or_o", t())
        .output("xor_o", t())
        .output("not_o", t())
        .output("neg_o", t())
        .output("shl_o", t())
        .output("shr_o", t())
        .output("lt_o", logic(1))
        .output("eq_o", logic(1))
        .block(
            BLOCK_EVAL,
            vec![
                assign(vref("sum"), binop(BinaryOp::Add, t(), vref("a"), vref("b"))),
                assign(vref("sumb"), binop(BinaryOp::Sub, t(), vref("sum"), vref("b"))),
                assign(vref("diff"), binop(BinaryOp::Sub, t(), vref("a"), vref("b"))),
                assign(vref("and_o"), binop(BinaryOp::And, t(), vref("a"), vref("b"))),
                assign(vref("or_o"), binop(BinaryOp::Or, t(), vref("a"), vref("b"))),
                assign(vref("xor_o"), binop(BinaryOp::Xor, t(), vref("a"), vref("b"))),
                assign(vref("not_o"), unop(UnaryOp::Not, t(), vref("a"))),
                assign(vref("neg_o"), unop(UnaryOp::Negate, t(), vref("a"))),
                assign(vref("shl_o"), binop(BinaryOp::Shl, t(), vref("a"), vref("s"))),
                assign(
                    vref("shr_o"),
                    binop(BinaryOp::ShrU, t(), vref("shl_o"), vref("s")),
                ),
                assign(vref("lt_o"), binop(BinaryOp::Lt, logic(1), vref("a"), vref("b"))),
                assign(vref("eq_o"), binop(BinaryOp::Eq, logic(1), vref("a"), vref("b"))),
            ],
        )
        .build()
}

fn get_big(sim: &HdlSim, name: &str) -> BigUint {
    sim.get(name).unwrap().to_big()
}

// ══════════════════════════════════════════════════════════════════════════════
// Boundary scenarios
// ══════════════════════════════════════════════════════════════════════════════

/// 96-bit add with a carry crossing the 64-bit chunk boundary.
#[test]
fn wide_add_carries_across_chunks() {
    let mut sim = sim_of(&wide_alu(96));
    sim.set("a", big("FFFFFFFFFFFFFFFF")).unwrap();
    sim.set("b", BigUint::from(1u8)).unwrap();
    sim.set("s", 0u32).unwrap();
    sim.eval().unwrap();
    assert_eq!(get_big(&sim, "sum"), big("10000000000000000"));
}

/// 128-bit shifts across chunk boundaries by multiples of 32.
#[test]
fn wide_shift_across_boundary() {
    let m = ModuleBuilder::new("shifter")
        .input("a", logic(128))
        .output("y64", logic(128))
        .output("y96", logic(128))
        .output("z32", logic(128))
        .block(
            BLOCK_EVAL,
            vec![
                assign(
                    vref("y64"),
                    binop(BinaryOp::Shl, logic(128), vref("a"), con(logic(32), 64)),
                ),
                assign(
                    vref("y96"),
                    binop(BinaryOp::Shl, logic(128), vref("a"), con(logic(32), 96)),
                ),
                assign(
                    vref("z32"),
                    binop(BinaryOp::ShrU, logic(128), vref("a"), con(logic(32), 32)),
                ),
            ],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.set("a", big("123456789ABCDEF0")).unwrap();
    sim.eval().unwrap();
    assert_eq!(get_big(&sim, "y64"), big("123456789ABCDEF00000000000000000"));
    // The top 32 bits fall off the 128-bit width.
    assert_eq!(get_big(&sim, "y96"), big("9ABCDEF0000000000000000000000000"));
    assert_eq!(get_big(&sim, "z32"), big("12345678"));
}

/// Unaligned shift amounts move bits between chunks.
#[test]
fn wide_shift_unaligned_amount() {
    let mut sim = sim_of(&wide_alu(96));
    sim.set("a", BigUint::from(1u8)).unwrap();
    sim.set("b", BigUint::from(0u8)).unwrap();
    sim.set("s", 33u32).unwrap();
    sim.eval().unwrap();
    assert_eq!(get_big(&sim, "shl_o"), BigUint::from(1u8) << 33);
    assert_eq!(get_big(&sim, "shr_o"), BigUint::from(1u8));
}

/// Signed wide compare: a 96-bit value with the top bit set is negative and
/// compares less than any non-negative value.
#[test]
fn wide_signed_compare() {
    let m = ModuleBuilder::new("scmp")
        .input("a", logic_s(96))
        .input("b", logic_s(96))
        .output("lt", logic(1))
        .output("gt", logic(1))
        .block(
            BLOCK_EVAL,
            vec![
                assign(
                    vref("lt"),
                    binop(BinaryOp::LtS, logic(1), vref("a"), vref("b")),
                ),
                assign(
                    vref("gt"),
                    binop(BinaryOp::GtS, logic(1), vref("a"), vref("b")),
                ),
            ],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.set("a", BigUint::from(1u8) << 95).unwrap();
    sim.set("b", BigUint::from(1u8)).unwrap();
    sim.eval().unwrap();
    assert_eq!(sim.get("lt").unwrap().as_u64(), 1);
    assert_eq!(sim.get("gt").unwrap().as_u64(), 0);
}

/// The 32-bit-container sign-bit trap: a 16-bit `0xF000` sign-extended to a
/// 28-bit signed value is -4096 and must not compare greater than 0x4000.
#[test]
fn narrow_signed_compare_uses_declared_width() {
    let m = ModuleBuilder::new("ncmp")
        .input("x", logic(16))
        .output("r", logic(1))
        .block(
            BLOCK_EVAL,
            vec![assign(
                vref("r"),
                binop(
                    BinaryOp::GtS,
                    logic(1),
                    unop(UnaryOp::Extends, logic_s(28), vref("x")),
                    con(logic_s(28), 0x4000),
                ),
            )],
        )
        .build();
    let mut sim = sim_of(&m);
    sim.set("x", 0xF000u32).unwrap();
    sim.eval().unwrap();
    assert_eq!(sim.get("r").unwrap().as_u64(), 0, "-4096 > 0x4000 must be false");
}

/// Wide conditional assignment copies whole chunk arrays per branch.
#[test]
fn wide_cond_selects_branch() {
    let m = ModuleBuilder::new("mux")
        .input("sel", logic(1))
        .input("a", logic(96))
        .input("b", logic(96))
        .output("y", logic(96))
        .block(
            BLOCK_EVAL,
            vec![assign(
                vref("y"),
                condop(logic(96), vref("sel"), vref("a"), vref("b")),
            )],
        )
        .build();
    let mut sim = sim_of(&m);
    let (a, b) = (big("AAAAAAAAAAAAAAAAAAAAAAAA"), big("BBBBBBBBBBBBBBBBBBBBBBBB"));
    sim.set("a", a.clone()).unwrap();
    sim.set("b", b.clone()).unwrap();
    sim.set("sel", 1u32).unwrap();
    sim.eval().unwrap();
    assert_eq!(get_big(&sim, "y"), a);
    sim.set("sel", 0u32).unwrap();
    sim.eval().unwrap();
    assert_eq!(get_big(&sim, "y"), b);
}

// ══════════════════════════════════════════════════════════════════════════════
// Algebraic laws (proptest, BigUint reference)
// ══════════════════════════════════════════════════════════════════════════════

fn wide_value(w: u32) -> impl Strategy<Value = BigUint> {
    let chunks = w.div_ceil(32) as usize;
    prop_oneof![
        Just(BigUint::from(0u8)),
        Just(BigUint::from(1u8)),
        Just(mask(w)),
        Just(BigUint::from(1u8) << (w - 1)),
        Just((BigUint::from(1u8) << 64) - 1u8),
        Just(BigUint::from(1u8) << 64),
        proptest::collection::vec(any::<u32>(), chunks)
            .prop_map(move |v| BigUint::new(v) & mask(w)),
    ]
}

fn shift_amount(w: u32) -> impl Strategy<Value = u32> {
    prop_oneof![
        Just(0u32),
        Just(1u32),
        Just(31u32),
        Just(32u32),
        Just(33u32),
        Just(w - 1),
        Just(w),
        0..=w,
    ]
}

fn check_alu_laws(w: u32) {
    let sim = RefCell::new(sim_of(&wide_alu(w)));
    let m = mask(w);
    proptest!(
        ProptestConfig::with_cases(24),
        |(a in wide_value(w), b in wide_value(w), s in shift_amount(w))| {
            let mut sim = sim.borrow_mut();
            sim.set("a", a.clone()).unwrap();
            sim.set("b", b.clone()).unwrap();
            sim.set("s", s).unwrap();
            sim.eval().unwrap();

            let modulus = BigUint::from(1u8) << w;
            prop_assert_eq!(get_big(&sim, "sum"), (&a + &b) & &m);
            // (a + b) - b == a
            prop_assert_eq!(get_big(&sim, "sumb"), a.clone());
            prop_assert_eq!(get_big(&sim, "diff"), (&a + &modulus - &b) & &m);
            prop_assert_eq!(get_big(&sim, "and_o"), &a & &b);
            prop_assert_eq!(get_big(&sim, "or_o"), &a | &b);
            prop_assert_eq!(get_big(&sim, "xor_o"), &a ^ &b);
            prop_assert_eq!(get_big(&sim, "not_o"), &a ^ &m);
            prop_assert_eq!(get_big(&sim, "neg_o"), (&modulus - (&a & &m)) & &m);
            prop_assert_eq!(get_big(&sim, "shl_o"), (&a << s) & &m);
            // (a << s) >> s == a & mask(w - s)
            prop_assert_eq!(get_big(&sim, "shr_o"), &a & mask(w - s));
            prop_assert_eq!(sim.get("lt_o").unwrap().as_u64(), u64::from(a < b));
            prop_assert_eq!(sim.get("eq_o").unwrap().as_u64(), u64::from(a == b));

            // Idempotence with both operands equal.
            sim.set("b", a.clone()).unwrap();
            sim.eval().unwrap();
            prop_assert_eq!(get_big(&sim, "and_o"), a.clone());
            prop_assert_eq!(get_big(&sim, "or_o"), a.clone());
            prop_assert_eq!(get_big(&sim, "xor_o"), BigUint::from(0u8));
            prop_assert_eq!(sim.get("eq_o").unwrap().as_u64(), 1);
        }
    );
}

#[test]
fn alu_laws_65_bits() {
    check_alu_laws(65);
}

#[test]
fn alu_laws_96_bits() {
    check_alu_laws(96);
}

#[test]
fn alu_laws_100_bits() {
    check_alu_laws(100);
}

#[test]
fn alu_laws_128_bits() {
    check_alu_laws(128);
}

/// Signed comparison against the two's-complement reference, at
/// chunk-aligned widths where the top chunk carries the sign bit.
fn check_signed_compare(w: u32) {
    let m = ModuleBuilder::new("scmp")
        .input("a", logic_s(w))
        .input("b", logic_s(w))
        .output("lt", logic(1))
        .block(
            BLOCK_EVAL,
            vec![assign(
                vref("lt"),
                binop(BinaryOp::LtS, logic(1), vref("a"), vref("b")),
            )],
        )
        .build();
    let sim = RefCell::new(sim_of(&m));
    proptest!(
        ProptestConfig::with_cases(24),
        |(a in wide_value(w), b in wide_value(w))| {
            let mut sim = sim.borrow_mut();
            sim.set("a", a.clone()).unwrap();
            sim.set("b", b.clone()).unwrap();
            sim.eval().unwrap();
            let signed = |x: &BigUint| -> BigInt {
                if x.bit((w - 1) as u64) {
                    BigInt::from(x.clone()) - (BigInt::from(1) << w)
                } else {
                    BigInt::from(x.clone())
                }
            };
            prop_assert_eq!(
                sim.get("lt").unwrap().as_u64(),
                u64::from(signed(&a) < signed(&b))
            );
        }
    );
}

#[test]
fn signed_compare_96_bits() {
    check_signed_compare(96);
}

#[test]
fn signed_compare_128_bits() {
    check_signed_compare(128);
}
