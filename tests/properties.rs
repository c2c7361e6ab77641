//! Property tests for label resolution and literal placement.

use kiln::jit::backend::{Cond, Inst, LiteralKind, PatchKind, Reg};
use kiln::jit::{
    AArch64, Arm32, Backend, BufferLimits, CodeBuffer, HeapAllocator, Label, LabelChain, Literal,
    MacroAssembler,
};
use proptest::prelude::*;
use std::sync::Arc;

fn masm<B: Backend>(backend: B, max_pending: usize) -> MacroAssembler<B> {
    let limits = BufferLimits {
        max_growths: 8,
        max_code_size: 1024 * 1024,
    };
    let buffer = CodeBuffer::new(Arc::new(HeapAllocator::new(4 << 20)), 4096, limits).unwrap();
    MacroAssembler::new(backend, buffer, max_pending, 64)
}

fn word(code: &[u8], at: u32) -> u32 {
    let at = at as usize;
    u32::from_le_bytes([code[at], code[at + 1], code[at + 2], code[at + 3]])
}

const CONDS: [Cond; 6] = [Cond::Al, Cond::Eq, Cond::Ne, Cond::Lt, Cond::Ge, Cond::Hs];

#[derive(Debug, Clone)]
enum Step {
    Filler(u8),
    Branch(usize),
}

fn steps() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        prop_oneof![
            (0u8..16).prop_map(Step::Filler),
            (0usize..CONDS.len()).prop_map(Step::Branch),
        ],
        1..60,
    )
}

/// Emit `steps` against one label, bound before them when `backward`,
/// otherwise after. Returns the referrer offsets, the bound offset, and the
/// final code.
fn run_label<B: Backend>(backend: B, steps: &[Step], backward: bool) -> (Vec<u32>, u32, Vec<u8>) {
    let mut m = masm(backend, 8);
    let label = m.new_label();
    let mut referrers = Vec::new();

    if backward {
        m.emit(Inst::Nop).unwrap();
        m.bind(label);
    }
    for step in steps {
        match step {
            Step::Filler(n) => {
                for _ in 0..*n {
                    m.emit(Inst::Nop).unwrap();
                }
            }
            Step::Branch(c) => {
                referrers.push(m.offset());
                m.branch(CONDS[*c], label).unwrap();
            }
        }
    }

    let bound = if backward {
        m.labels().position(label).unwrap()
    } else {
        if let Label::Linked(head) = m.labels().get(label) {
            let chain: Vec<u32> = LabelChain::new(m.buffer(), m.backend(), head)
                .map(|(at, kind)| {
                    assert_eq!(kind, PatchKind::Branch);
                    at
                })
                .collect();
            let mut newest_first = referrers.clone();
            newest_first.reverse();
            assert_eq!(chain, newest_first);
        } else {
            assert!(referrers.is_empty());
        }
        let at = m.offset();
        m.bind(label);
        at
    };
    m.emit(Inst::Nop).unwrap();
    let out = m.finish().unwrap();
    (referrers, bound, out.code)
}

fn assert_label_sound<B: Backend>(backend: B, steps: &[Step], backward: bool) {
    let (referrers, bound, code) = run_label(backend.clone(), steps, backward);
    for at in referrers {
        let w = word(&code, at);
        assert_eq!(backend.classify(w), Some(PatchKind::Branch));
        assert_eq!(backend.target(PatchKind::Branch, w, at), bound, "referrer at {}", at);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_forward_label_soundness(steps in steps()) {
        assert_label_sound(Arm32, &steps, false);
        assert_label_sound(AArch64, &steps, false);
    }

    #[test]
    fn test_backward_label_soundness(steps in steps()) {
        assert_label_sound(Arm32, &steps, true);
        assert_label_sound(AArch64, &steps, true);
    }
}

#[derive(Debug, Clone)]
enum Use {
    Filler(u16),
    Int(usize),
    Float(usize),
    Exit,
}

const INTS: [i32; 4] = [0x1234_5678, -0x0765_4321, 0x7FFF_0001, 0x00AB_CDEF];
const FLOATS: [f32; 3] = [1.5, -0.25, 3.0e8];

fn uses() -> impl Strategy<Value = Vec<Use>> {
    prop::collection::vec(
        prop_oneof![
            3 => (0u16..300).prop_map(Use::Filler),
            // Runs that land a reuse next to the VLDR and LDR deadlines.
            1 => (248u16..256).prop_map(Use::Filler),
            1 => (1016u16..1024).prop_map(Use::Filler),
            3 => (0usize..INTS.len()).prop_map(Use::Int),
            2 => (0usize..FLOATS.len()).prop_map(Use::Float),
            1 => Just(Use::Exit),
        ],
        1..40,
    )
}

/// Check every literal load in `code` addresses pool data it can reach.
/// Returns the number of loads seen.
fn check_literal_loads<B: Backend>(backend: &B, code: &[u8], literal_offsets: &[u32]) -> usize {
    let mut seen = 0;
    for at in (0..code.len() as u32).step_by(4) {
        if literal_offsets.binary_search(&at).is_ok() {
            continue;
        }
        let w = word(code, at);
        let (patch, kind) = match backend.classify(w) {
            Some(PatchKind::Load) => (PatchKind::Load, LiteralKind::Word),
            Some(PatchKind::FpLoad) => (PatchKind::FpLoad, LiteralKind::Float),
            _ => continue,
        };
        seen += 1;
        let target = backend.target(patch, w, at);
        assert!(
            literal_offsets.binary_search(&target).is_ok(),
            "load at {} does not address pool data ({})",
            at,
            target
        );
        assert!(backend.can_reach(kind, at, target), "load at {} cannot reach {}", at, target);
    }
    seen
}

fn assert_literals_reachable<B: Backend>(backend: B, uses: &[Use], max_pending: usize) {
    let mut m = masm(backend.clone(), max_pending);
    let mut loads = 0;
    for u in uses {
        match u {
            Use::Filler(n) => {
                for _ in 0..*n {
                    m.emit(Inst::Nop).unwrap();
                }
            }
            Use::Int(i) => {
                m.load_literal(Reg(0), Literal::Int(INTS[*i])).unwrap();
                loads += 1;
            }
            Use::Float(i) => {
                m.load_literal(B::FTMP, Literal::Float(FLOATS[*i].to_bits())).unwrap();
                loads += 1;
            }
            Use::Exit => {
                m.ret().unwrap();
                m.flush_at_boundary().unwrap();
                let next = m.new_label();
                m.bind(next);
            }
        }
    }
    let out = m.finish().unwrap();
    assert_eq!(check_literal_loads(&backend, &out.code, &out.literal_offsets), loads);
}

/// Load `literal`, pad with filler up to `reuse_at`, and load it again.
fn assert_reuse_reachable<B: Backend>(backend: B, literal: Literal, reuse_at: u32) {
    let limits = BufferLimits {
        max_growths: 8,
        max_code_size: 4 * 1024 * 1024,
    };
    let buffer = CodeBuffer::new(Arc::new(HeapAllocator::new(16 << 20)), 64 * 1024, limits).unwrap();
    let mut m = MacroAssembler::new(backend.clone(), buffer, 8, 64);
    let rt = match literal {
        Literal::Float(_) => B::FTMP,
        _ => Reg(0),
    };
    m.load_literal(rt, literal).unwrap();
    while m.offset() < reuse_at {
        m.emit(Inst::Nop).unwrap();
    }
    m.load_literal(rt, literal).unwrap();
    m.ret().unwrap();
    let out = m.finish().unwrap();

    assert_eq!(check_literal_loads(&backend, &out.code, &out.literal_offsets), 2);
    for &at in &out.literal_offsets {
        if backend.literal_size(literal.kind()) == 8 && out.literal_offsets.contains(&(at - 4)) {
            continue;
        }
        assert_eq!(word(&out.code, at), literal.bits() as u32, "pool word at {}", at);
    }
}

#[test]
fn test_literal_reuse_at_reach_edge() {
    let int = Literal::Int(0x1234_5678);
    let float = Literal::Float(1.5f32.to_bits());
    let cases = [
        (int, 4096u32, false),
        (float, 1024, false),
        (int, 1 << 20, true),
        (float, 1 << 20, true),
    ];
    for (literal, reach, aarch64) in cases {
        for reuse_at in (reach - 16..=reach + 4).step_by(4) {
            if aarch64 {
                assert_reuse_reachable(AArch64, literal, reuse_at);
            } else {
                assert_reuse_reachable(Arm32, literal, reuse_at);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_literal_reachability_arm32(uses in uses(), cap in 1usize..12) {
        assert_literals_reachable(Arm32, &uses, cap);
    }

    #[test]
    fn test_literal_reachability_aarch64(uses in uses(), cap in 1usize..12) {
        assert_literals_reachable(AArch64, &uses, cap);
    }
}
