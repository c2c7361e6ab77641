use kiln::jit::{AArch64, Arm32, Backend, Budget, CompileStatus, JitCompiler, TaskQuota, Unlimited};
use kiln::vm::{Constant, Op, UnitBuilder};
use kiln::{JitConfig, Program, UnitId};
use serde::Serialize;
use std::time::Instant;

const ROUNDS: u32 = 200;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    backend: &'static str,
    code_bytes: usize,
    literal_flushes: u32,
    unsliced_secs: f64,
    sliced_secs: f64,
    suspensions_per_compile: u32,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    rounds: u32,
    results: Vec<BenchmarkResult>,
}

// Synthetic programs

fn single(builder: &UnitBuilder) -> Program {
    let mut program = Program::new();
    program.push(builder.build(program.next_id()).unwrap());
    program
}

fn sum_loop() -> Program {
    let mut b = UnitBuilder::new("sum_loop", 2);
    b.op(Op::IConst(1_000_000))
        .op(Op::Store(0))
        .op(Op::IConst(0))
        .op(Op::Store(1))
        .label("head")
        .op(Op::Load(0))
        .branch(Op::IfEq, "done")
        .ops(&[Op::Load(1), Op::Load(0), Op::Add, Op::Store(1)])
        .ops(&[Op::Load(0), Op::IConst(1), Op::Sub, Op::Store(0)])
        .branch(Op::Goto, "head")
        .label("done")
        .op(Op::Load(1))
        .op(Op::VReturn);
    single(&b)
}

fn straight_line(blocks: usize) -> Program {
    let mut b = UnitBuilder::new("straight_line", 4);
    for i in 0..blocks {
        b.ldc(Constant::Int(0x2000_0003 + i as i32 * 0x0003_0507))
            .ops(&[Op::Load(1), Op::Mul, Op::Store(1)])
            .ops(&[Op::Load(2), Op::Load(3), Op::Div, Op::Store(2)])
            .ops(&[Op::Load(0), Op::Load(1), Op::ALoad, Op::Store(3)]);
    }
    b.op(Op::Load(1)).op(Op::VReturn);
    single(&b)
}

fn inline_chain() -> Program {
    let mut program = Program::new();
    let mut outer = UnitBuilder::new("outer", 1);
    outer
        .ops(&[Op::Load(0), Op::Invoke { unit: 1, argc: 1 }])
        .ops(&[Op::Invoke { unit: 1, argc: 1 }, Op::VReturn]);
    let mut middle = UnitBuilder::new("middle", 1);
    middle.ops(&[Op::Load(0), Op::Invoke { unit: 2, argc: 1 }, Op::VReturn]);
    let mut leaf = UnitBuilder::new("leaf", 1);
    leaf.label("top")
        .op(Op::Load(0))
        .branch(Op::IfLt, "top")
        .ops(&[Op::Load(0), Op::FConst(0.5), Op::Add, Op::VReturn]);
    for builder in [outer, middle, leaf] {
        program.push(builder.build(program.next_id()).unwrap());
    }
    program
}

fn compile<B: Backend>(jit: &mut JitCompiler<B>, program: &Program, quota: Option<u32>) -> (usize, u32, u32) {
    let mut suspensions = 0;
    loop {
        let mut sliced;
        let mut unlimited = Unlimited;
        let budget: &mut dyn Budget = match quota {
            Some(steps) => {
                sliced = TaskQuota::new(steps);
                &mut sliced
            }
            None => &mut unlimited,
        };
        match jit.compile_with(program, UnitId(0), budget) {
            Ok(CompileStatus::Compiled(code)) => {
                return (code.len(), code.stats().literal_flushes, suspensions);
            }
            Ok(CompileStatus::Suspended) => suspensions += 1,
            Err(e) => panic!("benchmark compile failed: {}", e),
        }
    }
}

fn run_benchmark<B: Backend>(name: &str, backend: B, program: &Program) -> BenchmarkResult {
    let mut jit = JitCompiler::new(backend, JitConfig::default()).unwrap();

    let start = Instant::now();
    let mut unsliced = (0, 0, 0);
    for _ in 0..ROUNDS {
        unsliced = compile(&mut jit, program, None);
    }
    let unsliced_secs = start.elapsed().as_secs_f64();

    let start = Instant::now();
    let mut sliced = (0, 0, 0);
    for _ in 0..ROUNDS {
        sliced = compile(&mut jit, program, Some(1));
    }
    let sliced_secs = start.elapsed().as_secs_f64();
    assert_eq!(unsliced.0, sliced.0, "{}: sliced code differs in size", name);

    BenchmarkResult {
        name: name.to_string(),
        backend: B::NAME,
        code_bytes: unsliced.0,
        literal_flushes: unsliced.1,
        unsliced_secs,
        sliced_secs,
        suspensions_per_compile: sliced.2,
    }
}

fn main() {
    let programs = [
        ("sum_loop", sum_loop()),
        ("straight_line", straight_line(64)),
        ("inline_chain", inline_chain()),
    ];

    let mut results = Vec::new();
    for (name, program) in &programs {
        results.push(run_benchmark(name, Arm32, program));
        results.push(run_benchmark(name, AArch64, program));
    }

    let output = BenchmarkOutput {
        rounds: ROUNDS,
        results,
    };
    println!("{}", serde_json::to_string_pretty(&output).unwrap());
}
