//! Dispatch loop and allocator benchmarks
//!
//! Run with: cargo bench --bench dispatch

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mocha::{ChunkBuilder, InterpretResult, OpCode, Value, VmConfig, VM};

fn quiet_vm() -> VM {
    VM::with_config(VmConfig {
        stack_trace: false,
        debug_trace: false,
        debug_bytecode: false,
        ..VmConfig::default()
    })
}

/// `i = 0; while (i < n) { <body>; i = i + 1 }`.
fn counted_loop(vm: &mut VM, n: f64, body: impl Fn(&mut ChunkBuilder, &mut VM)) -> Value {
    let i = Value::Obj(vm.intern("i"));
    let mut b = ChunkBuilder::new();
    b.at(1, 1, None);
    b.emit_constant(Value::Number(0.0)).unwrap();
    b.op_constant(OpCode::DefineVar, i).unwrap();
    let start = b.position();
    b.op_constant(OpCode::GetVar, i).unwrap();
    b.emit_constant(Value::Number(n)).unwrap();
    b.op(OpCode::Less);
    let exit = b.emit_jump(OpCode::JumpIfFalse);
    b.op(OpCode::Pop);
    body(&mut b, vm);
    b.op_constant(OpCode::GetVar, i).unwrap();
    b.emit_constant(Value::Number(1.0)).unwrap();
    b.op(OpCode::Add);
    b.op_constant(OpCode::SetVar, i).unwrap();
    b.op(OpCode::Pop);
    b.emit_loop(start).unwrap();
    b.patch_jump(exit).unwrap();
    b.op(OpCode::Pop);
    b.op_constant(OpCode::GetVar, i).unwrap();
    b.op(OpCode::Return);
    Value::Obj(vm.script(b.finish()))
}

fn run(vm: &mut VM, script: Value) {
    let Value::Obj(script) = script else {
        return;
    };
    assert_eq!(vm.interpret(script), InterpretResult::InterpretOk);
}

fn bench_arithmetic(c: &mut Criterion) {
    let mut group = c.benchmark_group("arithmetic");
    for n in [1_000.0, 10_000.0] {
        let mut vm = quiet_vm();
        let script = counted_loop(&mut vm, n, |b, _| {
            b.emit_constant(Value::Number(3.0)).unwrap();
            b.emit_constant(Value::Number(4.0)).unwrap();
            b.op(OpCode::Multiply);
            b.op(OpCode::Pop);
        });
        group.bench_with_input(BenchmarkId::from_parameter(n), &script, |bench, script| {
            bench.iter(|| run(&mut vm, black_box(*script)))
        });
    }
    group.finish();
}

fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    for n in [1_000.0, 10_000.0] {
        let mut vm = quiet_vm();
        let script = counted_loop(&mut vm, n, |b, vm| {
            let key = Value::Obj(vm.intern("k"));
            b.op(OpCode::Map).short(1);
            b.emit_constant(key).unwrap();
            b.op(OpCode::Array).short(2);
            b.op(OpCode::MapSet);
            b.op(OpCode::Pop);
            b.op(OpCode::Gc);
        });
        group.bench_with_input(BenchmarkId::from_parameter(n), &script, |bench, script| {
            bench.iter(|| run(&mut vm, black_box(*script)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_arithmetic, bench_allocation);
criterion_main!(benches);
