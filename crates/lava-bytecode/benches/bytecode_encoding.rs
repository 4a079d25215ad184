use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lava_bytecode::builder::BytecodeBuilder;
use lava_bytecode::opcode::Opcode;
use lava_bytecode::SourceInfo;

fn emit_loop(c: &mut Criterion) {
    c.bench_function("emit_1000_add_instructions", |b| {
        b.iter(|| {
            let mut builder = BytecodeBuilder::new("bench", 0);
            for _ in 0..1000 {
                builder
                    .emit_d(Opcode::Add, 0, 1, 2, SourceInfo::new(0, 1))
                    .unwrap();
            }
            black_box(builder.finish());
        });
    });
}

criterion_group!(benches, emit_loop);
criterion_main!(benches);
