use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use vibedoc_core::{Editor, ElementKind, TextFormat};

fn seeded_editor(paragraphs: usize) -> Editor {
    let mut editor = Editor::new();
    editor
        .update(&[], |txn| {
            let root = txn.root();
            for i in 0..paragraphs {
                let p = txn.append_element(root, ElementKind::Paragraph)?;
                txn.append_text(p, format!("paragraph number {i}"), TextFormat::PLAIN)?;
            }
            Ok(())
        })
        .unwrap();
    editor
}

fn bench_insert_text(c: &mut Criterion) {
    let mut group = c.benchmark_group("Editor Updates");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_char_1k_blocks", |b| {
        let mut editor = seeded_editor(1_000);
        let state = editor.state().clone();
        let first = state.children(state.children(state.root())[0])[0];
        b.iter(|| {
            editor
                .update(&[], |txn| txn.insert_text(first, 0, black_box("x")))
                .unwrap();
        })
    });

    group.finish();
}

fn bench_json_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("Editor JSON");
    let editor = seeded_editor(200);
    let json = editor.to_json().unwrap();
    group.throughput(Throughput::Bytes(json.len() as u64));

    group.bench_function("import_200_blocks", |b| {
        b.iter(|| {
            let mut target = Editor::new();
            target.set_json(black_box(&json), &[]).unwrap();
            black_box(target.state().len());
        })
    });

    group.finish();
}

criterion_group!(benches, bench_insert_text, bench_json_roundtrip);
criterion_main!(benches);
