use core_lexing::{DEFAULT_ICTL, extract_logical_line};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn build_source(statements: usize) -> String {
    let mut out = String::new();
    for i in 0..statements {
        // every third statement is continued
        if i % 3 == 0 {
            out.push_str(&format!(
                "L{i:<8} LR    1,{}                                                    X\n",
                i % 16
            ));
            out.push_str("               2\n");
        } else {
            out.push_str(&format!("L{i:<8} LR    1,{}\n", i % 16));
        }
    }
    out
}

fn bench_extract(c: &mut Criterion) {
    let source = build_source(2_000);
    c.bench_function("extract_logical_line/2000", |b| {
        b.iter(|| {
            let mut view = black_box(source.as_str());
            let mut count = 0usize;
            while let Some(line) = extract_logical_line(&mut view, &DEFAULT_ICTL) {
                count += line.segments.len();
            }
            count
        })
    });
}

criterion_group!(benches, bench_extract);
criterion_main!(benches);
