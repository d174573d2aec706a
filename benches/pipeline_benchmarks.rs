// Benchmark tests for the citation pipeline

use casestrainer::services::extractor::CitationExtractor;
use casestrainer::services::pipeline::CitationPipeline;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn generate_large_text_with_citations(num_citations: usize) -> String {
    let mut text = String::new();
    text.push_str("This is a legal document with multiple citations. ");

    for i in 1..=num_citations {
        text.push_str(&format!(
            "See Party{} v. Opponent{}, {} F.3d {} (2003). ",
            i,
            i,
            100 + (i % 800),
            100 + (i % 900)
        ));

        if i % 10 == 0 {
            text.push_str("Additionally, refer to ");
        }

        text.push_str(&format!("42 U.S.C. § {}. ", 3500 + i));

        if i % 5 == 0 {
            text.push_str(&format!(
                "Accord Brown v. Board of Educ., 347 U.S. 483, {}, 74 S. Ct. 686 (1954). ",
                490 + (i % 9)
            ));
        }
    }

    text.push_str("This concludes the document with citations.");
    text
}

fn extraction_benchmark(c: &mut Criterion) {
    let extractor = CitationExtractor::new();
    let mut group = c.benchmark_group("extraction");

    for num_citations in [1, 10, 50, 100, 500].iter() {
        let text = generate_large_text_with_citations(*num_citations);

        group.bench_with_input(
            BenchmarkId::new("extract", num_citations),
            &text,
            |b, text| {
                b.iter(|| extractor.extract(black_box(text)));
            },
        );
    }

    group.finish();
}

fn full_pipeline_benchmark(c: &mut Criterion) {
    let pipeline = CitationPipeline::new();
    let mut group = c.benchmark_group("pipeline");

    for num_citations in [10, 100, 500].iter() {
        let text = generate_large_text_with_citations(*num_citations);

        group.bench_with_input(
            BenchmarkId::new("run", num_citations),
            &text,
            |b, text| {
                b.iter(|| pipeline.run(black_box(text)));
            },
        );
    }

    group.finish();
}

fn name_extraction_benchmark(c: &mut Criterion) {
    let pipeline = CitationPipeline::new();
    let text = generate_large_text_with_citations(100);
    let extraction = pipeline.extract(&text);

    c.bench_function("name_extraction_100", |b| {
        b.iter(|| pipeline.extract_names(black_box(&text), black_box(&extraction)));
    });
}

fn clustering_benchmark(c: &mut Criterion) {
    let pipeline = CitationPipeline::new();
    let text = generate_large_text_with_citations(500);
    let extraction = pipeline.extract(&text);
    let names = pipeline.extract_names(&text, &extraction);

    c.bench_function("clustering_500", |b| {
        b.iter(|| {
            pipeline.cluster(
                black_box(&text),
                black_box(&extraction.occurrences),
                black_box(&names),
            )
        });
    });
}

criterion_group!(
    benches,
    extraction_benchmark,
    full_pipeline_benchmark,
    name_extraction_benchmark,
    clustering_benchmark
);

criterion_main!(benches);
