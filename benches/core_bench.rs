//! Benchmarks for bpforge core operations.
//!
//! Run with: cargo bench
//!
//! Results include 95% confidence intervals via Criterion.

use bpforge::core::expand::expand;
use bpforge::core::fingerprint::fingerprint;
use bpforge::core::parser::parse_blueprint;
use bpforge::core::reference::parse_string;
use bpforge::modules::{ModuleInfo, StaticProvider, VarInfo};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_parse_string(c: &mut Criterion) {
    let inputs = [
        ("literal", "plain literal value".to_string()),
        ("single", "$(vars.project_id)".to_string()),
        (
            "mixed",
            "prefix-$(vars.deployment_name)-$(network.network_name)-suffix".to_string(),
        ),
        ("escaped", "echo \\$(hostname) > $(vars.path)".to_string()),
    ];

    let mut group = c.benchmark_group("parse_string");
    for (name, input) in &inputs {
        group.bench_with_input(BenchmarkId::from_parameter(name), input, |b, input| {
            b.iter(|| {
                let parsed = parse_string(black_box(input)).unwrap();
                black_box(parsed);
            });
        });
    }
    group.finish();
}

/// Blueprint with `n` compute modules that all `use` one network module.
fn generate_blueprint(n: usize) -> String {
    let mut yaml = String::from(
        "blueprint_name: bench\nvars:\n  project_id: bench-project\n  deployment_name: bench\n  region: us-central1\ndeployment_groups:\n- group: primary\n  modules:\n  - id: network\n    source: ./modules/vpc\n",
    );
    for i in 0..n {
        yaml.push_str(&format!(
            "  - id: vm-{i}\n    source: ./modules/vm\n    use: [network]\n    settings:\n      name: $(vars.deployment_name)-{i}\n"
        ));
    }
    yaml
}

fn provider() -> StaticProvider {
    StaticProvider::new()
        .with(
            "./modules/vpc",
            ModuleInfo::new()
                .input(VarInfo::required("project_id"))
                .input(VarInfo::optional("region"))
                .output("network_self_link"),
        )
        .with(
            "./modules/vm",
            ModuleInfo::new()
                .input(VarInfo::required("project_id"))
                .input(VarInfo::optional("name"))
                .input(VarInfo::optional("labels"))
                .input(VarInfo::optional("network_self_link")),
        )
}

fn bench_expand(c: &mut Criterion) {
    let provider = provider();
    let mut group = c.benchmark_group("expand");
    for n in [10, 50, 200] {
        let bp = parse_blueprint(&generate_blueprint(n)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &bp, |b, bp| {
            b.iter(|| {
                let mut bp = bp.clone();
                let report = expand(black_box(&mut bp), &provider).unwrap();
                black_box(report);
            });
        });
    }
    group.finish();
}

fn bench_fingerprint(c: &mut Criterion) {
    let provider = provider();
    let mut group = c.benchmark_group("fingerprint");
    for n in [10, 200] {
        let mut bp = parse_blueprint(&generate_blueprint(n)).unwrap();
        expand(&mut bp, &provider).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(n), &bp, |b, bp| {
            b.iter(|| black_box(fingerprint(black_box(bp)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parse_string, bench_expand, bench_fingerprint);
criterion_main!(benches);
