use criterion::{black_box, criterion_group, criterion_main, Criterion};
use finetune::models::InputShape;
use finetune::{
    make_weighted_loss, AssemblyConfig, BackboneSpec, ClassWeights, FreezePolicy, Loss, ModelAssembler,
};
use ndarray::{Array2, Array4};

fn batch(n: usize, classes: usize) -> (Array2<f32>, Array2<f32>) {
    let y_true = Array2::from_shape_fn((n, classes), |(i, c)| if i % classes == c { 1.0 } else { 0.0 });
    let y_pred = Array2::from_shape_fn((n, classes), |(i, c)| 1.0 + ((i * 7 + c * 3) % 11) as f32);
    (y_true, y_pred)
}

fn bench_weighted_loss(c: &mut Criterion) {
    let loss = make_weighted_loss(ClassWeights::reference()).unwrap();
    let mut group = c.benchmark_group("WeightedLoss");
    group.sample_size(50);
    group.warm_up_time(std::time::Duration::from_secs(1));

    for n in [32, 256, 2048] {
        let (y_true, y_pred) = batch(n, 5);
        group.bench_function(format!("compute_{}", n), |b| b.iter(|| {
            loss.compute(black_box(y_true.view()), black_box(y_pred.view())).unwrap()
        }));
        group.bench_function(format!("gradient_{}", n), |b| b.iter(|| {
            loss.gradient(black_box(y_true.view()), black_box(y_pred.view())).unwrap()
        }));
    }

    group.finish();
}

fn bench_head_forward(c: &mut Criterion) {
    let spec = BackboneSpec {
        name: "bench".to_string(),
        input_shape: InputShape { height: 299, width: 299, channels: 3 },
        output_channels: 2048,
        layers: Vec::new(),
    };
    let assembler = ModelAssembler::new()
        .with_config(AssemblyConfig::default().with_seed(7))
        .unwrap();
    let model = assembler.assemble_detached(spec, FreezePolicy::FreezeBackbone).unwrap();

    let mut group = c.benchmark_group("HeadForward");
    group.sample_size(20);

    for n in [1, 16] {
        let features = Array4::from_elem((n, 10, 10, 2048), 0.5f32);
        group.bench_function(format!("batch_{}", n), |b| b.iter(|| {
            model.predict_features(black_box(features.view())).unwrap()
        }));
    }

    group.finish();
}

criterion_group!(benches, bench_weighted_loss, bench_head_forward);
criterion_main!(benches);
