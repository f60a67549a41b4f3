use finetune::loss::{categorical_accuracy, normalize_and_clip, CategoricalCrossentropy, EPSILON};
use finetune::{make_weighted_loss, ClassWeights, Loss, LossSpec};
use ndarray::{array, Array2, Axis};

fn one_hot(labels: &[usize], classes: usize) -> Array2<f32> {
    let mut y = Array2::zeros((labels.len(), classes));
    for (i, &label) in labels.iter().enumerate() {
        y[[i, label]] = 1.0;
    }
    y
}

/// Plain `-sum(y * ln(clip(p)))` on already-normalized rows.
fn reference_crossentropy(y_true: &Array2<f32>, y_pred: &Array2<f32>) -> Vec<f32> {
    y_true
        .axis_iter(Axis(0))
        .zip(y_pred.axis_iter(Axis(0)))
        .map(|(t, p)| {
            -t.iter()
                .zip(p.iter())
                .map(|(&t, &p)| t * p.clamp(EPSILON, 1.0 - EPSILON).ln())
                .sum::<f32>()
        })
        .collect()
}

#[test]
fn test_per_sample_values_are_non_negative() {
    let loss = make_weighted_loss(ClassWeights::reference()).unwrap();
    let y_true = one_hot(&[0, 1, 2, 3, 4], 5);
    let y_pred = array![
        [0.6, 0.1, 0.1, 0.1, 0.1],
        [0.2, 0.2, 0.2, 0.2, 0.2],
        [0.05, 0.05, 0.8, 0.05, 0.05],
        [0.3, 0.3, 0.1, 0.2, 0.1],
        [0.01, 0.01, 0.01, 0.01, 0.96],
    ];

    let values = loss.compute(y_true.view(), y_pred.view()).unwrap();
    assert_eq!(values.len(), 5);
    assert!(values.iter().all(|v| *v >= 0.0 && v.is_finite()));
}

#[test]
fn test_loss_decreases_as_true_class_probability_grows() {
    let loss = make_weighted_loss(ClassWeights::reference()).unwrap();
    let y_true = one_hot(&[3], 5);

    let mut previous = f32::INFINITY;
    for step in 1..10 {
        let p = step as f32 / 10.0;
        let rest = (1.0 - p) / 4.0;
        let y_pred = array![[rest, rest, rest, p, rest]];
        let value = loss.compute(y_true.view(), y_pred.view()).unwrap()[0];
        assert!(value < previous, "loss {} at p={} not below {}", value, p, previous);
        previous = value;
    }
}

#[test]
fn test_unnormalized_rows_are_renormalized() {
    let loss = make_weighted_loss(vec![1.0, 6.0, 6.0, 13.0, 13.0]).unwrap();
    let y_true = one_hot(&[1, 4], 5);
    let raw = array![[2.0, 1.0, 0.5, 0.25, 0.25], [0.3, 0.3, 0.3, 0.3, 1.8]];
    let sums = raw.sum_axis(Axis(1)).insert_axis(Axis(1));
    let normalized = &raw / &sums;

    let from_raw = loss.compute(y_true.view(), raw.view()).unwrap();
    let from_normalized = loss.compute(y_true.view(), normalized.view()).unwrap();
    for (a, b) in from_raw.iter().zip(from_normalized.iter()) {
        assert!((a - b).abs() < 1e-5, "{} != {}", a, b);
    }
}

#[test]
fn test_zero_and_one_predictions_stay_finite() {
    let loss = make_weighted_loss(ClassWeights::reference()).unwrap();
    let y_true = one_hot(&[0, 2, 4], 5);
    let y_pred = array![
        [0.0, 1.0, 0.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 0.0, 0.0, 0.0],
    ];

    let values = loss.compute(y_true.view(), y_pred.view()).unwrap();
    assert!(values.iter().all(|v| v.is_finite()));
    // A confidently wrong prediction hits the clip floor: -ln(EPSILON)
    assert!((values[0] - -(EPSILON.ln())).abs() < 1e-3);

    let grad = loss.gradient(y_true.view(), y_pred.view()).unwrap();
    assert!(grad.iter().all(|g| g.is_finite()));
}

#[test]
fn test_uniform_weights_match_plain_crossentropy() {
    let loss = make_weighted_loss(vec![1.0; 5]).unwrap();
    let y_true = one_hot(&[0, 1, 2, 3, 4, 2], 5);
    let y_pred = array![
        [0.7, 0.1, 0.1, 0.05, 0.05],
        [0.1, 0.5, 0.2, 0.1, 0.1],
        [0.25, 0.25, 0.2, 0.15, 0.15],
        [0.05, 0.05, 0.05, 0.8, 0.05],
        [0.1, 0.1, 0.1, 0.1, 0.6],
        [0.3, 0.3, 0.1, 0.2, 0.1],
    ];

    let weighted = loss.compute(y_true.view(), y_pred.view()).unwrap();
    let plain = CategoricalCrossentropy.compute(y_true.view(), y_pred.view()).unwrap();
    let reference = reference_crossentropy(&y_true, &y_pred);

    for i in 0..6 {
        assert!((weighted[i] - plain[i]).abs() < 1e-6);
        assert!((weighted[i] - reference[i]).abs() < 1e-5);
    }
}

#[test]
fn test_weights_scale_per_class() {
    let uniform = make_weighted_loss(vec![1.0; 5]).unwrap();
    let weighted = make_weighted_loss(ClassWeights::reference()).unwrap();
    let y_true = one_hot(&[0, 3], 5);
    let y_pred = array![[0.4, 0.15, 0.15, 0.15, 0.15], [0.15, 0.15, 0.15, 0.4, 0.15]];

    let base = uniform.compute(y_true.view(), y_pred.view()).unwrap();
    let scaled = weighted.compute(y_true.view(), y_pred.view()).unwrap();
    assert!((scaled[0] - base[0]).abs() < 1e-6);
    assert!((scaled[1] - 13.0 * base[1]).abs() < 1e-4);
}

#[test]
fn test_mean_reduction() {
    let loss = make_weighted_loss(vec![1.0, 2.0]).unwrap();
    let y_true = one_hot(&[0, 1], 2);
    let y_pred = array![[0.5, 0.5], [0.5, 0.5]];
    let mean = loss.mean(y_true.view(), y_pred.view()).unwrap();
    assert!((mean - 1.5 * 2.0f32.ln()).abs() < 1e-6);

    let empty = Array2::<f32>::zeros((0, 2));
    assert_eq!(loss.mean(empty.view(), empty.view()).unwrap(), 0.0);
}

#[test]
fn test_normalize_and_clip_bounds() {
    let probs = normalize_and_clip(array![[0.0, 2.0], [1.0, 3.0]].view());
    assert!(probs.iter().all(|p| *p >= EPSILON && *p <= 1.0 - EPSILON));
    assert!((probs[[1, 0]] - 0.25).abs() < 1e-6);
}

#[test]
fn test_accuracy_and_loss_spec() {
    let y_true = one_hot(&[0, 1], 2);
    let y_pred = array![[0.9, 0.1], [0.6, 0.4]];
    assert!((categorical_accuracy(y_true.view(), y_pred.view()).unwrap() - 0.5).abs() < 1e-6);

    let spec = LossSpec::WeightedCategoricalCrossentropy { weights: vec![1.0, 0.0] };
    assert!(spec.build().is_err());
}
