use crate::{
    CorrelationMatrix, Dataset, EigenDecomposition, EstimationMethod, FactorAnalysis,
    FactorAnalysisConfig, FactorError, Rotation, SimulationModel, StandardizedDataset,
};
use approx::assert_abs_diff_eq;
use float_cmp::assert_approx_eq;
use ndarray::{array, Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn simulate(loadings: Array2<f64>, phi: Option<Array2<f64>>, n: usize, seed: u64) -> Dataset {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut model = SimulationModel::new(loadings).unwrap();
    if let Some(phi) = phi {
        model = model.with_phi(phi).unwrap();
    }
    model.sample(n, &mut rng).unwrap()
}

fn fit(correlation: &CorrelationMatrix, k: usize, method: EstimationMethod, rotation: Rotation) -> crate::FactorModel {
    let config = FactorAnalysisConfig {
        n_factors: k,
        method,
        rotation,
        ..FactorAnalysisConfig::default()
    };
    FactorAnalysis::new(config).fit(correlation).unwrap()
}

fn dominant_factor(row: ndarray::ArrayView1<'_, f64>) -> usize {
    (0..row.len())
        .max_by(|&a, &b| row[a].abs().total_cmp(&row[b].abs()))
        .unwrap()
}

#[test]
fn test_two_factor_toy_pipeline() {
    // Two clean clusters of three variables, x3 much noisier than the rest.
    let loadings = array![
        [0.9, 0.0],
        [0.85, 0.0],
        [0.4, 0.0],
        [0.0, 0.9],
        [0.0, 0.85],
        [0.0, 0.8]
    ];
    let data = simulate(loadings, None, 1000, 42);
    let standardized = StandardizedDataset::new(&data).unwrap();
    let correlation = CorrelationMatrix::from_standardized(&standardized);

    let eig = EigenDecomposition::new(&correlation).unwrap();
    assert_approx_eq!(f64, eig.trace(), 6.0, epsilon = 1e-9);
    assert_eq!(eig.kaiser_count(), 2);
    let values = eig.eigenvalues();
    assert!(values[0] + values[1] > values.iter().skip(2).sum::<f64>());

    let model = fit(&correlation, 2, EstimationMethod::MinimumResidual, Rotation::Varimax);
    let h2 = model.communalities();
    for i in [0, 1, 3, 4] {
        assert!(h2[i] > h2[2], "h2[{}] = {} vs noisy {}", i, h2[i], h2[2]);
    }
    let l = model.loadings();
    assert!(l[[0, dominant_factor(l.row(0))]].abs() > 0.8);
    assert_eq!(dominant_factor(l.row(0)), dominant_factor(l.row(1)));
    assert_eq!(dominant_factor(l.row(3)), dominant_factor(l.row(5)));
    assert_ne!(dominant_factor(l.row(0)), dominant_factor(l.row(3)));
    assert_eq!(model.phi(), Array2::<f64>::eye(2));
    println!("{}", model);
}

#[test]
fn test_estimation_methods_agree_on_communalities() {
    let loadings = array![
        [0.8, 0.0, 0.0],
        [0.7, 0.0, 0.0],
        [0.6, 0.0, 0.0],
        [0.0, 0.8, 0.0],
        [0.0, 0.7, 0.0],
        [0.0, 0.6, 0.0],
        [0.0, 0.0, 0.8],
        [0.0, 0.0, 0.7],
        [0.0, 0.0, 0.6]
    ];
    let data = simulate(loadings, None, 2000, 7);
    let correlation = CorrelationMatrix::from_dataset(&data).unwrap();
    let minres = fit(&correlation, 3, EstimationMethod::MinimumResidual, Rotation::Varimax);
    let ml = fit(&correlation, 3, EstimationMethod::MaximumLikelihood, Rotation::Varimax);
    let pa = fit(&correlation, 3, EstimationMethod::PrincipalAxis, Rotation::Varimax);
    for i in 0..9 {
        assert_abs_diff_eq!(minres.communalities()[i], ml.communalities()[i], epsilon = 0.05);
        assert_abs_diff_eq!(minres.communalities()[i], pa.communalities()[i], epsilon = 0.05);
    }
    assert!(ml.fit().chi_square.is_some());
    assert!(ml.fit().rmsea.unwrap() < 0.05);
}

#[test]
fn test_oblique_rotations_recover_factor_correlation() {
    let loadings = array![
        [0.8, 0.0],
        [0.7, 0.0],
        [0.7, 0.0],
        [0.6, 0.0],
        [0.0, 0.8],
        [0.0, 0.7],
        [0.0, 0.7],
        [0.0, 0.6]
    ];
    let phi = array![[1.0, 0.5], [0.5, 1.0]];
    let data = simulate(loadings, Some(phi), 2000, 11);
    let correlation = CorrelationMatrix::from_dataset(&data).unwrap();

    let oblimin = fit(&correlation, 2, EstimationMethod::MinimumResidual, Rotation::Oblimin { gamma: 0.0 });
    assert_abs_diff_eq!(oblimin.phi()[[0, 1]], 0.5, epsilon = 0.08);
    assert_abs_diff_eq!(oblimin.phi()[[0, 1]], oblimin.phi()[[1, 0]], epsilon = 1e-10);

    let promax = fit(&correlation, 2, EstimationMethod::MinimumResidual, Rotation::Promax);
    assert!(promax.phi()[[0, 1]] > 0.3);

    let varimax = fit(&correlation, 2, EstimationMethod::MinimumResidual, Rotation::Varimax);
    assert_eq!(varimax.phi(), Array2::<f64>::eye(2));
    // Rotation never changes the implied common correlations.
    let a = oblimin.implied_common();
    let b = varimax.implied_common();
    for (x, y) in a.iter().zip(b.iter()) {
        assert_abs_diff_eq!(*x, *y, epsilon = 1e-8);
    }
}

#[test]
fn test_regression_scores_are_centered() {
    let loadings = array![[0.8, 0.0], [0.7, 0.0], [0.6, 0.0], [0.0, 0.7], [0.0, 0.6], [0.0, 0.5]];
    let data = simulate(loadings, None, 500, 3);
    let standardized = StandardizedDataset::new(&data).unwrap();
    let model = FactorAnalysis::new(FactorAnalysisConfig::with_factors(2))
        .fit_dataset(&standardized)
        .unwrap();
    let scores = model.scores(&standardized).unwrap();
    assert_eq!(scores.dim(), (500, 2));
    for mean in scores.mean_axis(Axis(0)).unwrap().iter() {
        assert_abs_diff_eq!(*mean, 0.0, epsilon = 1e-10);
    }
    // Regression scores shrink towards zero: variance below one.
    for var in scores.var_axis(Axis(0), 1.0).iter() {
        assert!(*var < 1.0 && *var > 0.3);
    }

    let other = StandardizedDataset::new(&data.select(&["V1", "V2", "V3"]).unwrap()).unwrap();
    assert!(matches!(model.scores(&other), Err(FactorError::InvalidData(_))));
}

#[test]
fn test_duplicate_column_is_singular_not_nan() {
    let loadings = array![[0.8], [0.7], [0.6], [0.5]];
    let data = simulate(loadings, None, 200, 5);
    let mut columns = data.data().to_owned();
    let copy = columns.column(0).to_owned();
    columns.column_mut(3).assign(&copy);
    let names = data.names().to_vec();
    let duplicated = Dataset::new(names, columns).unwrap();
    let correlation = CorrelationMatrix::from_dataset(&duplicated).unwrap();

    let err = FactorAnalysis::new(FactorAnalysisConfig::with_factors(1))
        .fit(&correlation)
        .unwrap_err();
    assert!(matches!(err, FactorError::SingularCorrelation { .. }), "{:?}", err);

    let vss = crate::very_simple_structure(
        &correlation,
        &crate::VssConfig {
            max_factors: 1,
            ..crate::VssConfig::default()
        },
    );
    assert!(matches!(vss, Err(FactorError::SingularCorrelation { .. })));
}

#[test]
fn test_constant_column_fails_standardization() {
    let data = Dataset::new(
        vec!["a".into(), "b".into(), "c".into()],
        array![[1.0, 2.0, 5.0], [2.0, 2.0, 3.0], [3.0, 2.0, 4.0]],
    )
    .unwrap();
    match StandardizedDataset::new(&data) {
        Err(FactorError::ZeroVariance { column }) => assert_eq!(column, "b"),
        other => panic!("expected zero variance, got {:?}", other),
    }
}

#[test]
fn test_heatmap_order_follows_loadings() {
    // Variables interleaved across the two factors.
    let loadings = array![[0.8, 0.0], [0.0, 0.8], [0.7, 0.0], [0.0, 0.7], [0.6, 0.0], [0.0, 0.6]];
    let data = simulate(loadings, None, 1500, 19);
    let correlation = CorrelationMatrix::from_dataset(&data).unwrap();
    let model = fit(&correlation, 2, EstimationMethod::MinimumResidual, Rotation::Varimax);
    let order = model.sorted_variable_order();
    let reordered = correlation.reordered(&order).unwrap();
    let first_block: Vec<&str> = reordered.names()[..3].iter().map(String::as_str).collect();
    assert!(first_block == ["V1", "V3", "V5"] || first_block == ["V2", "V4", "V6"], "{:?}", first_block);
    assert_eq!(reordered.matrix()[[0, 1]], correlation.matrix()[[order[0], order[1]]]);
}

#[test]
fn test_model_serializes_to_json() {
    let loadings = array![[0.8], [0.7], [0.6], [0.5]];
    let data = simulate(loadings, None, 300, 23);
    let correlation = CorrelationMatrix::from_dataset(&data).unwrap();
    let model = fit(&correlation, 1, EstimationMethod::MaximumLikelihood, Rotation::Varimax);
    let json = serde_json::to_string(&model).unwrap();
    assert!(json.contains("\"loadings\""));
    assert!(json.contains("\"uniquenesses\""));
    let config: FactorAnalysisConfig = serde_json::from_str(&serde_json::to_string(&FactorAnalysisConfig::default()).unwrap()).unwrap();
    assert_eq!(config.rotation, Rotation::Varimax);
}
