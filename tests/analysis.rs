use prompt_consistency::analysis::{
    analyze, block_effects, build_table, compare_block_treatments, fit_additive_model,
    main_effects, rcbd_report, two_way_interactions, AnalysisModel, AnalysisTable,
    EffectConvention, ModelOutcome,
};
use prompt_consistency::config::RcbdConfig;
use prompt_consistency::design::{ExperimentalUnit, Factor, FactorCombination};
use prompt_consistency::{ConfigurationError, ModelFitError};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

fn factors() -> Vec<Factor> {
    vec![
        Factor::new("language", ["korean", "english"]).unwrap(),
        Factor::new("role", ["with_role", "no_role"]).unwrap(),
    ]
}

fn scored(id: u64, language: &str, role: &str, block: &str, score: Option<f64>) -> ExperimentalUnit {
    let mut u = ExperimentalUnit::new(
        id,
        FactorCombination::new()
            .with("language", language)
            .with("role", role),
        block,
        format!("stimulus {id}"),
    );
    u.score = score;
    u
}

/// language: korean ≈ 0.9, english ≈ 0.3; role adds nothing; replicated
/// across two blocks with a small block shift.
fn replicated_table() -> AnalysisTable {
    let mut units = Vec::new();
    let mut id = 0;
    for (language, base) in [("korean", 0.9), ("english", 0.3)] {
        for role in ["with_role", "no_role"] {
            for (block, shift) in [("personality", 0.02), ("creativity", -0.02)] {
                for jitter in [-0.01, 0.01] {
                    id += 1;
                    units.push(scored(id, language, role, block, Some(base + shift + jitter)));
                }
            }
        }
    }
    build_table(&units, &factors(), "category")
}

#[test]
fn null_scores_are_dropped_from_the_table() {
    let units = vec![
        scored(1, "korean", "no_role", "b", Some(0.5)),
        scored(2, "korean", "no_role", "b", None),
    ];
    let table = build_table(&units, &factors(), "category");
    assert_eq!(table.len(), 1);
    assert_eq!(table.rows[0].unit_id, 1);
}

#[test]
fn main_effect_magnitude_is_range_of_level_means() {
    let effects = main_effects(&replicated_table());
    let language = &effects["language"];
    assert!(approx_eq(language.magnitude, 0.6, 1e-12));
    assert!(approx_eq(language.level("korean").unwrap().mean, 0.9, 1e-12));
    assert!(approx_eq(language.level("english").unwrap().mean, 0.3, 1e-12));
    assert_eq!(language.level("korean").unwrap().n, 8);

    let d = language.effect.unwrap();
    assert_eq!(d.convention, EffectConvention::CohensD);
    assert!(d.value > 10.0);

    assert!(approx_eq(effects["role"].magnitude, 0.0, 1e-12));
}

#[test]
fn multi_level_factor_uses_eta_squared() {
    let tone = Factor::new("tone", ["calm", "warm", "sharp"]).unwrap();
    let mut units = Vec::new();
    for (i, (level, score)) in [
        ("calm", 0.9),
        ("calm", 0.8),
        ("warm", 0.6),
        ("warm", 0.5),
        ("sharp", 0.2),
        ("sharp", 0.1),
    ]
    .into_iter()
    .enumerate()
    {
        let mut u = ExperimentalUnit::new(
            i as u64 + 1,
            FactorCombination::new().with("tone", level),
            "b",
            "q",
        );
        u.score = Some(score);
        units.push(u);
    }
    let table = build_table(&units, &[tone], "category");
    let effect = main_effects(&table)["tone"].effect.unwrap();
    assert_eq!(effect.convention, EffectConvention::EtaSquared);
    let grand = 3.1 / 6.0;
    let between: f64 = [0.85, 0.55, 0.15]
        .iter()
        .map(|m: &f64| 2.0 * (m - grand).powi(2))
        .sum();
    let within = 6.0 * 0.05f64.powi(2);
    assert!(approx_eq(effect.value, between / (between + within), 1e-9));
}

#[test]
fn additive_fit_and_anova_on_replicated_design() {
    let table = replicated_table();
    let model = fit_additive_model(&table, AnalysisModel::nuisance()).unwrap();
    assert_eq!(model.n_obs, 16);
    assert_eq!(model.n_params, 4);
    assert!(model.r_squared.unwrap() > 0.99);
    let language = model.anova_row("language").unwrap();
    assert!(language.p_value.unwrap() < 1e-6);
    assert!(language.eta_squared.unwrap() > 0.9);
    assert!(approx_eq(
        model.coefficient("language[T.english]").unwrap(),
        -0.6,
        1e-9
    ));
}

#[test]
fn singular_design_degrades_but_group_means_survive() {
    // One observation per combination and a single block: the crossed model
    // is saturated and the block column is constant.
    let units = vec![
        scored(1, "korean", "with_role", "general", Some(0.9)),
        scored(2, "korean", "no_role", "general", Some(0.8)),
        scored(3, "english", "with_role", "general", Some(0.4)),
        scored(4, "english", "no_role", "general", Some(0.2)),
    ];
    let table = build_table(&units, &factors(), "category");

    let fit = fit_additive_model(&table, AnalysisModel::block_as_factor());
    assert!(matches!(fit, Err(ModelFitError::NoResidualDegreesOfFreedom { .. })));

    let report = analyze(&table, AnalysisModel::block_as_factor());
    assert!(matches!(report.model, ModelOutcome::Degraded { .. }));
    assert!(approx_eq(report.main_effects["language"].magnitude, 0.55, 1e-12));
    assert!(approx_eq(report.main_effects["role"].magnitude, 0.15, 1e-12));
    let block = report.block_effects.unwrap();
    assert_eq!(block.levels.len(), 1);
    assert_eq!(block.magnitude, 0.0);
}

#[test]
fn confounded_factors_are_rank_deficient() {
    // role always mirrors language.
    let units: Vec<ExperimentalUnit> = (1..=6)
        .map(|id| {
            let (language, role) = if id % 2 == 0 {
                ("korean", "with_role")
            } else {
                ("english", "no_role")
            };
            scored(id, language, role, "general", Some(0.1 * id as f64))
        })
        .collect();
    let table = build_table(&units, &factors(), "category");
    assert!(matches!(
        fit_additive_model(&table, AnalysisModel::nuisance()),
        Err(ModelFitError::RankDeficient { .. })
    ));
    let effects = main_effects(&table);
    assert!(effects["language"].effect.is_some());
    assert!(effects["role"].magnitude > 0.0);
}

#[test]
fn interactions_cover_factor_pairs_and_block() {
    let tables = two_way_interactions(&replicated_table());
    let pairs: Vec<(&str, &str)> = tables
        .iter()
        .map(|t| (t.first.as_str(), t.second.as_str()))
        .collect();
    assert_eq!(
        pairs,
        vec![
            ("language", "role"),
            ("language", "category"),
            ("role", "category")
        ]
    );
    let lr = &tables[0];
    assert!(approx_eq(lr.cell("korean", "no_role").unwrap().mean.unwrap(), 0.9, 1e-12));
    assert!(approx_eq(lr.contrast.unwrap(), 0.0, 1e-12));
}

#[test]
fn block_effect_reports_standardized_range() {
    let block = block_effects(&replicated_table()).unwrap();
    assert!(approx_eq(block.magnitude, 0.04, 1e-12));
    assert_eq!(
        block.effect.unwrap().convention,
        EffectConvention::StandardizedRange
    );
}

#[test]
fn comparison_reports_fit_statistics_for_both_treatments() {
    let cmp = compare_block_treatments(&replicated_table());
    assert!(cmp.comparison.r_squared_nuisance.is_some());
    assert!(cmp.comparison.r_squared_factor.is_some());
    assert!(cmp.comparison.aic_nuisance.is_some());
    assert!(cmp.comparison.preferred.is_some());
    // Group-mean summaries are identical regardless of block treatment.
    assert_eq!(cmp.as_nuisance.main_effects, cmp.as_factor.main_effects);
}

#[test]
fn rcbd_report_tests_treatment_and_block() {
    let config = RcbdConfig::framing_study();
    let mut units = config.units().unwrap();
    for u in &mut units {
        let base = match u.combination.level("framing_level") {
            Some("neutral") => 0.85,
            Some("emotional") => 0.7,
            _ => 0.5,
        };
        let wobble = (u.id % 7) as f64 * 0.005;
        u.score = Some(base + wobble);
    }
    let table = build_table(&units, std::slice::from_ref(&config.treatment), "category");
    let report = rcbd_report(&table, "framing_level", 0.05).unwrap();

    let treatment = report.treatment_test.unwrap();
    assert!(treatment.significant);
    assert!(treatment.eta_squared.unwrap() > 0.8);
    assert!(!report.additive.is_degraded());
    assert_eq!(report.interaction.cells.len(), 9);
    assert!(approx_eq(report.treatment_effect.unwrap().magnitude, 0.35, 1e-9));

    assert_eq!(
        rcbd_report(&table, "tone", 0.05).unwrap_err(),
        ConfigurationError::UndeclaredFactor("tone".into())
    );
}
