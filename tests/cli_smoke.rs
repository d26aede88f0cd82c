use std::collections::BTreeMap;
use std::process::Command;

use prompt_consistency::config::RcbdConfig;
use prompt_consistency::design::{ExperimentalUnit, Factor};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
struct PowerAnswer {
    n_per_group: Option<f64>,
    total_units: Option<u64>,
    interpretation: String,
}

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() <= tol
}

fn run_cli(args: &[&str]) -> std::process::Output {
    let output = Command::new(env!("CARGO_BIN_EXE_consistency"))
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "consistency {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    output
}

#[test]
fn cli_design_attach_analyze_round_trip() {
    let dir = tempdir().unwrap();
    let units_path = dir.path().join("units.json");
    let order_path = dir.path().join("order.json");
    let responses_path = dir.path().join("responses.json");
    let filled_path = dir.path().join("filled.json");
    let report_path = dir.path().join("report.json");

    run_cli(&[
        "design",
        "--mode",
        "demo",
        "--out",
        units_path.to_str().unwrap(),
        "--run-order",
        order_path.to_str().unwrap(),
        "--seed",
        "3",
    ]);
    let units: Vec<ExperimentalUnit> =
        serde_json::from_str(&std::fs::read_to_string(&units_path).unwrap()).unwrap();
    assert_eq!(units.len(), 12);
    let order: Vec<u64> =
        serde_json::from_str(&std::fs::read_to_string(&order_path).unwrap()).unwrap();
    assert_eq!(order.len(), 12);

    let responses: BTreeMap<u64, Vec<String>> = units
        .iter()
        .map(|u| {
            let texts = (0..3).map(|i| format!("{} answer {}", u.stimulus, i % 2)).collect();
            (u.id, texts)
        })
        .collect();
    std::fs::write(&responses_path, serde_json::to_string(&responses).unwrap()).unwrap();

    run_cli(&[
        "attach",
        "--units",
        units_path.to_str().unwrap(),
        "--responses",
        responses_path.to_str().unwrap(),
        "--out",
        filled_path.to_str().unwrap(),
    ]);
    run_cli(&[
        "analyze",
        "--units",
        filled_path.to_str().unwrap(),
        "--out",
        report_path.to_str().unwrap(),
    ]);

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["scoring"]["scored"], 12);
    assert!(report["factorial"]["as_nuisance"]["main_effects"]["prompt_language"].is_object());
    assert!(report["power"]["recommendation"]["kind"].is_string());
}

#[test]
fn cli_power_reports_closed_form_sample_size() {
    let output = run_cli(&["power", "--effect-size", "0.8"]);
    let answer: PowerAnswer = serde_json::from_slice(&output.stdout).unwrap();
    assert!(approx_eq(answer.n_per_group.unwrap(), 12.26, 0.01));
    assert_eq!(answer.total_units, Some(13 * 16 * 3));
    assert_eq!(answer.interpretation, "large");

    let zero = run_cli(&["power", "--effect-size", "0"]);
    let answer: PowerAnswer = serde_json::from_slice(&zero.stdout).unwrap();
    assert_eq!(answer.n_per_group, None);
    assert_eq!(answer.total_units, None);
}

#[test]
fn cli_rejects_unknown_mode() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("units.json");
    let status = Command::new(env!("CARGO_BIN_EXE_consistency"))
        .args(["design", "--mode", "huge", "--out"])
        .arg(&out)
        .status()
        .unwrap();
    assert!(!status.success());
    assert!(!out.exists());
}

#[test]
fn cli_rcbd_rejects_mode_flag() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("units.json");
    let status = Command::new(env!("CARGO_BIN_EXE_consistency"))
        .args(["design", "--rcbd", "--mode", "demo", "--out"])
        .arg(&out)
        .status()
        .unwrap();
    assert!(!status.success());
    assert!(!out.exists());
}

#[test]
fn cli_rcbd_uses_supplied_config() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("rcbd.json");
    let units_path = dir.path().join("units.json");
    let responses_path = dir.path().join("responses.json");
    let filled_path = dir.path().join("filled.json");
    let report_path = dir.path().join("report.json");

    let mut config = RcbdConfig::framing_study();
    config.treatment = Factor::new("tone", ["plain", "warm"]).unwrap();
    std::fs::write(&config_path, serde_json::to_string(&config).unwrap()).unwrap();

    run_cli(&[
        "design",
        "--rcbd",
        "--config",
        config_path.to_str().unwrap(),
        "--out",
        units_path.to_str().unwrap(),
    ]);
    let units: Vec<ExperimentalUnit> =
        serde_json::from_str(&std::fs::read_to_string(&units_path).unwrap()).unwrap();
    assert_eq!(units.len(), 2 * 3 * 7);
    assert!(units.iter().all(|u| u.combination.level("tone").is_some()));

    let responses: BTreeMap<u64, Vec<String>> = units
        .iter()
        .map(|u| (u.id, vec![u.stimulus.clone(), format!("{} again", u.stimulus)]))
        .collect();
    std::fs::write(&responses_path, serde_json::to_string(&responses).unwrap()).unwrap();
    run_cli(&[
        "attach",
        "--units",
        units_path.to_str().unwrap(),
        "--responses",
        responses_path.to_str().unwrap(),
        "--out",
        filled_path.to_str().unwrap(),
    ]);
    run_cli(&[
        "analyze",
        "--rcbd",
        "--config",
        config_path.to_str().unwrap(),
        "--units",
        filled_path.to_str().unwrap(),
        "--out",
        report_path.to_str().unwrap(),
    ]);

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&report_path).unwrap()).unwrap();
    assert_eq!(report["rcbd"]["treatment"], "tone");
    assert_eq!(report["rcbd"]["interaction"]["cells"].as_array().unwrap().len(), 6);
}
