use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::tempdir;

fn write_fixture(data_dir: &Path) {
    fs::create_dir_all(data_dir.join("configs")).expect("configs dir");
    fs::create_dir_all(data_dir.join("trades")).expect("trades dir");
    fs::write(
        data_dir.join("configs").join("1.json"),
        r#"{
            "id": 1,
            "name": "smoke",
            "settings": {
                "combinationsToTest": ["Closed In LTA"],
                "predefinedFilters": [
                    {"type": "timeRange", "columnHeader": "Time",
                     "condition": {"minMinutes": "09:00", "maxMinutes": "09:30"}}
                ],
                "minTradeCount": 1,
                "rankingWeights": {"profitFactor": 1, "winRate": 1}
            }
        }"#,
    )
    .expect("config fixture");
    fs::write(
        data_dir.join("trades").join("EURUSD.json"),
        r#"[
            {"Time": "09:00", "Entered": true, "Canceled_After_Candles": 0,
             "TP_1RR_PW_WIN": true, "TP_1RR_PW_PIPS": 10, "SL_PW_PIPS": 5},
            {"Time": "09:10", "Entered": true, "Canceled_After_Candles": 0,
             "TP_1RR_PW_WIN": false, "TP_1RR_PW_PIPS": 8, "SL_PW_PIPS": 5}
        ]"#,
    )
    .expect("trades fixture");
}

fn cli() -> Command {
    if let Some(bin) = option_env!("CARGO_BIN_EXE_filtersmith_cli") {
        Command::new(bin)
    } else {
        let mut cmd = Command::new("cargo");
        cmd.args(["run", "-p", "filtersmith_cli", "--"]);
        cmd
    }
}

#[test]
fn cli_plans_and_runs_a_small_job() {
    let temp_dir = tempdir().expect("temp data dir");
    let data_dir = temp_dir.path();
    write_fixture(data_dir);

    let status = cli()
        .args([
            "plan",
            "--data-dir",
            data_dir.to_str().expect("data dir"),
            "--config",
            "1",
            "--no-file-log",
        ])
        .status()
        .expect("failed to spawn filtersmith_cli");
    assert!(status.success(), "plan exited with {status:?}");

    let output = data_dir.join("results.json");
    let status = cli()
        .args([
            "run",
            "--data-dir",
            data_dir.to_str().expect("data dir"),
            "--config",
            "1",
            "--instrument",
            "EURUSD",
            "--workers",
            "2",
            "--poll-ms",
            "20",
            "--output",
            output.to_str().expect("output"),
        ])
        .status()
        .expect("failed to spawn filtersmith_cli");
    assert!(status.success(), "run exited with {status:?}");

    let results: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&output).expect("results file")).expect("json");
    let rows = results.as_array().expect("result array");
    assert!(!rows.is_empty());
    assert_eq!(rows[0]["combination"]["TimeWindow"], "09:00-09:30");
    assert!(data_dir.join("filtersmith.log").exists());
    assert!(data_dir.join("filtersmith.duckdb").exists());
}

#[test]
fn cli_fails_on_missing_configuration() {
    let temp_dir = tempdir().expect("temp data dir");
    let status = cli()
        .args([
            "plan",
            "--data-dir",
            temp_dir.path().to_str().expect("data dir"),
            "--config",
            "42",
            "--no-file-log",
        ])
        .status()
        .expect("failed to spawn filtersmith_cli");
    assert!(!status.success());
}
