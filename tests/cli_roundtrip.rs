use std::fs;
use std::path::Path;
use std::process::Command;

use agora::dataset::Instance;
use agora::model::LinearModel;
use agora::shared::records::{
    InstanceRecord, ItemModelRecord, LambdaRho, LoglikRecord, ModelRecord, PredictionRecord,
    read_jsonl, read_models, read_pairs, write_jsonl,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn agora() -> Command {
    Command::new(env!("CARGO_BIN_EXE_agora"))
}

fn sample(rng: &mut StdRng) -> Instance {
    let x: f64 = rng.gen_range(-1.0..1.0);
    let clicked = rng.gen_range(0.0..1.0) < 1.0 / (1.0 + (-(2.0 * x - 0.5)).exp());
    let mut features = vec![("x".to_string(), x)];
    if rng.gen_range(0..3) == 0 {
        features.push(("site\u{1}news".to_string(), 1.0));
    }
    Instance::new(if clicked { 1 } else { -1 }, features)
}

fn write_instances(path: &Path, seed: u64, n: usize) {
    let mut rng = StdRng::seed_from_u64(seed);
    let records: Vec<InstanceRecord> = (0..n)
        .map(|_| InstanceRecord::from_instance(None, &sample(&mut rng)))
        .collect();
    write_jsonl(path, &records).expect("write instance records");
}

#[test]
fn train_writes_the_run_layout() {
    let dir = tempdir().expect("create temp dir");
    write_instances(&dir.path().join("train.jsonl.gz"), 1, 600);
    write_instances(&dir.path().join("test.jsonl"), 2, 200);
    fs::write(
        dir.path().join("job.toml"),
        r#"
train_path = "train.jsonl.gz"
test_path = "test.jsonl"
output_path = "run"
num_blocks = 3
lambdas = [1.0, 10.0]
num_iterations = 6
epsilon = 1e-12
remove_intermediate = true
initialize_boost_rate = 2.0
"#,
    )
    .expect("write config");

    let status = agora()
        .args(["train", "--config"])
        .arg(dir.path().join("job.toml"))
        .args(["--threads", "2"])
        .status()
        .expect("run agora train");
    assert!(status.success(), "train exited with {status}");

    let run = dir.path().join("run");
    let table: Vec<LambdaRho> = read_jsonl(&run.join("lambda-rho.jsonl")).expect("lambda-rho table");
    assert_eq!(
        table,
        vec![
            LambdaRho { lambda: 1.0, rho: 1.0 },
            LambdaRho { lambda: 10.0, rho: 1.0 },
        ]
    );

    let finals = read_models(&run.join("final-model.jsonl")).expect("final models");
    let keys: Vec<&str> = finals.iter().map(|(key, _)| key.as_str()).collect();
    assert_eq!(keys, vec!["1", "10"]);
    let light = finals[0].1.coefficient("x");
    let heavy = finals[1].1.coefficient("x");
    assert!(light > 0.0 && heavy > 0.0);
    assert!(heavy < light, "lambda 10 should shrink x harder: {heavy} vs {light}");

    assert!(run.join("best-model.jsonl").exists());
    let trajectory = fs::read_to_string(run.join("test-loglik.tsv")).expect("trajectory");
    let mut lines = trajectory.lines();
    assert_eq!(
        lines.next(),
        Some("iteration\tlambda\trho\ttolerance\tmax_diff\tlog_likelihood")
    );
    assert_eq!(lines.count(), 2 * 7);

    let iteration_dirs: Vec<String> = fs::read_dir(&run)
        .expect("list run dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("iter-"))
        .collect();
    assert_eq!(iteration_dirs, vec!["iter-6".to_string()]);

    let output = agora()
        .args(["evaluate", "--model"])
        .arg(run.join("final-model.jsonl"))
        .arg("--data")
        .arg(dir.path().join("test.jsonl"))
        .output()
        .expect("run agora evaluate");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let scores: Vec<(&str, f64)> = stdout
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .map(|(key, ll)| (key, ll.parse().expect("numeric log-likelihood")))
        .collect();
    assert_eq!(scores.len(), 2);
    assert!(scores.iter().all(|(_, ll)| *ll < 0.0 && *ll > -0.75));
}

#[test]
fn fit_reads_libsvm_and_writes_the_posterior() {
    let dir = tempdir().expect("create temp dir");
    let data = dir.path().join("block.svm");
    let mut rng = StdRng::seed_from_u64(3);
    let mut text = String::new();
    for _ in 0..300 {
        let a: f64 = rng.gen_range(-1.0..1.0);
        let clicked = rng.gen_range(0.0..1.0) < 1.0 / (1.0 + (-(1.5 * a)).exp());
        text.push_str(&format!("{} 1:{a} 2:1\n", if clicked { "+1" } else { "-1" }));
    }
    fs::write(&data, text).expect("write libsvm data");
    let model = dir.path().join("model.txt");

    let status = agora()
        .args(["fit", "--data"])
        .arg(&data)
        .args(["--prior-var", "4", "--posterior", "full", "--output"])
        .arg(&model)
        .status()
        .expect("run agora fit");
    assert!(status.success(), "fit exited with {status}");

    let coefficients = read_pairs(&model).expect("model pairs");
    assert!(coefficients["1"] > 0.5, "{coefficients:?}");
    assert!(coefficients.contains_key("(INTERCEPT)"));
    let variance = read_pairs(&dir.path().join("model.txt.var")).expect("variance pairs");
    assert!(variance.values().all(|v| *v > 0.0 && *v < 4.0));
    let covariance = fs::read_to_string(dir.path().join("model.txt.cov")).expect("covariance");
    assert!(covariance.lines().any(|line| line.starts_with("1\t2=")));
}

#[test]
fn bad_config_exits_with_an_error() {
    let dir = tempdir().expect("create temp dir");
    let config = dir.path().join("job.toml");
    fs::write(
        &config,
        "train_path = \"t.jsonl\"\noutput_path = \"o\"\nnum_blocks = 2\nlambdas = [1.0]\nrhos = [1.0, 2.0]\n",
    )
    .expect("write config");
    let output = agora()
        .args(["train", "--config"])
        .arg(&config)
        .output()
        .expect("run agora train");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error:"));
}

fn stdout_scores(output: &std::process::Output) -> Vec<(String, f64)> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let key = fields.next()?.to_string();
            let ll = fields.next()?.parse().ok()?;
            Some((key, ll))
        })
        .collect()
}

#[test]
fn evaluate_honours_binary_features() {
    let dir = tempdir().expect("create temp dir");
    let mut model = LinearModel::new(0.0);
    model.set_coefficient("x", 2.0);
    write_jsonl(&dir.path().join("model.jsonl"), &[ModelRecord::new("m", &model)]).expect("write model");
    let record = InstanceRecord::from_instance(None, &Instance::new(1, vec![("x".to_string(), 0.1)]));
    write_jsonl(&dir.path().join("test.jsonl"), &[record]).expect("write data");

    let run = |binary: bool| {
        let mut command = agora();
        command
            .args(["evaluate", "--model"])
            .arg(dir.path().join("model.jsonl"))
            .arg("--data")
            .arg(dir.path().join("test.jsonl"));
        if binary {
            command.arg("--binary");
        }
        let output = command.output().expect("run agora evaluate");
        assert!(output.status.success());
        stdout_scores(&output)
    };
    let real = run(false);
    let binary = run(true);
    assert_eq!(real.len(), 1);
    assert!((real[0].1 + (1.0 + (-0.2f64).exp()).ln()).abs() < 1e-5, "{real:?}");
    assert!((binary[0].1 + (1.0 + (-2.0f64).exp()).ln()).abs() < 1e-5, "{binary:?}");
}

#[test]
fn naive_training_writes_block_models_and_their_mean() {
    let dir = tempdir().expect("create temp dir");
    write_instances(&dir.path().join("train.jsonl"), 4, 400);
    fs::write(
        dir.path().join("job.toml"),
        r#"
train_path = "train.jsonl"
output_path = "naive"
num_blocks = 2
lambdas = [1.0, 100.0]
"#,
    )
    .expect("write config");

    let status = agora()
        .args(["train-naive", "--config"])
        .arg(dir.path().join("job.toml"))
        .args(["--threads", "2"])
        .status()
        .expect("run agora train-naive");
    assert!(status.success(), "train-naive exited with {status}");

    let blocks = read_models(&dir.path().join("naive/models.jsonl")).expect("block models");
    let keys: Vec<&str> = blocks.iter().map(|(key, _)| key.as_str()).collect();
    assert_eq!(keys, vec!["1#0", "1#1", "100#0", "100#1"]);
    let means = read_models(&dir.path().join("naive/final-model.jsonl")).expect("mean models");
    assert_eq!(means.len(), 2);
    let averaged = 0.5 * (blocks[0].1.coefficient("x") + blocks[1].1.coefficient("x"));
    assert!((means[0].1.coefficient("x") - averaged).abs() < 1e-9);
    assert!(means[1].1.coefficient("x").abs() < means[0].1.coefficient("x").abs());
}

#[test]
fn item_models_train_and_score_per_item() {
    let dir = tempdir().expect("create temp dir");
    let mut rng = StdRng::seed_from_u64(5);
    let keyed = |rng: &mut StdRng, n: usize| -> Vec<InstanceRecord> {
        (0..n)
            .map(|i| {
                let item = if i % 2 == 0 { "likely" } else { "rare" };
                let rate = if item == "likely" { 0.8 } else { 0.1 };
                let label = if rng.gen_range(0.0..1.0) < rate { 1 } else { -1 };
                let x: f64 = rng.gen_range(-1.0..1.0);
                InstanceRecord::from_instance(
                    Some(item.to_string()),
                    &Instance::new(label, vec![("x".to_string(), x)]),
                )
            })
            .collect()
    };
    write_jsonl(&dir.path().join("train.jsonl"), &keyed(&mut rng, 400)).expect("write train");
    write_jsonl(&dir.path().join("test.jsonl"), &keyed(&mut rng, 200)).expect("write test");
    fs::write(dir.path().join("means.txt"), "rare=-2\n").expect("write prior means");
    let models = dir.path().join("items.jsonl");

    let status = agora()
        .args(["train-items", "--data"])
        .arg(dir.path().join("train.jsonl"))
        .args(["--intercept-lambdas", "0.01,100", "--default-lambdas", "1", "--compute-var"])
        .arg("--intercept-prior-means")
        .arg(dir.path().join("means.txt"))
        .arg("--output")
        .arg(&models)
        .status()
        .expect("run agora train-items");
    assert!(status.success(), "train-items exited with {status}");

    let records: Vec<ItemModelRecord> = read_jsonl(&models).expect("item models");
    let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["0.01:1#likely", "100:1#likely", "0.01:1#rare", "100:1#rare"]);
    assert!(records.iter().all(|r| !r.posterior_var.is_empty()));

    let predictions = dir.path().join("pred.jsonl");
    let summary = dir.path().join("loglik.jsonl");
    let output = agora()
        .args(["score-items", "--models"])
        .arg(&models)
        .arg("--data")
        .arg(dir.path().join("test.jsonl"))
        .arg("--predictions")
        .arg(&predictions)
        .arg("--summary")
        .arg(&summary)
        .output()
        .expect("run agora score-items");
    assert!(output.status.success());

    let scores = stdout_scores(&output);
    let labels: Vec<&str> = scores.iter().map(|(label, _)| label.as_str()).collect();
    assert_eq!(labels, vec!["0.01:1", "100:1"]);
    assert!(scores[0].1 > scores[1].1, "per-item intercepts should help: {scores:?}");
    let rows: Vec<PredictionRecord> = read_jsonl(&predictions).expect("predictions");
    assert_eq!(rows.len(), 200);
    assert!(rows.iter().all(|row| row.pred.len() == 2));
    let totals: Vec<LoglikRecord> = read_jsonl(&summary).expect("summary");
    assert_eq!(totals[0].count, 200.0);
}
