#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::io::{BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::process;

use agora::consensus::admm::{
    AdmmOutcome, IterationObserver, IterationReport, build_datasets, train,
};
use agora::consensus::artifacts::ArtifactWriter;
use agora::consensus::evaluate::mean_log_likelihood;
use agora::consensus::executor::RayonExecutor;
use agora::consensus::items::{
    ItemSettings, group_by_item, loglik_by_label, predict_items, split_model_key, train_items,
};
use agora::consensus::naive::train_naive;
use agora::consensus::partition::assign_partitions;
use agora::consensus::state::Lambda;
use agora::dataset::{Dataset, FeatureEncoding, Instance};
use agora::fitter::{FitOptions, PosteriorKind, PriorBundle, Solver, fit};
use agora::model::INTERCEPT_NAME;
use agora::shared::config::JobConfig;
use agora::shared::records::{
    InstanceRecord, ItemModelRecord, LoglikRecord, ModelRecord, PredictionRecord, RecordError, open_text,
    read_item_models, read_jsonl, read_lambda_overrides, read_models, read_pairs, write_jsonl,
    write_pairs,
};

type CliResult = Result<(), Box<dyn Error>>;

#[derive(Parser)]
#[command(
    name = "agora",
    about = "Distributed L1/L2-regularized logistic regression with ADMM consensus",
    long_about = "Trains logistic regression models over partitioned data by ADMM consensus, \
                 fits single Bayesian logistic blocks or per-item models, and scores models \
                 on held-out data."
)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an ADMM training job described by a TOML config
    #[command(about = "Train by ADMM consensus (outputs: final-model.jsonl and iteration artifacts)")]
    Train {
        /// Path to the job config (.toml)
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Worker threads for block fits (defaults to the config, then all cores)
        #[arg(long, value_name = "N")]
        threads: Option<usize>,
    },

    /// Fit one Bayesian logistic block
    #[command(about = "Fit a single block (outputs: key=value model)")]
    Fit(FitArgs),

    /// Score model records on held-out data
    #[command(about = "Mean held-out log-likelihood of every model in a file")]
    Evaluate {
        /// Model records (.jsonl or .jsonl.gz)
        #[arg(long, value_name = "PATH")]
        model: PathBuf,

        /// Instance records (.jsonl or .jsonl.gz)
        #[arg(long, value_name = "PATH")]
        data: PathBuf,

        /// Click replication factor the models were trained with
        #[arg(long, default_value = "1")]
        click_replicates: u32,

        /// Treat every feature value as 1, as binary-feature training did
        #[arg(long)]
        binary: bool,
    },

    /// Fit every block alone and average the fits per lambda
    #[command(about = "Naive divide-and-average training (outputs: models.jsonl, final-model.jsonl)")]
    TrainNaive {
        /// Path to the job config (.toml)
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Worker threads for block fits (defaults to the config, then all cores)
        #[arg(long, value_name = "N")]
        threads: Option<usize>,
    },

    /// Fit one model per item key over a lambda grid
    #[command(about = "Per-item training (outputs: item model records)")]
    TrainItems(ItemArgs),

    /// Score keyed records with their item's models
    #[command(about = "Per-item scoring and mean log-likelihood per grid label")]
    ScoreItems(ScoreArgs),

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum DataFormat {
    Libsvm,
    Jsonl,
}

#[derive(Clone, Copy, ValueEnum)]
enum SolverCli {
    TrustRegion,
    Bfgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum PosteriorCli {
    Diagonal,
    Full,
}

#[derive(Args)]
struct FitArgs {
    /// Training data
    #[arg(long, value_name = "PATH")]
    data: PathBuf,

    #[arg(long, value_enum, default_value_t = DataFormat::Libsvm)]
    format: DataFormat,

    /// Value of the synthetic intercept feature; 0 disables the intercept
    #[arg(long, default_value = "1")]
    bias: f64,

    /// Treat every feature value as 1
    #[arg(long)]
    binary: bool,

    /// Store binary feature indices in 16 bits
    #[arg(long, requires = "binary")]
    short_index: bool,

    /// Prior means as key=value lines
    #[arg(long, value_name = "PATH")]
    prior_mean: Option<PathBuf>,

    /// Default prior variance
    #[arg(long, default_value = "1")]
    prior_var: f64,

    /// Initial point as key=value lines
    #[arg(long, value_name = "PATH")]
    init: Option<PathBuf>,

    #[arg(long, default_value = "0.01")]
    epsilon: f64,

    #[arg(long, default_value = "1000")]
    max_iter: usize,

    #[arg(long, default_value = "1")]
    positive_weight: f64,

    #[arg(long, default_value = "1")]
    negative_weight: f64,

    #[arg(long, value_enum, default_value_t = SolverCli::TrustRegion)]
    solver: SolverCli,

    /// Also write posterior variances (.var) and, for `full`, covariances (.cov)
    #[arg(long, value_enum)]
    posterior: Option<PosteriorCli>,

    /// Output model path
    #[arg(long, value_name = "PATH")]
    output: PathBuf,
}

#[derive(Args)]
struct ItemArgs {
    /// Keyed instance records (.jsonl or .jsonl.gz); the key names the item
    #[arg(long, value_name = "PATH")]
    data: PathBuf,

    /// Intercept lambdas, crossed with the default lambdas
    #[arg(long, value_delimiter = ',', required = true)]
    intercept_lambdas: Vec<f64>,

    /// Lambdas of every other feature
    #[arg(long, value_delimiter = ',', required = true)]
    default_lambdas: Vec<f64>,

    /// Intercept prior mean per item as key=value lines
    #[arg(long, value_name = "PATH")]
    intercept_prior_means: Option<PathBuf>,

    /// Intercept prior mean of items missing from the map
    #[arg(long, default_value = "0", allow_negative_numbers = true)]
    intercept_default_prior_mean: f64,

    /// Per-feature lambdas as JSON lines of {name, term, lambda}
    #[arg(long, value_name = "PATH")]
    lambda_map: Option<PathBuf>,

    /// Also write the diagonal posterior variance of every model
    #[arg(long)]
    compute_var: bool,

    /// Treat every feature value as 1
    #[arg(long)]
    binary: bool,

    /// Store binary feature indices in 16 bits
    #[arg(long, requires = "binary")]
    short_index: bool,

    #[arg(long, default_value = "0.001")]
    epsilon: f64,

    #[arg(long, value_name = "N")]
    threads: Option<usize>,

    /// Output model records
    #[arg(long, value_name = "PATH")]
    output: PathBuf,
}

#[derive(Args)]
struct ScoreArgs {
    /// Item model records from train-items
    #[arg(long, value_name = "PATH")]
    models: PathBuf,

    /// Keyed instance records to score
    #[arg(long, value_name = "PATH")]
    data: PathBuf,

    /// Grid labels to score, such as 1:10 (defaults to every label in the models)
    #[arg(long = "grid", value_name = "LABEL")]
    grids: Vec<String>,

    /// Treat every feature value as 1
    #[arg(long)]
    binary: bool,

    /// Also write per-record scores
    #[arg(long, value_name = "PATH")]
    predictions: Option<PathBuf>,

    /// Also write the per-label log-likelihood records
    #[arg(long, value_name = "PATH")]
    summary: Option<PathBuf>,
}

fn main() {
    let Cli { verbose, command } = Cli::parse();
    init_logging(verbose);

    let result = match command {
        Some(Commands::Train { config, threads }) => run_train(&config, threads),
        Some(Commands::Fit(args)) => run_fit(args),
        Some(Commands::Evaluate {
            model,
            data,
            click_replicates,
            binary,
        }) => run_evaluate(&model, &data, click_replicates, binary),
        Some(Commands::TrainNaive { config, threads }) => run_train_naive(&config, threads),
        Some(Commands::TrainItems(args)) => run_train_items(args),
        Some(Commands::ScoreItems(args)) => run_score_items(args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(|e| Box::new(e) as Box<dyn Error>),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Shows ADMM progress on stderr and forwards every event to the artifact
/// writer.
struct ProgressObserver {
    bar: ProgressBar,
    artifacts: ArtifactWriter,
}

impl ProgressObserver {
    fn new(iterations: usize, artifacts: ArtifactWriter) -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(10)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(iterations as u64), draw_target);
        bar.set_style(
            ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        Self { bar, artifacts }
    }
}

impl IterationObserver for ProgressObserver {
    fn on_start(&mut self, lambda_rho: &[(Lambda, f64)]) -> Result<(), RecordError> {
        self.bar.set_message("fitting blocks");
        self.artifacts.on_start(lambda_rho)
    }

    fn on_iteration(&mut self, report: &IterationReport<'_>) -> Result<(), RecordError> {
        self.bar.set_position(report.state.iteration as u64);
        self.bar.set_message(format!(
            "maxdiff {:.2e}, tolerance {:.0e}",
            report.max_diff, report.tolerance
        ));
        self.artifacts.on_iteration(report)
    }

    fn on_finish(&mut self, outcome: &AdmmOutcome) -> Result<(), RecordError> {
        self.bar.finish_and_clear();
        self.artifacts.on_finish(outcome)
    }
}

fn read_instances(
    path: &Path,
    binary: bool,
) -> Result<Vec<(Option<String>, Instance)>, RecordError> {
    Ok(read_jsonl::<InstanceRecord>(path)?
        .into_iter()
        .map(|record| {
            let instance = record.to_instance(binary);
            (record.key, instance)
        })
        .collect())
}

fn run_train(config_path: &Path, threads: Option<usize>) -> CliResult {
    let config = JobConfig::load(config_path)?;
    let overrides = match &config.lambda_map_path {
        Some(path) => read_lambda_overrides(path)?,
        None => HashMap::new(),
    };
    let settings = config.admm_settings(overrides);
    settings.validate()?;

    let records = read_instances(&config.train_path, config.binary_features)?;
    log::info!(
        "Read {} training records from {}",
        records.len(),
        config.train_path.display()
    );
    let partitions = assign_partitions(
        records,
        config.num_blocks,
        config.partition_policy(),
        config.num_click_replicates,
    )?;
    let blocks = build_datasets(partitions, config.feature_encoding())?;

    let test: Option<Vec<Instance>> = match &config.test_path {
        Some(path) => Some(
            read_instances(path, config.binary_features)?
                .into_iter()
                .map(|(_, instance)| instance)
                .collect(),
        ),
        None => None,
    };

    let executor = RayonExecutor::new(threads.or(config.threads))?;
    log::info!("Fitting blocks on {} threads", executor.threads());
    let artifacts = ArtifactWriter::new(&config.output_path, config.remove_intermediate);
    let mut observer = ProgressObserver::new(settings.max_iterations, artifacts);

    let outcome = train(&settings, &blocks, test.as_deref(), &executor, &mut observer)?;
    println!(
        "{:?} after {} iterations; models written to {}",
        outcome.termination,
        outcome.termination.iterations(),
        config.output_path.display()
    );
    if let Some(best) = &outcome.best {
        println!(
            "Best held-out model: lambda {} at iteration {} (log-likelihood {:.6})",
            best.lambda, best.iteration, best.log_likelihood
        );
    }
    Ok(())
}

fn run_fit(args: FitArgs) -> CliResult {
    let mut dataset = if args.binary {
        Dataset::binary(args.bias, args.short_index)?
    } else {
        Dataset::new(args.bias)
    };
    match args.format {
        DataFormat::Libsvm => {
            for (index, line) in open_text(&args.data)?.lines().enumerate() {
                let line = line?;
                if !line.trim().is_empty() {
                    dataset.add_libsvm_line(&line, index + 1)?;
                }
            }
        }
        DataFormat::Jsonl => {
            for (_, instance) in read_instances(&args.data, args.binary)? {
                dataset.add_instance(&instance)?;
            }
        }
    }
    dataset.finish()?;

    let priors = PriorBundle {
        mean: match &args.prior_mean {
            Some(path) => read_pairs(path)?,
            None => HashMap::new(),
        },
        ..PriorBundle::isotropic(args.prior_var)
    };
    let initial = args.init.as_deref().map(read_pairs).transpose()?;
    let options = FitOptions {
        epsilon: args.epsilon,
        max_iterations: args.max_iter,
        positive_weight: args.positive_weight,
        negative_weight: args.negative_weight,
        solver: match args.solver {
            SolverCli::TrustRegion => Solver::TrustRegion,
            SolverCli::Bfgs => Solver::Bfgs,
        },
        posterior: match args.posterior {
            None => PosteriorKind::None,
            Some(PosteriorCli::Diagonal) => PosteriorKind::Diagonal,
            Some(PosteriorCli::Full) => PosteriorKind::Full,
        },
        ..FitOptions::default()
    };

    let result = fit(&dataset, initial.as_ref(), &priors, &options)?;
    log::info!(
        "Fit {} instances: {} iterations, converged = {}",
        dataset.n_instances(),
        result.report.iterations,
        result.report.converged
    );
    write_pairs(&args.output, result.model.to_map(INTERCEPT_NAME))?;
    if let Some(variance) = result.variance {
        write_pairs(&companion(&args.output, "var"), variance)?;
    }
    if let Some(covariance) = result.covariance {
        let pairs = covariance
            .into_iter()
            .map(|((row, col), value)| (format!("{row}\t{col}"), value));
        write_pairs(&companion(&args.output, "cov"), pairs)?;
    }
    Ok(())
}

fn companion(output: &Path, suffix: &str) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn run_evaluate(model_path: &Path, data_path: &Path, click_replicates: u32, binary: bool) -> CliResult {
    let instances: Vec<Instance> = read_instances(data_path, binary)?
        .into_iter()
        .map(|(_, instance)| instance)
        .collect();
    for (key, model) in read_models(model_path)? {
        match mean_log_likelihood(&model, &instances, click_replicates, usize::MAX) {
            Some(ll) => println!("{key}\t{ll:.6}"),
            None => println!("{key}\tNA"),
        }
    }
    Ok(())
}

fn run_train_naive(config_path: &Path, threads: Option<usize>) -> CliResult {
    let config = JobConfig::load(config_path)?;
    let overrides = match &config.lambda_map_path {
        Some(path) => read_lambda_overrides(path)?,
        None => HashMap::new(),
    };
    let settings = config.naive_settings(overrides);
    settings.validate()?;

    let records = read_instances(&config.train_path, config.binary_features)?;
    let partitions = assign_partitions(
        records,
        config.num_blocks,
        config.partition_policy(),
        config.num_click_replicates,
    )?;
    let blocks = build_datasets(partitions, config.feature_encoding())?;
    let executor = RayonExecutor::new(threads.or(config.threads))?;
    let outcome = train_naive(&settings, &blocks, &executor)?;

    let models: Vec<ModelRecord> = outcome
        .models
        .iter()
        .map(|(key, model)| ModelRecord::new(key.to_string(), model))
        .collect();
    write_jsonl(&config.output_path.join("models.jsonl"), &models)?;
    let means: Vec<ModelRecord> = outcome
        .means
        .iter()
        .map(|(lambda, model)| ModelRecord::new(lambda.label(), model))
        .collect();
    write_jsonl(&config.output_path.join("final-model.jsonl"), &means)?;
    println!(
        "{} block models ({} blocks skipped); averages written to {}",
        models.len(),
        outcome.skipped.len(),
        config.output_path.display()
    );
    Ok(())
}

fn run_train_items(args: ItemArgs) -> CliResult {
    let settings = ItemSettings {
        intercept_lambdas: args.intercept_lambdas,
        default_lambdas: args.default_lambdas,
        intercept_default_prior_mean: args.intercept_default_prior_mean,
        intercept_prior_means: match &args.intercept_prior_means {
            Some(path) => read_pairs(path)?,
            None => HashMap::new(),
        },
        lambda_overrides: match &args.lambda_map {
            Some(path) => read_lambda_overrides(path)?,
            None => HashMap::new(),
        },
        compute_variance: args.compute_var,
        encoding: match (args.binary, args.short_index) {
            (false, _) => FeatureEncoding::Real,
            (true, false) => FeatureEncoding::Binary,
            (true, true) => FeatureEncoding::BinaryShort,
        },
        fit: FitOptions {
            epsilon: args.epsilon,
            ..FitOptions::default()
        },
    };
    settings.validate()?;
    log::info!(
        "Loaded {} intercept prior means",
        settings.intercept_prior_means.len()
    );

    let items = group_by_item(read_instances(&args.data, args.binary)?)?;
    let executor = RayonExecutor::new(args.threads)?;
    let models = train_items(&settings, items, &executor)?;
    let records: Vec<ItemModelRecord> = models
        .iter()
        .map(|m| ItemModelRecord::new(m.key(), &m.model, m.variance.as_ref()))
        .collect();
    write_jsonl(&args.output, &records)?;
    println!("{} item models written to {}", records.len(), args.output.display());
    Ok(())
}

fn run_score_items(args: ScoreArgs) -> CliResult {
    let models = read_item_models(&args.models)?;
    let grids: Vec<String> = if args.grids.is_empty() {
        let labels: BTreeSet<&str> = models
            .keys()
            .filter_map(|key| split_model_key(key).map(|(grid, _)| grid))
            .collect();
        labels.into_iter().map(str::to_string).collect()
    } else {
        args.grids
    };
    let records = read_instances(&args.data, args.binary)?;
    let predictions = predict_items(&models, &grids, &records)?;
    if let Some(path) = &args.predictions {
        let rows: Vec<PredictionRecord> = predictions
            .iter()
            .map(|p| PredictionRecord {
                key: p.item.clone(),
                response: p.label,
                weight: p.weight,
                pred: p.scores.clone(),
            })
            .collect();
        write_jsonl(path, &rows)?;
    }
    let summaries: Vec<LoglikRecord> = loglik_by_label(&predictions)
        .into_iter()
        .map(|(grid, summary)| LoglikRecord {
            key: grid,
            test_loglik: summary.log_likelihood,
            count: summary.weight,
        })
        .collect();
    for summary in &summaries {
        println!("{}\t{:.6}\t{}", summary.key, summary.test_loglik, summary.count);
    }
    if let Some(path) = &args.summary {
        write_jsonl(path, &summaries)?;
    }
    Ok(())
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let release_tag = option_env!("AGORA_RELEASE_TAG");
    let build_timestamp: u64 = env!("AGORA_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("agora {version}");
    match release_tag {
        Some(tag) => println!("Release: {tag}"),
        None => println!("Release: development build"),
    }

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        if now > build_timestamp {
            println!("Built: {}", format_duration_ago(now - build_timestamp));
        } else {
            println!("Built: just now");
        }
    }
}
