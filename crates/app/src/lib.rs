use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use tessera_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig, EvictionMode,
    ENV_PLUGIN_CONFIG,
};
use tessera_core::geometry::compute_tiles_for;
use tessera_core::job::{OutputFormat, SourceMetadataRef};
use tessera_core::logging::{FilterChoice, LogFile, DEFAULT_KEEP_LOG_FILES, DEFAULT_LOG_FILTER};
use tessera_core::orchestrator::{Completion, InferenceOrchestrator, RequestOutput, StartRequest};
use tessera_core::reshape::{register_builtin_reshapers, ReshaperRegistry};
use tessera_core::store::RequestStore;

pub mod simulate;
pub mod writer;

use simulate::{stand_in_model, synthetic_source};
use writer::{JsonLabelWriter, SourceDescriptor};

#[derive(Parser)]
#[command(
    name = "tessera",
    about = "Tiled segmentation inference over images larger than the model window"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the tile placements for an image size as JSON.
    Plan(PlanArgs),
    /// Drive synthetic requests through tiling, a stand-in model and merging.
    Simulate(SimulateArgs),
}

#[derive(Args, Debug, Clone, Default)]
struct TilingOverrides {
    #[arg(long, help = "Crop size for both axes (overrides [tiling])")]
    crop: Option<usize>,
    #[arg(long, help = "Stride for both axes (overrides [tiling])")]
    stride: Option<usize>,
    #[arg(long, help = "Seam trim margin in pixels (overrides [tiling])")]
    delta: Option<usize>,
}

#[derive(Args)]
struct PlanArgs {
    #[arg(long)]
    height: usize,
    #[arg(long)]
    width: usize,
    #[command(flatten)]
    overrides: TilingOverrides,
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    #[arg(long, default_value_t = 4)]
    requests: usize,
    #[arg(long, default_value_t = 1, help = "Images per request")]
    batch: usize,
    #[arg(long, default_value_t = 512)]
    height: usize,
    #[arg(long, default_value_t = 512)]
    width: usize,
    #[arg(long, default_value_t = 3)]
    channels: usize,
    #[arg(long, default_value_t = 3)]
    classes: usize,
    #[arg(long, default_value = "single", help = "Reshape strategy (model family)")]
    model_family: String,
    #[arg(
        long = "reshape-param",
        value_name = "KEY=JSON",
        help = "Parameter for the reshape strategy (repeatable)"
    )]
    reshape_params: Vec<String>,
    #[arg(long, default_value = "path", value_parser = parse_output_format)]
    output_format: OutputFormat,
    #[command(flatten)]
    overrides: TilingOverrides,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(&resolved_data_dir, cli.verbose, cli.log_filter.as_deref());
    log_startup_metadata(&resolved_data_dir);

    let config = load_config(&resolved_data_dir)?;

    match cli.command {
        Commands::Plan(plan) => run_plan(config, plan),
        Commands::Simulate(args) => {
            let outputs = run_simulation(config, &resolved_data_dir, args).await?;
            for output in &outputs {
                println!("{}", serde_json::to_string(output)?);
            }
            Ok(())
        }
    }
}

fn init_logging(data_dir: &Path, verbose: u8, cli_log_filter: Option<&str>) {
    let rust_log = std::env::var("RUST_LOG").ok();
    let choice = FilterChoice::select(cli_log_filter, verbose, rust_log.as_deref());
    let mut rejected = Vec::new();

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter(&choice.console, &mut rejected));

    let log_file = LogFile::open(Some(data_dir), DEFAULT_KEEP_LOG_FILES);
    let log_dir = log_file.dir().map(Path::to_path_buf);
    let (file_layer, file_unavailable) = match log_file {
        LogFile::Rolling { appender, .. } => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(env_filter(&choice.file, &mut rejected));
            (Some(layer), None)
        }
        LogFile::Unavailable { reason, .. } => (None, Some(reason)),
    };

    if let Err(error) = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
    {
        eprintln!("tracing subscriber not installed ({error}); continuing without logs");
        return;
    }

    for (directives, error) in rejected {
        warn!(%directives, %error, fallback = DEFAULT_LOG_FILTER, "Ignoring invalid log filter");
    }
    match file_unavailable {
        Some(reason) => warn!(%reason, "Logging to console only"),
        None => debug!(
            log_dir = ?log_dir,
            source = ?choice.source,
            file_filter = %choice.file,
            "Writing daily log files"
        ),
    }
}

/// Parse `directives`, remembering the failure and using the default filter
/// when they are invalid. Warnings wait until the subscriber is installed.
fn env_filter(directives: &str, rejected: &mut Vec<(String, String)>) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|error| {
        rejected.push((directives.to_string(), error.to_string()));
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path) {
    info!(
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let cfg_path = config_path(data_dir);
    let mut config = match AppConfig::load_from_path(&cfg_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config.apply_plugin_config(std::env::var(ENV_PLUGIN_CONFIG).ok().as_deref())?;
    config
        .store
        .validate()
        .context("invalid [store] configuration")?;
    Ok(config)
}

fn parse_output_format(raw: &str) -> Result<OutputFormat, String> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "path" => Ok(OutputFormat::Path),
        "b64_json" => Ok(OutputFormat::B64Json),
        other => Err(format!(
            "unknown output format '{other}' (expected 'path' or 'b64_json')"
        )),
    }
}

fn apply_overrides(config: &mut AppConfig, overrides: &TilingOverrides) {
    if let Some(crop) = overrides.crop {
        config.tiling.crop = Some(crop);
        config.tiling.h_crop = None;
        config.tiling.w_crop = None;
    }
    if let Some(stride) = overrides.stride {
        config.tiling.stride = Some(stride);
    }
    if let Some(delta) = overrides.delta {
        config.tiling.delta = Some(delta);
    }
}

fn parse_reshape_params(raw: &[String]) -> Result<HashMap<String, serde_json::Value>> {
    let mut params = HashMap::new();
    for item in raw {
        let (key, value) = item
            .split_once('=')
            .with_context(|| format!("invalid --reshape-param '{item}' (expected KEY=JSON)"))?;
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        params.insert(key.trim().to_string(), value);
    }
    Ok(params)
}

fn run_plan(mut config: AppConfig, args: PlanArgs) -> Result<()> {
    apply_overrides(&mut config, &args.overrides);
    let params = config.tiling_parameters()?;
    let placements = compute_tiles_for(args.height, args.width, &params.crop_spec())
        .context("failed to compute tile placements")?;

    let report = serde_json::json!({
        "image_height": args.height,
        "image_width": args.width,
        "parameters": params,
        "tiles": placements.len(),
        "placements": placements,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_simulation(
    mut config: AppConfig,
    data_dir: &Path,
    args: SimulateArgs,
) -> Result<Vec<RequestOutput>> {
    if args.channels == 0 || args.classes == 0 || args.batch == 0 {
        bail!("channels, classes and batch must all be positive");
    }
    apply_overrides(&mut config, &args.overrides);
    let params = config.tiling_parameters()?;

    let mut registry = ReshaperRegistry::new();
    register_builtin_reshapers(&mut registry);
    let reshape_params = parse_reshape_params(&args.reshape_params)?;
    let reshaper = registry.create(&args.model_family, &reshape_params)?;

    let output_dir = resolve_relative_to(data_dir, &config.output.output_path);
    let writer = JsonLabelWriter::new(&output_dir)?;
    let policy = config
        .store
        .eviction_policy()
        .context("invalid [store] configuration")?;
    let store = Arc::new(RequestStore::new(policy));
    let orchestrator = Arc::new(InferenceOrchestrator::new(
        params,
        Arc::clone(&store),
        Arc::from(reshaper),
        Arc::new(writer),
    )?);

    let cancel = CancellationToken::new();
    let reaper = (config.store.eviction == EvictionMode::Ttl)
        .then(|| orchestrator.spawn_reaper(config.store.reap_interval(), cancel.clone()));

    let started = Instant::now();
    info!(
        requests = args.requests,
        batch = args.batch,
        height = args.height,
        width = args.width,
        output_dir = %output_dir.display(),
        "Starting simulated inference"
    );

    let mut tasks = Vec::with_capacity(args.requests);
    for seed in 0..args.requests {
        let orchestrator = Arc::clone(&orchestrator);
        let args = args.clone();
        tasks.push(tokio::spawn(async move {
            let request_id = uuid::Uuid::new_v4().to_string();
            let order = orchestrator.start(StartRequest {
                request_id: Some(request_id.clone()),
                source: synthetic_source(seed, args.batch, args.channels, args.height, args.width),
                output_format: args.output_format,
                source_metadata: SourceMetadataRef::new(SourceDescriptor {
                    filename: format!("synthetic_{seed:03}"),
                }),
            })?;

            let classes = args.classes;
            let outputs =
                tokio::task::spawn_blocking(move || stand_in_model(&order.prompts, classes))
                    .await
                    .context("stand-in model task panicked")?;

            let output = orchestrator.finalize(Completion {
                request_id: Some(request_id),
                outputs,
            })?;
            anyhow::Ok(output)
        }));
    }

    let mut outputs = Vec::with_capacity(tasks.len());
    let mut first_error = None;
    for task in tasks {
        match task.await.context("simulated request task panicked")? {
            Ok(output) => outputs.push(output),
            Err(error) => {
                warn!(error = %error, "Simulated request failed");
                first_error.get_or_insert(error);
            }
        }
    }

    cancel.cancel();
    if let Some(reaper) = reaper {
        reaper.await.context("reaper task panicked")?;
    }

    let leaked = orchestrator.outstanding();
    if !leaked.is_empty() {
        warn!(count = leaked.len(), "Tiling jobs left unfinalized");
    }
    info!(
        completed = outputs.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Simulated inference finished"
    );

    match first_error {
        Some(error) => Err(error),
        None => Ok(outputs),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use tempfile::tempdir;

    use super::*;

    fn small_args() -> SimulateArgs {
        SimulateArgs {
            requests: 3,
            batch: 2,
            height: 48,
            width: 40,
            channels: 3,
            classes: 3,
            model_family: "single".to_string(),
            reshape_params: Vec::new(),
            output_format: OutputFormat::Path,
            overrides: TilingOverrides {
                crop: Some(16),
                stride: Some(12),
                delta: Some(2),
            },
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_plan_with_overrides() {
        let cli = Cli::try_parse_from([
            "tessera", "plan", "--height", "512", "--width", "512", "--crop", "256", "--stride",
            "192",
        ])
        .expect("parse plan");
        match cli.command {
            Commands::Plan(plan) => {
                assert_eq!(plan.height, 512);
                assert_eq!(plan.overrides.crop, Some(256));
                assert_eq!(plan.overrides.stride, Some(192));
                assert_eq!(plan.overrides.delta, None);
            }
            Commands::Simulate(_) => panic!("expected plan"),
        }
    }

    #[test]
    fn output_format_parser_accepts_both_spellings() {
        assert_eq!(parse_output_format("path"), Ok(OutputFormat::Path));
        assert_eq!(parse_output_format("b64-json"), Ok(OutputFormat::B64Json));
        assert_eq!(parse_output_format("B64_JSON"), Ok(OutputFormat::B64Json));
        assert!(parse_output_format("geotiff").is_err());
    }

    #[test]
    fn crop_override_replaces_axis_crops() {
        let mut config = AppConfig::default();
        apply_overrides(
            &mut config,
            &TilingOverrides {
                crop: Some(256),
                stride: Some(192),
                delta: Some(32),
            },
        );
        let params = config.tiling_parameters().unwrap();
        assert_eq!((params.h_crop, params.w_crop), (256, 256));
        assert_eq!((params.h_stride, params.w_stride), (192, 192));
        assert_eq!(params.delta, 32);
    }

    #[test]
    fn reshape_params_accept_json_and_bare_strings() {
        let params = parse_reshape_params(&[
            "name=pixel_values".to_string(),
            r#"modalities=[{"name":"S2L2A","channels":2}]"#.to_string(),
        ])
        .unwrap();
        assert_eq!(params["name"], "pixel_values");
        assert!(params["modalities"].is_array());
        assert!(parse_reshape_params(&["novalue".to_string()]).is_err());
    }

    #[tokio::test]
    async fn simulation_finalizes_every_request() {
        let data_dir = tempdir().expect("tempdir");
        let outputs = run_simulation(AppConfig::default(), data_dir.path(), small_args())
            .await
            .expect("simulation");

        assert_eq!(outputs.len(), 3);
        for output in &outputs {
            assert_eq!(output.data.len(), 2);
            for location in &output.data {
                assert!(Path::new(location).exists(), "missing {location}");
            }
        }
    }

    #[tokio::test]
    async fn simulation_with_modality_split() {
        let data_dir = tempdir().expect("tempdir");
        let mut args = small_args();
        args.requests = 1;
        args.output_format = OutputFormat::B64Json;
        args.model_family = "modality_split".to_string();
        args.reshape_params = vec![
            r#"modalities=[{"name":"S2L2A","channels":2},{"name":"DEM","channels":1}]"#
                .to_string(),
        ];

        let outputs = run_simulation(AppConfig::default(), data_dir.path(), args)
            .await
            .expect("simulation");
        assert_eq!(outputs[0].data_format, OutputFormat::B64Json);
        assert!(!outputs[0].data[0].is_empty());
    }

    #[tokio::test]
    async fn simulation_rejects_zero_ttl() {
        let data_dir = tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.store.eviction = EvictionMode::Ttl;
        config.store.ttl_secs = 0;
        let err = run_simulation(config, data_dir.path(), small_args())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("ttl_secs must be positive"));
    }

    #[tokio::test]
    async fn simulation_rejects_image_smaller_than_crop() {
        let data_dir = tempdir().expect("tempdir");
        let mut args = small_args();
        args.height = 8;
        let err = run_simulation(AppConfig::default(), data_dir.path(), args)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("tile geometry error"));
    }
}
