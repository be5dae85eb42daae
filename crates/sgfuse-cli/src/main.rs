use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::{Context, IntoDiagnostic};

use sgfuse_exec::ReferenceExecutor;
use sgfuse_opt::{
    CalibMode, CalibrationDataset, FusionConfig, LayerFilter, OptLevel, PassManager,
    QuantizeConfig, QuantizeTarget,
};

/// sgfuse: subgraph fusion and post-training quantization
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Input model file
    model: PathBuf,

    /// Output path (default: <model>.sgfuse)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Skip operator fusion
    #[arg(long)]
    no_fuse: bool,

    /// Quantize after fusion (requires --calib-dir and --data-shape)
    #[arg(long, requires_all = ["calib_dir", "data_shape"])]
    quantize: bool,

    /// Directory of raw little-endian f32 `.bin` calibration batches
    #[arg(long)]
    calib_dir: Option<PathBuf>,

    /// Shape of one calibration batch, e.g. 32,3,224,224
    #[arg(long, value_delimiter = ',')]
    data_shape: Vec<usize>,

    /// Quantized integer type: int8, uint8, or auto
    #[arg(long, default_value = "auto")]
    quantized_dtype: QuantizeTarget,

    /// Calibration mode: naive or entropy
    #[arg(long, default_value = "naive", value_parser = parse_calib_mode)]
    calib_mode: CalibMode,

    /// Use at most this many calibration batches
    #[arg(long)]
    num_calib_examples: Option<usize>,

    /// Node to keep in floating point (repeatable)
    #[arg(long = "exclude", value_name = "NAME")]
    excluded: Vec<String>,

    /// Only calibrate tensors whose name ends with this suffix
    #[arg(long)]
    calib_layer_suffix: Option<String>,

    /// Let quantized fully-connected layers emit float directly
    #[arg(long)]
    fc_float_output: bool,

    /// Dump the rewritten graph to stderr
    #[arg(long)]
    emit_ir: bool,

    /// Rewrite without writing the output model
    #[arg(long)]
    dry_run: bool,
}

fn parse_calib_mode(s: &str) -> Result<CalibMode, String> {
    CalibMode::from_str_name(s)
        .ok_or_else(|| format!("invalid calibration mode '{s}', expected naive or entropy"))
}

impl Cli {
    fn quantize_config(&self) -> QuantizeConfig {
        QuantizeConfig {
            target: self.quantized_dtype,
            calib_mode: self.calib_mode,
            num_calib_examples: self.num_calib_examples,
            excluded_names: self.excluded.iter().cloned().collect::<BTreeSet<_>>(),
            calib_layer: match &self.calib_layer_suffix {
                Some(suffix) => LayerFilter::suffix(suffix.clone()),
                None => LayerFilter::all(),
            },
            fc_float_output: self.fc_float_output,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    // 1. Load the model.
    let (mut graph, params) = sgfuse_proto::load_model(&cli.model)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to load {}", cli.model.display()))?;

    // 2. Fuse.
    let level = if cli.no_fuse { OptLevel::O0 } else { OptLevel::O1 };
    PassManager::for_level(level, FusionConfig::default())
        .run(&mut graph)
        .into_diagnostic()
        .wrap_err("fusion failed")?;

    // 3. Quantize.
    let (graph, params) = match &cli.calib_dir {
        Some(dir) if cli.quantize => {
            let input = graph
                .inputs
                .first()
                .map(|&e| graph.edge_name(e).to_string())
                .ok_or_else(|| miette::miette!("model has no data input to calibrate"))?;
            let dataset = CalibrationDataset::load_from_dir(dir, &input, &cli.data_shape)
                .into_diagnostic()
                .wrap_err("failed to load calibration data")?;
            let model = sgfuse_opt::quantize_model(
                &graph,
                &params,
                &ReferenceExecutor,
                &dataset,
                &cli.quantize_config(),
            )
            .into_diagnostic()
            .wrap_err("quantization failed")?;
            (model.graph, model.params)
        }
        _ => (graph, params),
    };

    // 4. Optionally dump the graph to stderr.
    if cli.emit_ir {
        eprintln!("{}", sgfuse_ir::dump_graph(&graph));
    }

    // 5. Dry-run: stop here.
    if cli.dry_run {
        return Ok(());
    }

    // 6. Write output.
    let output = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.model.with_extension("sgfuse"));
    sgfuse_proto::save_model(&output, &graph, &params)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write {}", output.display()))?;
    Ok(())
}
