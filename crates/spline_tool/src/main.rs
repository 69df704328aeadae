use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mipmap::{MipSize, MipmapState, MipmapStats, MipmapStore, MipmapStoreConfig, TaskPriority};
use serde::{Deserialize, Serialize};
use spline::{
    BezierNode, BezierSplineBuilder, BezierSplineBuilderConfig, Point3, Rect, tessellate,
};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Fit recorded strokes and inspect mipmap caches")]
struct Arguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fit a recorded stroke into a Bezier spline.
    Fit(FitArguments),
    /// Build and inspect the mipmap chain of an image.
    Mipmap(MipmapArguments),
}

#[derive(Args)]
struct FitArguments {
    /// JSON array of `{x, y, radius}` samples.
    #[arg(long, short = 'i', value_parser)]
    input: PathBuf,
    /// Output file. Prints to stdout when omitted.
    #[arg(long, short = 'o', value_parser)]
    output: Option<PathBuf>,
    /// Pretty-print JSON output.
    #[arg(long)]
    pretty: bool,
    /// JSON file with fit settings.
    #[arg(long, value_parser)]
    config: Option<PathBuf>,
    /// Also emit a polyline flattened to this tolerance.
    #[arg(long)]
    tessellate: Option<f32>,
}

#[derive(Args)]
struct MipmapArguments {
    /// Source image.
    #[arg(long, value_parser)]
    image: PathBuf,
    /// Disk cache root.
    #[arg(long, value_parser)]
    cache_dir: Option<PathBuf>,
    /// Level to load.
    #[arg(long, default_value_t = 0)]
    level: usize,
    /// Seconds to wait for the level.
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct StrokeSample {
    x: f32,
    y: f32,
    radius: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct FitSettings {
    noise_threshold: f32,
    max_fit_error_sqr: f32,
    fit_error_acc: f32,
    max_stroke_radius_rate: f32,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            noise_threshold: 1.0,
            max_fit_error_sqr: 0.25,
            fit_error_acc: 0.0,
            max_stroke_radius_rate: BezierSplineBuilderConfig::default().max_stroke_radius_rate,
        }
    }
}

#[derive(Debug, Serialize)]
struct FitReport {
    settings: FitSettings,
    sample_count: usize,
    filtered_sample_count: usize,
    /// Stable node count after each sample.
    stable_node_counts: Vec<usize>,
    nodes: Vec<BezierNode>,
    bounds: Option<Rect>,
    polyline: Option<Vec<Point3>>,
}

#[derive(Debug, Serialize)]
struct MipmapReport {
    path: PathBuf,
    state: String,
    levels: Vec<MipSize>,
    requested_level: usize,
    loaded: bool,
    stats: MipmapStats,
    resident_bytes: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let arguments = Arguments::parse();
    match arguments.command {
        Command::Fit(arguments) => run_fit(arguments),
        Command::Mipmap(arguments) => run_mipmap(arguments),
    }
}

fn run_fit(arguments: FitArguments) -> Result<()> {
    let source = fs::read_to_string(&arguments.input)
        .with_context(|| format!("read stroke {}", arguments.input.display()))?;
    let samples: Vec<StrokeSample> = serde_json::from_str(&source)
        .with_context(|| format!("parse stroke {}", arguments.input.display()))?;
    let settings = match &arguments.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("read fit settings {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parse fit settings {}", path.display()))?
        }
        None => FitSettings::default(),
    };
    if let Some(tolerance) = arguments.tessellate {
        if !(tolerance.is_finite() && tolerance > 0.0) {
            return Err(anyhow::anyhow!("tessellation tolerance must be positive"));
        }
    }

    let report = fit_samples(&samples, settings, arguments.tessellate);
    tracing::info!(
        samples = report.sample_count,
        nodes = report.nodes.len(),
        "fitted stroke"
    );
    write_json(&report, arguments.output.as_ref(), arguments.pretty)
}

fn fit_samples(
    samples: &[StrokeSample],
    settings: FitSettings,
    tessellation_tolerance: Option<f32>,
) -> FitReport {
    let mut builder = BezierSplineBuilder::new(BezierSplineBuilderConfig {
        max_stroke_radius_rate: settings.max_stroke_radius_rate,
    });
    let stable_node_counts = samples
        .iter()
        .map(|sample| {
            builder.add_point(
                Point3::new(sample.x, sample.y, sample.radius),
                settings.noise_threshold,
                settings.max_fit_error_sqr,
                settings.fit_error_acc,
            )
        })
        .collect();
    let spline = builder.spline();
    let bounds = spline.bounds();
    let polyline = tessellation_tolerance.map(|tolerance| {
        let mut points = Vec::new();
        tessellate(spline, tolerance * tolerance, &mut points);
        points
    });
    FitReport {
        settings,
        sample_count: samples.len(),
        filtered_sample_count: builder.input_points().len(),
        stable_node_counts,
        nodes: spline.nodes().to_vec(),
        bounds: (!bounds.is_empty()).then_some(bounds),
        polyline,
    }
}

fn run_mipmap(arguments: MipmapArguments) -> Result<()> {
    let mut config = MipmapStoreConfig::default();
    if let Some(cache_dir) = arguments.cache_dir {
        config.cache_dir = cache_dir;
    }
    let store = MipmapStore::new(config).context("start mipmap store")?;
    let mipmap = store
        .acquire(&arguments.image, false)
        .with_context(|| format!("open {}", arguments.image.display()))?;
    let timeout = Duration::from_secs(arguments.timeout);

    let state = mipmap.wait_for_header(timeout);
    if state == MipmapState::Error {
        return Err(anyhow::anyhow!(
            "{} could not be read",
            arguments.image.display()
        ));
    }
    let max_level = mipmap
        .max_level()
        .ok_or_else(|| anyhow::anyhow!("timed out reading {}", arguments.image.display()))?;
    if arguments.level > max_level {
        return Err(anyhow::anyhow!(
            "level {} is out of range, the coarsest level is {max_level}",
            arguments.level
        ));
    }

    let loaded = mipmap.wait_for_level(arguments.level, TaskPriority::HIGH, timeout);
    if !loaded {
        tracing::warn!(level = arguments.level, "level did not become ready");
    }
    store.wait_until_idle(timeout);

    let report = MipmapReport {
        path: mipmap.path().to_path_buf(),
        state: format!("{:?}", mipmap.state()),
        levels: (0..=max_level)
            .filter_map(|level| mipmap.mipmap_size(level))
            .collect(),
        requested_level: arguments.level,
        loaded,
        stats: store.stats(),
        resident_bytes: store.resident_bytes(),
    };
    write_json(&report, None, true)
}

fn write_json<T: Serialize>(value: &T, output: Option<&PathBuf>, pretty: bool) -> Result<()> {
    let content = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    match output {
        Some(path) => {
            fs::write(path, content).with_context(|| format!("write {}", path.display()))?
        }
        None => println!("{content}"),
    }
    Ok(())
}
