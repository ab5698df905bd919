//! `lightscribe` — transcribe audio files from the command line.
//!
//! Prints the `TranscriptionResult` as JSON on stdout; logs go to stderr.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use lightscribe_core::inference::stub::StubLoader;
use lightscribe_core::registry;
use lightscribe_core::{
    AudioInput, ModelLoader, OnnxModelLoader, Task, Temperature, Transcriber,
};
use tracing::{info, warn};

use settings::{load_settings, normalize_model_name, save_settings, CliSettings};

const USAGE: &str = "\
Usage: lightscribe [options] <audio>...

Options:
  --model <id>            catalog name (tiny, small@q8, large-v3, ...) or model directory
  --language <code|auto>  decoding language (default: auto)
  --task <transcribe|translate>
  --batch-size <n>        windows decoded together
  --temperature <t>       fixed temperature (disables the fallback ladder)
  --prompt <text>         initial prompt for the first window
  --clip <start:end>      only transcribe this range in seconds (repeatable)
  --no-timestamps         plain text segments, one per window
  --no-condition          do not carry text between windows
  --seed <n>              reproducible sampling
  --models-dir <dir>      where downloaded models are kept
  --offline               never download model files
  --settings <file>       load settings JSON (flags override it)
  --save-settings <file>  write the effective settings and continue
  --stub                  deterministic stub model, no model files needed
  --progress              log one line per decoded batch
  --list-models           print the model catalog as JSON and exit
  -h, --help";

#[derive(Debug, Default)]
struct Args {
    audio: Vec<PathBuf>,
    settings_path: Option<PathBuf>,
    save_path: Option<PathBuf>,
    stub: bool,
    progress: bool,
    list_models: bool,
    overrides: Vec<(String, String)>,
    clips: Vec<(f32, f32)>,
    flags: Vec<&'static str>,
}

fn parse_args(mut it: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut args = Args::default();
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .with_context(|| format!("missing value for {name}"))
        };
        match arg.as_str() {
            "--model" | "--language" | "--task" | "--batch-size" | "--temperature"
            | "--prompt" | "--seed" | "--models-dir" => {
                let v = value(&arg)?;
                args.overrides.push((arg, v));
            }
            "--clip" => {
                let v = value("--clip")?;
                let (start, end) = v
                    .split_once(':')
                    .with_context(|| format!("--clip expects start:end, got {v}"))?;
                args.clips.push((
                    start.trim().parse().context("invalid --clip start")?,
                    end.trim().parse().context("invalid --clip end")?,
                ));
            }
            "--settings" => args.settings_path = Some(PathBuf::from(value("--settings")?)),
            "--save-settings" => args.save_path = Some(PathBuf::from(value("--save-settings")?)),
            "--no-timestamps" => args.flags.push("no-timestamps"),
            "--no-condition" => args.flags.push("no-condition"),
            "--offline" => args.flags.push("offline"),
            "--stub" => args.stub = true,
            "--progress" => args.progress = true,
            "--list-models" => args.list_models = true,
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other if other.starts_with("--") => bail!("unknown argument: {other}"),
            path => args.audio.push(PathBuf::from(path)),
        }
    }
    Ok(args)
}

/// Layer command-line values over the loaded settings.
fn apply_overrides(settings: &mut CliSettings, args: &Args) -> anyhow::Result<()> {
    let t = &mut settings.transcribe;
    for (flag, v) in &args.overrides {
        match flag.as_str() {
            "--model" => settings.model = normalize_model_name(v),
            "--language" => t.language = Some(v.clone()),
            "--task" => {
                t.task = match v.trim().to_ascii_lowercase().as_str() {
                    "transcribe" => Task::Transcribe,
                    "translate" => Task::Translate,
                    other => bail!("unknown task: {other}"),
                }
            }
            "--batch-size" => t.batch_size = v.parse().context("invalid --batch-size")?,
            "--temperature" => {
                t.temperature = Temperature::Fixed(v.parse().context("invalid --temperature")?)
            }
            "--prompt" => t.initial_prompt = Some(v.clone()),
            "--seed" => t.seed = Some(v.parse().context("invalid --seed")?),
            "--models-dir" => settings.models_dir = Some(PathBuf::from(v)),
            _ => {}
        }
    }
    if !args.clips.is_empty() {
        t.clip_timestamps = Some(args.clips.clone());
    }
    for flag in &args.flags {
        match *flag {
            "no-timestamps" => t.without_timestamps = true,
            "no-condition" => t.condition_on_previous_text = false,
            "offline" => settings.offline = true,
            _ => {}
        }
    }
    settings.normalize();
    Ok(())
}

fn build_loader(settings: &CliSettings, stub: bool) -> Arc<dyn ModelLoader> {
    if stub {
        return Arc::new(StubLoader);
    }
    let mut loader = OnnxModelLoader::new();
    if let Some(dir) = &settings.models_dir {
        loader = loader.with_models_dir(dir);
    }
    if settings.offline {
        loader = loader.offline();
    }
    info!(models_dir = %loader.models_dir().display(), "ONNX loader ready");
    Arc::new(loader)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lightscribe=info")),
        )
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    if args.list_models {
        println!("{}", serde_json::to_string_pretty(registry::catalog())?);
        return Ok(());
    }
    if args.audio.is_empty() {
        bail!("no audio file given\n\n{USAGE}");
    }

    let mut settings = match &args.settings_path {
        Some(path) => load_settings(path),
        None => CliSettings::default(),
    };
    apply_overrides(&mut settings, &args)?;
    settings
        .transcribe
        .validate()
        .context("invalid transcription options")?;
    if let Some(path) = &args.save_path {
        save_settings(path, &settings)
            .with_context(|| format!("saving settings to {}", path.display()))?;
        info!(path = %path.display(), "settings saved");
    }

    let model_id = if args.stub { "stub".to_string() } else { settings.model.clone() };
    let transcriber = Transcriber::new(
        settings.transcriber_config(),
        build_loader(&settings, args.stub),
    );

    let progress = args.progress.then(|| {
        let mut rx = transcriber.subscribe_progress();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(p) => info!(
                        batch = p.batch + 1,
                        total_batches = p.total_batches,
                        windows_done = p.windows_done,
                        total_windows = p.total_windows,
                        segments = p.segments.len(),
                        "progress"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "progress events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    let mut results = Vec::with_capacity(args.audio.len());
    for path in &args.audio {
        info!(file = %path.display(), model_id = %model_id, "transcribing");
        let result = transcriber
            .transcribe_async(AudioInput::FilePath(path.clone()), &model_id, settings.transcribe.clone())
            .await
            .with_context(|| format!("transcribing {}", path.display()))?;
        results.push(serde_json::json!({
            "file": path.display().to_string(),
            "result": result,
        }));
    }

    let output = if results.len() == 1 {
        results.remove(0)
    } else {
        serde_json::Value::Array(results)
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    if let Some(task) = progress {
        task.abort();
    }
    Ok(())
}
