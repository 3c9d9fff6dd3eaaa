use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_core::OnnxExtractor;
use rollcall_engine::{
    spawn_engine, AttendancePipeline, Config, DirectorySource, EngineHandle, FrameReport, FrameSource,
    SourceFactory,
};
use rollcall_hw::Camera;
use rollcall_store::{AttendanceLedger, EnrollImage, EnrollmentStore};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face recognition attendance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll reference images for a person
    Enroll {
        /// Person's name (e.g., "Alice Smith")
        #[arg(short, long)]
        name: String,
        /// Image files, one face each
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List enrolled people
    Faces {
        #[arg(long)]
        json: bool,
    },
    /// Recognize faces in an image and mark attendance
    Recognize {
        image: PathBuf,
        /// Write the annotated image here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Mark attendance continuously from a camera or a directory of frames
    Watch {
        /// V4L2 device (defaults to the configured camera)
        #[arg(long, conflicts_with = "dir")]
        device: Option<String>,
        /// Replay image files from this directory instead of a camera
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Show attendance records
    List {
        /// Only records for this date (YYYY-MM-DD)
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        json: bool,
    },
    /// Export the attendance ledger as CSV
    Export {
        /// Destination file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Enroll { name, files } => {
            let (images, unreadable) = EnrollImage::read_all(&files);
            let mut failures = unreadable;
            let (stored, name) = if images.is_empty() {
                (0, name)
            } else {
                let (engine, _) = start_engine(&config).await?;
                let outcome = engine.enroll(name, images).await?;
                failures.extend(outcome.failures);
                (outcome.stored.len(), outcome.name)
            };
            for failure in &failures {
                eprintln!("skipped {}: {}", failure.source, failure.reason);
            }
            if stored == 0 {
                bail!("no usable face found for {name}");
            }
            println!(
                "Enrolled {} ({} image{})",
                name,
                stored,
                if stored == 1 { "" } else { "s" }
            );
        }
        Commands::Faces { json } => {
            let (_, store) = start_engine(&config).await?;
            let registry = store.snapshot();
            if json {
                let entries: Vec<_> = registry
                    .identities()
                    .iter()
                    .map(|id| serde_json::json!({ "name": id.name, "references": id.references.len() }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if registry.is_empty() {
                println!("No faces enrolled");
            } else {
                for identity in registry.identities() {
                    println!("{:<30} {} reference(s)", identity.name, identity.references.len());
                }
            }
        }
        Commands::Recognize {
            image: path,
            output,
        } => {
            let bytes =
                std::fs::read(&path).with_context(|| format!("cannot read {}", path.display()))?;

            let (engine, _) = start_engine(&config).await?;
            let recognition = engine.recognize_encoded(bytes).await?;
            if recognition.face_count == 0 {
                println!("No faces detected");
            }
            for message in recognition.messages() {
                println!("{message}");
            }
            if let Some(out) = output.filter(|_| recognition.annotated.width() > 0) {
                recognition
                    .annotated
                    .save(&out)
                    .with_context(|| format!("cannot write {}", out.display()))?;
            }
        }
        Commands::Watch { device, dir } => {
            let open: SourceFactory = match dir {
                Some(dir) => Box::new(move || {
                    Ok(Box::new(DirectorySource::open(&dir)?) as Box<dyn FrameSource>)
                }),
                None => {
                    let device = device.unwrap_or_else(|| config.camera_device.clone());
                    let warmup = config.warmup_frames;
                    Box::new(move || {
                        let stream = Camera::open(&device)?.stream(warmup)?;
                        let camera = stream.camera();
                        tracing::info!(
                            device = %camera.device_path,
                            width = camera.width,
                            height = camera.height,
                            "camera streaming"
                        );
                        Ok(Box::new(stream) as Box<dyn FrameSource>)
                    })
                }
            };

            let (engine, _) = start_engine(&config).await?;
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("interrupt received, stopping after current frame");
                        cancel.cancel();
                    }
                }
            });

            let (tx, mut rx) = mpsc::unbounded_channel::<FrameReport>();
            let printer = tokio::spawn(async move {
                while let Some(report) = rx.recv().await {
                    for face in &report.faces {
                        println!("[frame {}] {}", report.frame, face.message);
                    }
                }
            });

            let summary = engine.watch(open, cancel, Some(tx)).await?;
            let _ = printer.await;
            println!(
                "{} frame(s), {} face(s), {} marked ({:?})",
                summary.frames, summary.faces, summary.marked, summary.stop
            );
        }
        Commands::List { date, json } => {
            let ledger = AttendanceLedger::open(&config.attendance_file)?;
            let records = match date {
                Some(date) => ledger.records_on(date),
                None => ledger.list(),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No attendance records");
            } else {
                for r in &records {
                    println!(
                        "{:<30} {} {}",
                        r.name,
                        r.date.format(rollcall_store::ledger::DATE_FORMAT),
                        r.time.format(rollcall_store::ledger::TIME_FORMAT)
                    );
                }
            }
        }
        Commands::Export { output } => {
            let ledger = AttendanceLedger::open(&config.attendance_file)?;
            match output {
                Some(path) => {
                    let file = std::fs::File::create(&path)
                        .with_context(|| format!("cannot create {}", path.display()))?;
                    ledger.export_csv(std::io::BufWriter::new(file))?;
                    println!("Exported {} record(s) to {}", ledger.len(), path.display());
                }
                None => {
                    let mut stdout = std::io::stdout().lock();
                    ledger.export_csv(&mut stdout)?;
                    stdout.flush()?;
                }
            }
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

/// Open the store and ledger, load the models, and start the engine with a
/// freshly loaded registry.
async fn start_engine(config: &Config) -> Result<(EngineHandle, Arc<EnrollmentStore>)> {
    let store = Arc::new(EnrollmentStore::open(&config.known_faces_dir)?);
    let ledger = Arc::new(AttendanceLedger::open(&config.attendance_file)?);

    let extractor = OnnxExtractor::load(&config.model_dir, config.intra_threads)
        .with_context(|| format!("cannot load models from {}", config.model_dir.display()))?;
    tracing::info!(dir = %config.model_dir.display(), "models loaded");

    let pipeline = AttendancePipeline::new(
        Arc::clone(&store),
        ledger,
        config.match_policy.matcher(),
        config.match_threshold,
    );
    let engine = spawn_engine(Box::new(extractor), pipeline)?;

    let report = engine.reload().await?;
    for skipped in &report.skipped {
        tracing::warn!(file = %skipped.source, reason = %skipped.reason, "reference image skipped");
    }
    Ok((engine, store))
}
