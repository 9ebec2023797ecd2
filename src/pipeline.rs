use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum::IntoEnumIterator;
use strum_macros::Display;

use crate::enhancement::{ConfigError, EnhancementConfig, Variant};
use crate::image_processing::raw_preview::{default_resolvers, resolve_preview, PreviewResolver};
use crate::image_processing::{flatten_onto_color, prepare_jpeg, CropEngine, ImageAnalysis};
use crate::queue::{EventSink, Job, JobContext, JobRunner, LogLevel, OutputPaths, OutputSink};
use crate::remote::{PredictionTransport, RemoteClient, RemoteError, RemoteSettings};
use crate::utils::{is_raw_file, output_file_name, sanitize_base_name, work_file_name, OutputKind};

/// Longest edge of the copy handed to the upscaler
pub const DEFAULT_UPSCALE_INPUT_MAX: u32 = 1024;

/// Temp files live here, under the job's output folder
pub const WORK_DIR_NAME: &str = ".work";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "title_case")]
pub enum Step {
    Crop,
    FaceEnhancement,
    SkinSmoothing,
    Upscale,
    Save,
    BackgroundRemoval,
    BackgroundColor,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source file not found: {0}")]
    SourceMissing(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(
        "No JPEG available for RAW file {path}. Enable JPEG+RAW capture on the camera or install ImageMagick ({reasons})"
    )]
    RawPreviewUnavailable { path: PathBuf, reasons: String },

    #[error("{step} failed for {variant}: {message}")]
    Step {
        step: Step,
        variant: Variant,
        message: String,
    },

    #[error(transparent)]
    Local(#[from] anyhow::Error),

    #[error("Job task aborted: {0}")]
    Join(String),
}

impl PipelineError {
    fn step(step: Step, variant: Variant, message: impl Into<String>) -> Self {
        Self::Step {
            step,
            variant,
            message: message.into(),
        }
    }

    fn remote(step: Step, variant: Variant, err: RemoteError) -> Self {
        Self::step(step, variant, err.to_string())
    }
}

/// Files deleted when the guard goes out of scope, on success or failure
#[derive(Default)]
struct WorkFiles {
    paths: Vec<PathBuf>,
    dir: Option<PathBuf>,
}

impl WorkFiles {
    fn in_dir(dir: PathBuf) -> Self {
        Self {
            paths: Vec::new(),
            dir: Some(dir),
        }
    }

    fn track(&mut self, path: PathBuf) -> PathBuf {
        self.paths.push(path.clone());
        path
    }
}

impl Drop for WorkFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove temp file"),
            }
        }
        if let Some(dir) = &self.dir {
            // Only succeeds once empty
            let _ = std::fs::remove_dir(dir);
        }
    }
}

/// Remove temp files an interrupted attempt of this job left behind
///
/// Only one job runs at a time, so nothing else owns files with this prefix.
fn sweep_stale_work_files(work_dir: &Path, base_name: &str) {
    let prefixes: Vec<String> = Variant::iter().map(|v| format!("{}_{}_", base_name, v)).collect();
    let Ok(entries) = std::fs::read_dir(work_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !prefixes.iter().any(|p| name.starts_with(p.as_str())) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => tracing::debug!(file = name, "Removed stale temp file"),
            Err(e) => tracing::warn!(file = name, error = %e, "Failed to remove stale temp file"),
        }
    }
}

/// Runs CPU-bound image work off the async threads
async fn blocking<F, R>(step: Step, variant: Variant, f: F) -> Result<R, PipelineError>
where
    F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    R: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PipelineError::step(step, variant, format!("{:#}", e))),
        Err(e) => Err(PipelineError::Join(e.to_string())),
    }
}

/// Per-job view shared by every variant
struct JobRun<'a> {
    job: &'a Job,
    config: &'a EnhancementConfig,
    events: &'a EventSink,
    sink: &'a OutputSink,
    base_name: String,
    work_dir: PathBuf,
    working_image: PathBuf,
    analysis: ImageAnalysis,
}

impl JobRun<'_> {
    fn work_path(&self, variant: Variant, step: &str, extension: &str) -> PathBuf {
        self.work_dir
            .join(work_file_name(&self.base_name, variant, step, extension))
    }

    fn output_path(&self, variant: Variant, kind: OutputKind) -> PathBuf {
        self.job
            .output_folder
            .join(output_file_name(&self.base_name, variant, kind))
    }

    fn progress(&self, variant: Variant, step: Step) {
        tracing::info!(job_id = %self.job.id, %variant, %step, "Running step");
        self.events.log(
            LogLevel::Info,
            format!("{} {}: {}", self.job.label(), variant, step),
        );
    }
}

/// Crop, enhance and export every enabled variant of a job
pub struct Pipeline<T> {
    transport: T,
    remote: RemoteSettings,
    engine: Arc<CropEngine>,
    resolvers: Arc<Vec<Box<dyn PreviewResolver>>>,
    upscale_input_max: u32,
}

impl<T: PredictionTransport + 'static> Pipeline<T> {
    pub fn new(transport: T, remote: RemoteSettings, engine: CropEngine) -> Self {
        Self {
            transport,
            remote,
            engine: Arc::new(engine),
            resolvers: Arc::new(default_resolvers()),
            upscale_input_max: DEFAULT_UPSCALE_INPUT_MAX,
        }
    }

    pub fn with_resolvers(mut self, resolvers: Vec<Box<dyn PreviewResolver>>) -> Self {
        self.resolvers = Arc::new(resolvers);
        self
    }

    pub fn with_upscale_input_max(mut self, max_edge: u32) -> Self {
        self.upscale_input_max = max_edge;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn process(
        &self,
        job: &Job,
        config: &EnhancementConfig,
        credential: &str,
        events: &EventSink,
    ) -> Result<OutputPaths, PipelineError> {
        self.process_recording(job, config, credential, events, &OutputSink::default())
            .await
    }

    /// Like [`Pipeline::process`], handing `sink` the outputs written so far
    /// after every file that lands in the output folder
    pub async fn process_recording(
        &self,
        job: &Job,
        config: &EnhancementConfig,
        credential: &str,
        events: &EventSink,
        sink: &OutputSink,
    ) -> Result<OutputPaths, PipelineError> {
        let source = &job.source_path;
        if !tokio::fs::try_exists(source).await.unwrap_or(false) {
            return Err(PipelineError::SourceMissing(source.clone()));
        }
        config.validate()?;
        let variants = config.variants();

        let work_dir = job.output_folder.join(WORK_DIR_NAME);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("Failed to create {}", work_dir.display()))?;
        let base_name = sanitize_base_name(&job.base_name);
        sweep_stale_work_files(&work_dir, &base_name);
        let mut job_files = WorkFiles::in_dir(work_dir.clone());

        let working_image = self.resolve_working_image(source, &work_dir, &mut job_files).await?;

        let engine = self.engine.clone();
        let analyzed = working_image.clone();
        let analysis = match tokio::task::spawn_blocking(move || engine.analyze(&analyzed)).await {
            Ok(result) => result.map_err(|e| PipelineError::step(Step::Crop, variants[0], format!("{:#}", e)))?,
            Err(e) => return Err(PipelineError::Join(e.to_string())),
        };
        if analysis.geometry.fallback {
            events.log(
                LogLevel::Warning,
                format!("{}: face not found, using a centered crop", job.label()),
            );
        }

        let run = JobRun {
            job,
            config,
            events,
            sink,
            base_name,
            work_dir,
            working_image,
            analysis,
        };

        let mut client = RemoteClient::new(&self.transport, credential, &self.remote);
        let mut outputs = OutputPaths::default();
        for variant in variants {
            self.process_variant(&run, &mut client, variant, &mut outputs).await?;
        }

        drop(job_files);
        Ok(outputs)
    }

    async fn resolve_working_image(
        &self,
        source: &Path,
        work_dir: &Path,
        job_files: &mut WorkFiles,
    ) -> Result<PathBuf, PipelineError> {
        if !is_raw_file(source) {
            return Ok(source.to_path_buf());
        }

        let resolvers = self.resolvers.clone();
        let raw = source.to_path_buf();
        let dir = work_dir.to_path_buf();
        let resolved = tokio::task::spawn_blocking(move || resolve_preview(&resolvers, &raw, &dir))
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?;

        match resolved {
            Ok(path) => {
                tracing::info!(raw = %source.display(), preview = %path.display(), "Using JPEG for RAW source");
                if path.starts_with(work_dir) {
                    job_files.track(path.clone());
                }
                Ok(path)
            }
            Err(reasons) => Err(PipelineError::RawPreviewUnavailable {
                path: source.to_path_buf(),
                reasons: reasons.join("; "),
            }),
        }
    }

    async fn process_variant(
        &self,
        run: &JobRun<'_>,
        client: &mut RemoteClient<'_, T>,
        variant: Variant,
        outputs: &mut OutputPaths,
    ) -> Result<(), PipelineError> {
        let mut files = WorkFiles::default();

        run.progress(variant, Step::Crop);
        let crop_path = files.track(run.work_path(variant, "crop", "jpg"));
        {
            let engine = self.engine.clone();
            let source = run.working_image.clone();
            let analysis = run.analysis;
            let dest = crop_path.clone();
            blocking(Step::Crop, variant, move || {
                engine.render(&source, &analysis, variant, &dest).map(|_| ())
            })
            .await?;
        }
        let mut current = crop_path;

        if let Some(fidelity) = run.config.face_enhancement.fidelity() {
            run.progress(variant, Step::FaceEnhancement);
            let url = client
                .restore_face(&current, fidelity)
                .await
                .map_err(|e| PipelineError::remote(Step::FaceEnhancement, variant, e))?;
            current = self
                .fetch_step(run, client, &mut files, Step::FaceEnhancement, variant, "face", &url)
                .await?;
        }

        if let Some(weight) = run.config.skin_smoothing.smoothing_strength() {
            run.progress(variant, Step::SkinSmoothing);
            let url = client
                .smooth_skin(&current, weight)
                .await
                .map_err(|e| PipelineError::remote(Step::SkinSmoothing, variant, e))?;
            current = self
                .fetch_step(run, client, &mut files, Step::SkinSmoothing, variant, "skin", &url)
                .await?;
        }

        if let Some(factor) = run.config.upscale.factor() {
            run.progress(variant, Step::Upscale);
            let upscale_in = files.track(run.work_path(variant, "upscale_in", "jpg"));
            {
                let src = current.clone();
                let dest = upscale_in.clone();
                let max_edge = self.upscale_input_max;
                blocking(Step::Upscale, variant, move || prepare_jpeg(&src, &dest, max_edge)).await?;
            }
            let url = client
                .upscale(&upscale_in, factor)
                .await
                .map_err(|e| PipelineError::remote(Step::Upscale, variant, e))?;
            current = self
                .fetch_step(run, client, &mut files, Step::Upscale, variant, "upscale", &url)
                .await?;
        }

        let final_jpeg = run.output_path(variant, OutputKind::Jpeg);
        {
            let src = current.clone();
            let dest = final_jpeg.clone();
            blocking(Step::Save, variant, move || prepare_jpeg(&src, &dest, u32::MAX)).await?;
        }
        outputs.set(variant, OutputKind::Jpeg, final_jpeg.clone());
        run.sink.record(outputs);
        tracing::info!(job_id = %run.job.id, %variant, path = %final_jpeg.display(), "Saved variant");

        if run.config.remove_background {
            run.progress(variant, Step::BackgroundRemoval);
            let url = client
                .remove_background(&final_jpeg)
                .await
                .map_err(|e| PipelineError::remote(Step::BackgroundRemoval, variant, e))?;
            let png = run.output_path(variant, OutputKind::Transparent);
            client
                .download(&url, &png)
                .await
                .map_err(|e| PipelineError::remote(Step::BackgroundRemoval, variant, e))?;
            outputs.set(variant, OutputKind::Transparent, png.clone());
            run.sink.record(outputs);

            if let Some(color) = run.config.background_rgb() {
                run.progress(variant, Step::BackgroundColor);
                let dest = run.output_path(variant, OutputKind::Background);
                let target = dest.clone();
                blocking(Step::BackgroundColor, variant, move || flatten_onto_color(&png, color, &target)).await?;
                outputs.set(variant, OutputKind::Background, dest);
                run.sink.record(outputs);
            }
        }

        run.events.log(
            LogLevel::Success,
            format!("{} {}: done", run.job.label(), variant),
        );
        Ok(())
    }

    /// Download a remote result into a tracked temp file
    #[allow(clippy::too_many_arguments)]
    async fn fetch_step(
        &self,
        run: &JobRun<'_>,
        client: &RemoteClient<'_, T>,
        files: &mut WorkFiles,
        step: Step,
        variant: Variant,
        name: &str,
        url: &str,
    ) -> Result<PathBuf, PipelineError> {
        let dest = files.track(run.work_path(variant, name, result_extension(url)));
        client
            .download(url, &dest)
            .await
            .map_err(|e| PipelineError::remote(step, variant, e))?;
        Ok(dest)
    }
}

impl<T: PredictionTransport + 'static> JobRunner for Pipeline<T> {
    async fn run(&self, ctx: JobContext) -> Result<OutputPaths, PipelineError> {
        self.process_recording(&ctx.job, &ctx.config, &ctx.credential, &ctx.events, &ctx.outputs)
            .await
    }
}

/// File extension of a result URL, defaulting to png
fn result_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "jpg",
        Some(ext) if ext == "webp" => "webp",
        _ => "png",
    }
}
