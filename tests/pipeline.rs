mod helpers;

use base64::Engine;
use image::{DynamicImage, GenericImageView, ImageFormat};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use headshot_processor::enhancement::{EnhancementConfig, Intensity, Upscale, Variant};
use headshot_processor::image_processing::color_correction::ColorSettings;
use headshot_processor::image_processing::raw_preview::SiblingJpeg;
use headshot_processor::image_processing::{CropEngine, FramingConstants};
use headshot_processor::pipeline::{Step, WORK_DIR_NAME};
use headshot_processor::queue::{EventSink, Job, JobStatus, QueueStore, Scheduler, SchedulerSettings};
use headshot_processor::remote::{Prediction, PredictionTransport, RemoteError, RemoteSettings};
use headshot_processor::utils::OutputKind;
use headshot_processor::{Pipeline, PipelineError};
use helpers::{touch, wait_for_status, write_photo};

#[derive(Debug, Clone)]
struct Submission {
    token: String,
    model: String,
    dimensions: (u32, u32),
}

/// Inference service stand-in: every model succeeds at once and returns its
/// input re-encoded as PNG. Background removal adds an alpha channel.
#[derive(Default)]
struct EchoTransport {
    submissions: Mutex<Vec<Submission>>,
    results: Mutex<HashMap<String, Vec<u8>>>,
    failing_model: Option<String>,
}

impl EchoTransport {
    fn failing(model: &str) -> Self {
        Self {
            failing_model: Some(model.to_string()),
            ..Self::default()
        }
    }

    fn models(&self) -> Vec<String> {
        self.submissions.lock().unwrap().iter().map(|s| s.model.clone()).collect()
    }

    fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }
}

fn decode_input(input: &Value) -> DynamicImage {
    let uri = input
        .get("image")
        .or_else(|| input.get("img"))
        .and_then(Value::as_str)
        .expect("request carries an image");
    let (_, payload) = uri.split_once(";base64,").unwrap();
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload).unwrap();
    image::load_from_memory(&bytes).unwrap()
}

fn encode_png(img: &DynamicImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

impl PredictionTransport for EchoTransport {
    async fn create(&self, token: &str, model: &str, input: Value) -> Result<Prediction, RemoteError> {
        let img = decode_input(&input);
        let id = {
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(Submission {
                token: token.to_string(),
                model: model.to_string(),
                dimensions: img.dimensions(),
            });
            format!("pred-{}", submissions.len())
        };

        if self.failing_model.as_deref() == Some(model) {
            return Ok(serde_json::from_value(json!({
                "id": id,
                "status": "failed",
                "error": "CUDA out of memory",
                "urls": { "get": format!("https://api.test/v1/predictions/{id}") }
            }))
            .unwrap());
        }

        let result = if model.ends_with("rembg") {
            let mut rgba = img.to_rgba8();
            let cutoff = rgba.width() / 4;
            for (x, _, pixel) in rgba.enumerate_pixels_mut() {
                if x < cutoff {
                    pixel[3] = 0;
                }
            }
            DynamicImage::ImageRgba8(rgba)
        } else {
            img
        };

        let url = format!("https://cdn.test/{id}.png");
        self.results.lock().unwrap().insert(url.clone(), encode_png(&result));
        Ok(serde_json::from_value(json!({
            "id": id,
            "status": "succeeded",
            "output": url,
            "urls": { "get": format!("https://api.test/v1/predictions/{id}") }
        }))
        .unwrap())
    }

    async fn get(&self, _token: &str, url: &str) -> Result<Prediction, RemoteError> {
        Err(RemoteError::Parse(format!("unexpected poll of {url}")))
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        self.results
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| RemoteError::Status {
                status: 404,
                body: url.to_string(),
            })
    }
}

fn fast_remote() -> RemoteSettings {
    RemoteSettings {
        min_interval_ms: 0,
        poll_interval_ms: 1,
        max_polls: 3,
        ..RemoteSettings::default()
    }
}

fn pipeline(transport: EchoTransport) -> Pipeline<EchoTransport> {
    let engine = CropEngine::new(FramingConstants::default(), ColorSettings::default());
    Pipeline::new(transport, fast_remote(), engine)
}

fn job_for(source: &Path, output: &Path) -> Job {
    Job::new(source, output, "20250101-001", "smith_jane_01")
}

#[tokio::test]
async fn test_full_job_writes_every_output_and_cleans_up() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_photo(dir.path(), "shoot.png", 600, 800);
    let output = dir.path().join("out");
    let pipeline = pipeline(EchoTransport::default());

    let config = EnhancementConfig {
        skin_smoothing: Intensity::Low,
        background_color: Some("#ffffff".to_string()),
        ..EnhancementConfig::default()
    };
    let outputs = pipeline
        .process(&job_for(&source, &output), &config, "r8_token", &EventSink::default())
        .await
        .unwrap();

    assert_eq!(outputs.len(), 6);
    for path in outputs.paths() {
        assert!(path.is_file(), "{} missing", path.display());
    }
    assert_eq!(
        outputs.get(Variant::Portrait, OutputKind::Jpeg).unwrap(),
        output.join("smith_jane_01_portrait.jpg")
    );
    assert_eq!(
        outputs.get(Variant::Square, OutputKind::Background).unwrap(),
        output.join("smith_jane_01_square_background.jpg")
    );

    let portrait = image::open(output.join("smith_jane_01_portrait.jpg")).unwrap();
    let (w, h) = portrait.dimensions();
    assert!((w as i64 * 5 - h as i64 * 4).abs() <= 5, "portrait is {}x{}", w, h);
    let square = image::open(output.join("smith_jane_01_square.jpg")).unwrap();
    assert_eq!(square.width(), square.height());

    let transparent = image::open(output.join("smith_jane_01_portrait_transparent.png")).unwrap();
    assert!(transparent.color().has_alpha());

    assert!(!output.join(WORK_DIR_NAME).exists());
    assert_eq!(
        pipeline.transport().models(),
        vec![
            "sczhou/codeformer",
            "tencentarc/gfpgan",
            "cjwbw/rembg",
            "sczhou/codeformer",
            "tencentarc/gfpgan",
            "cjwbw/rembg",
        ]
    );
}

#[tokio::test]
async fn test_remote_failure_names_step_and_variant() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_photo(dir.path(), "shoot.png", 600, 800);
    let output = dir.path().join("out");
    let pipeline = pipeline(EchoTransport::failing("cjwbw/rembg"));

    let err = pipeline
        .process(
            &job_for(&source, &output),
            &EnhancementConfig::default(),
            "r8_token",
            &EventSink::default(),
        )
        .await
        .unwrap_err();

    match &err {
        PipelineError::Step { step, variant, message } => {
            assert_eq!(*step, Step::BackgroundRemoval);
            assert_eq!(*variant, Variant::Portrait);
            assert!(message.contains("CUDA out of memory"), "{}", message);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().starts_with("Background Removal failed for portrait"));

    // Square never started, temp files are gone
    assert_eq!(pipeline.transport().models(), vec!["sczhou/codeformer", "cjwbw/rembg"]);
    assert!(!output.join(WORK_DIR_NAME).exists());
}

#[tokio::test]
async fn test_missing_source_fails_before_any_request() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(EchoTransport::default());
    let missing = dir.path().join("gone.jpg");

    let err = pipeline
        .process(
            &job_for(&missing, dir.path()),
            &EnhancementConfig::default(),
            "r8_token",
            &EventSink::default(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::SourceMissing(ref p) if p == &missing));
    assert!(pipeline.transport().models().is_empty());
}

#[tokio::test]
async fn test_raw_without_preview_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let shoot = dir.path().join("card").join("DCIM");
    std::fs::create_dir_all(&shoot).unwrap();
    let raw = touch(&shoot, "IMG_0042.CR2");
    let pipeline = pipeline(EchoTransport::default()).with_resolvers(vec![Box::new(SiblingJpeg)]);

    let err = pipeline
        .process(
            &job_for(&raw, &dir.path().join("out")),
            &EnhancementConfig::default(),
            "r8_token",
            &EventSink::default(),
        )
        .await
        .unwrap_err();

    match err {
        PipelineError::RawPreviewUnavailable { path, reasons } => {
            assert_eq!(path, raw);
            assert!(reasons.contains("sibling-jpeg"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(pipeline.transport().models().is_empty());
}

#[tokio::test]
async fn test_raw_uses_sibling_jpeg() {
    let dir = tempfile::tempdir().unwrap();
    let shoot = dir.path().join("card");
    std::fs::create_dir_all(&shoot).unwrap();
    let raw = touch(&shoot, "IMG_0042.CR2");
    write_photo(&shoot, "IMG_0042.JPG", 600, 800);
    let output = dir.path().join("out");
    let pipeline = pipeline(EchoTransport::default()).with_resolvers(vec![Box::new(SiblingJpeg)]);

    let config = EnhancementConfig {
        square: false,
        remove_background: false,
        ..EnhancementConfig::default()
    };
    let outputs = pipeline
        .process(&job_for(&raw, &output), &config, "r8_token", &EventSink::default())
        .await
        .unwrap();

    assert_eq!(outputs.len(), 1);
    assert!(output.join("smith_jane_01_portrait.jpg").is_file());
    assert!(shoot.join("IMG_0042.JPG").is_file());
}

#[tokio::test]
async fn test_upscale_input_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_photo(dir.path(), "shoot.png", 600, 800);
    let output = dir.path().join("out");
    let pipeline = pipeline(EchoTransport::default()).with_upscale_input_max(256);

    let config = EnhancementConfig {
        square: false,
        face_enhancement: Intensity::Off,
        upscale: Upscale::X2,
        remove_background: false,
        ..EnhancementConfig::default()
    };
    pipeline
        .process(&job_for(&source, &output), &config, "r8_token", &EventSink::default())
        .await
        .unwrap();

    let submissions = pipeline.transport().submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].model, "nightmareai/real-esrgan");
    let (w, h) = submissions[0].dimensions;
    assert!(w.max(h) <= 256, "upscaler got {}x{}", w, h);
}

#[tokio::test]
async fn test_scheduler_drives_pipeline_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_photo(dir.path(), "shoot.png", 600, 800);
    let output = dir.path().join("out");

    let store = QueueStore::new(dir.path().join("queue.json"));
    let scheduler = Scheduler::open(store, pipeline(EchoTransport::default()), SchedulerSettings::default()).unwrap();

    let logs = Arc::new(Mutex::new(Vec::new()));
    let logs_clone = logs.clone();
    scheduler.subscribe(Arc::new(move |event: &headshot_processor::QueueEvent| {
        if let headshot_processor::QueueEvent::Log { message, .. } = event {
            logs_clone.lock().unwrap().push(message.clone());
        }
    }));

    let id = scheduler.enqueue(&source, &output, "20250101-001", "smith_jane_01");
    scheduler.set_credential(Some("r8_secret".to_string()));
    scheduler.set_enabled(true);
    wait_for_status(&scheduler, |s| s.completed == 1).await;

    let job = scheduler.jobs().into_iter().find(|j| j.id == id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.outputs.len(), 4);
    for path in job.outputs.paths() {
        assert!(path.is_file());
    }

    let on_disk = std::fs::read_to_string(dir.path().join("queue.json")).unwrap();
    assert!(on_disk.contains("smith_jane_01_square_transparent.png"));

    let submissions = scheduler_transport_tokens(&scheduler);
    assert!(submissions.iter().all(|token| token == "r8_secret"));

    let logs = logs.lock().unwrap();
    assert!(logs.iter().any(|m| m.contains("20250101-001/smith_jane_01 portrait: Face Enhancement")));
    assert!(logs.iter().any(|m| m.starts_with("Completed 20250101-001/smith_jane_01")));
}

fn scheduler_transport_tokens(scheduler: &Scheduler<Pipeline<EchoTransport>>) -> Vec<String> {
    scheduler
        .runner()
        .transport()
        .submissions()
        .into_iter()
        .map(|s| s.token)
        .collect()
}

#[tokio::test]
async fn test_failed_job_keeps_outputs_already_written() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_photo(dir.path(), "shoot.png", 600, 800);
    let output = dir.path().join("out");

    let store = QueueStore::new(dir.path().join("queue.json"));
    let settings = SchedulerSettings {
        max_retries: 1,
        ..SchedulerSettings::default()
    };
    let scheduler = Scheduler::open(store, pipeline(EchoTransport::failing("cjwbw/rembg")), settings).unwrap();

    let id = scheduler.enqueue(&source, &output, "20250101-001", "smith_jane_01");
    scheduler.set_credential(Some("r8_token".to_string()));
    scheduler.set_enabled(true);
    wait_for_status(&scheduler, |s| s.failed == 1).await;

    // Portrait JPEG landed before background removal failed
    let portrait = output.join("smith_jane_01_portrait.jpg");
    assert!(portrait.is_file());
    let job = scheduler.jobs().into_iter().find(|j| j.id == id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.outputs.get(Variant::Portrait, OutputKind::Jpeg), Some(portrait.as_path()));
    assert_eq!(job.outputs.len(), 1);
    assert!(job.error.as_deref().unwrap_or_default().contains("CUDA out of memory"));

    let on_disk = std::fs::read_to_string(dir.path().join("queue.json")).unwrap();
    assert!(on_disk.contains("smith_jane_01_portrait.jpg"));
}

#[tokio::test]
async fn test_leftovers_from_interrupted_attempt_are_removed() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_photo(dir.path(), "shoot.png", 600, 800);
    let output = dir.path().join("out");
    let work = output.join(WORK_DIR_NAME);
    std::fs::create_dir_all(&work).unwrap();
    let stale = touch(&work, "smith_jane_01_portrait_face.png");
    let foreign = touch(&work, "keep.txt");

    let pipeline = pipeline(EchoTransport::default());
    pipeline
        .process(
            &job_for(&source, &output),
            &EnhancementConfig::default(),
            "r8_token",
            &EventSink::default(),
        )
        .await
        .unwrap();

    assert!(!stale.exists());
    assert!(foreign.exists());
}
