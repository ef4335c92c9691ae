use std::net::SocketAddr;

use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use pyroscope::pyroscope::PyroscopeAgentRunning;
use pyroscope::PyroscopeAgent;
use pyroscope_pprofrs::{pprof_backend, PprofConfig};

use plate_stream::config::{Args, OcrBackend};
use plate_stream::controller::{Pipeline, StreamController};
use plate_stream::error::Result;
use plate_stream::plate_detection::bounding_box_render::BoundingBoxRender;
use plate_stream::plate_detection::dnn_ocr::{DnnOcrReader, PlateReader, TesseractCommand};
use plate_stream::plate_detection::object_detector::{ObjectDetector, PlateDetector};
use plate_stream::plate_detection::video_reader::DeviceCamera;
use plate_stream::results::{ResultRecord, ResultStore};
use plate_stream::server::{self, ServerConfig};

fn setup_pipeline(args: &Args) -> Pipeline {
    // Without a model the stream still runs, it just never finds plates.
    let detector: Option<Box<dyn PlateDetector>> =
        match ObjectDetector::plate_detector(&args.detector_config()) {
            Ok(detector) => Some(Box::new(detector)),
            Err(e) => {
                error!("{}; streaming without detection", e);
                None
            }
        };

    let ocr = args.ocr_config();
    let reader = match args.ocr_backend {
        OcrBackend::Library => match DnnOcrReader::new(&ocr) {
            Ok(engine) => PlateReader::new(Box::new(engine), args.binarize),
            Err(e) => {
                error!("{}; plates will not be read", e);
                PlateReader::unavailable(args.binarize)
            }
        },
        OcrBackend::Command => PlateReader::new(
            Box::new(TesseractCommand::new(args.tesseract_cmd.clone(), ocr)),
            args.binarize,
        ),
    };

    Pipeline {
        camera: Box::new(DeviceCamera::new(args.camera_settings())),
        detector,
        reader,
        render: BoundingBoxRender::default(),
    }
}

fn start_profiler(url: &str) -> Option<PyroscopeAgent<PyroscopeAgentRunning>> {
    let agent = PyroscopeAgent::builder(url, "plate_stream")
        .backend(pprof_backend(PprofConfig::new().sample_rate(100)))
        .build()
        .and_then(|agent| agent.start());
    match agent {
        Ok(agent) => {
            info!("Profiling to {}", url);
            Some(agent)
        }
        Err(e) => {
            warn!("Cannot start profiler: {}", e);
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn run(args: Args) -> Result<()> {
    args.validate()?;

    let profiler = args.pyroscope_url.as_deref().and_then(start_profiler);

    let record = ResultRecord::create(&args.results_file)?;
    info!("Recording results to {}", record.path().display());
    let controller = StreamController::new(
        setup_pipeline(&args),
        ResultStore::new(Some(record)),
        args.pipeline_config(),
    );
    if args.autostart {
        controller.start()?;
    }

    let (bound, serving) = server::bind(
        controller.clone(),
        ServerConfig {
            index_page: args.index_page.clone(),
            static_dir: args.static_dir.clone(),
        },
        SocketAddr::new(args.host, args.port),
        shutdown_signal(),
    )?;
    info!("Listening on http://{}", bound);
    serving.await;

    let stopping = controller.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.shutdown()).await {
        error!("Stream shutdown failed: {}", e);
    }

    if let Some(agent) = profiler {
        match agent.stop() {
            Ok(ready) => ready.shutdown(),
            Err(e) => warn!("Cannot stop profiler: {}", e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(e) = run(Args::parse()).await {
        error!("{}", e);
        std::process::exit(1);
    }
}
