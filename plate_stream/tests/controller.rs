mod common;

use std::fs;
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use tokio::sync::broadcast::error::RecvError;

use plate_stream::controller::{
    Pipeline, StartOutcome, StopOutcome, StreamController, StreamState,
};
use plate_stream::mjpeg::StreamPayload;
use plate_stream::plate_detection::bounding_box_render::BoundingBoxRender;
use plate_stream::plate_detection::dnn_ocr::PlateReader;
use plate_stream::results::{ResultRecord, ResultStore, NO_DETECTION};

use common::{controller, test_config, wait_until, BrightTextOcr, FakeCamera, Feed};

fn gated() -> (Feed, mpsc::Sender<bool>) {
    let (tx, rx) = mpsc::channel();
    (Feed::Gated(Arc::new(Mutex::new(rx))), tx)
}

fn frames(controller: &StreamController) -> u64 {
    controller.status().unwrap().frames
}

#[test]
fn starts_stopped_with_sentinel_result() {
    let (controller, stats) = controller(Feed::Constant(true));

    let status = controller.status().unwrap();
    assert_eq!(status.state, StreamState::Stopped);
    assert_eq!(status.generation, 0);
    assert!(!status.active);
    assert!(status.detector_loaded);
    assert_eq!(controller.results().unwrap(), vec![NO_DETECTION.to_string()]);
    assert!(controller.subscribe().unwrap().is_none());
    assert_eq!(controller.stop().unwrap(), StopOutcome::AlreadyStopped);
    assert_eq!(stats.opens(), 0);
}

#[test]
fn start_and_stop_are_idempotent() {
    let (controller, stats) = controller(Feed::Constant(false));

    assert_eq!(
        controller.start().unwrap(),
        StartOutcome::Started { generation: 1 }
    );
    assert_eq!(controller.start().unwrap(), StartOutcome::AlreadyRunning);
    assert_eq!(controller.status().unwrap().generation, 1);
    assert!(wait_until(|| frames(&controller) > 0));

    assert_eq!(controller.stop().unwrap(), StopOutcome::Stopped);
    assert_eq!(controller.stop().unwrap(), StopOutcome::AlreadyStopped);
    let status = controller.status().unwrap();
    assert_eq!(status.state, StreamState::Stopped);
    assert!(!status.active);

    assert!(wait_until(|| stats.releases() == 1));
    assert_eq!(stats.opens(), 1);
}

#[test]
fn result_follows_each_frame() {
    let (feed, tx) = gated();
    let (controller, _stats) = controller(feed);
    controller.start().unwrap();

    tx.send(true).unwrap();
    assert!(wait_until(|| frames(&controller) == 1));
    assert_eq!(controller.results().unwrap(), vec!["ABC1234".to_string()]);
    assert_eq!(
        controller.status().unwrap().latest_plate.as_deref(),
        Some("ABC1234")
    );

    tx.send(false).unwrap();
    assert!(wait_until(|| frames(&controller) == 2));
    assert_eq!(controller.results().unwrap(), vec![NO_DETECTION.to_string()]);

    controller.shutdown();
}

#[test]
fn restart_clears_previous_result() {
    let (feed, tx) = gated();
    let (controller, stats) = controller(feed);
    controller.start().unwrap();
    tx.send(true).unwrap();
    assert!(wait_until(|| frames(&controller) == 1));
    controller.stop().unwrap();
    assert!(wait_until(|| stats.releases() == 1));

    // The last plate survives a stop but not the next start.
    assert_eq!(controller.results().unwrap(), vec!["ABC1234".to_string()]);
    controller.start().unwrap();
    assert_eq!(controller.results().unwrap(), vec![NO_DETECTION.to_string()]);

    controller.shutdown();
}

#[test]
fn concurrent_starts_run_a_single_loop() {
    let (controller, stats) = controller(Feed::Constant(true));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let controller = controller.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                controller.start().unwrap()
            })
        })
        .collect();
    let outcomes: Vec<StartOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let started = outcomes
        .iter()
        .filter(|o| matches!(o, StartOutcome::Started { .. }))
        .count();
    assert_eq!(started, 1);
    assert!(wait_until(|| frames(&controller) > 2));
    assert_eq!(stats.opens(), 1);

    controller.shutdown();
    assert_eq!(stats.releases(), 1);
    assert_eq!(stats.max_open(), 1);
}

#[test]
fn rapid_restarts_never_open_two_devices() {
    let (controller, stats) = controller(Feed::Constant(true));

    for _ in 0..5 {
        controller.start().unwrap();
        controller.stop().unwrap();
    }
    controller.start().unwrap();
    assert!(wait_until(|| frames(&controller) > 0));
    controller.shutdown();

    assert_eq!(stats.max_open(), 1);
    assert_eq!(stats.opens(), stats.releases());
    assert_eq!(controller.status().unwrap().generation, 6);
}

#[test]
fn missing_camera_ends_the_run() {
    let (controller, stats) = controller(Feed::Missing);

    controller.start().unwrap();
    assert!(wait_until(|| {
        controller.status().unwrap().state == StreamState::Stopped
    }));
    assert_eq!(stats.opens(), 0);

    // A failed run does not block the next start.
    assert_eq!(
        controller.start().unwrap(),
        StartOutcome::Started { generation: 2 }
    );
    controller.shutdown();
}

#[test]
fn encode_failure_ends_the_run_and_releases_camera() {
    let (controller, stats) = controller(Feed::Empty);

    controller.start().unwrap();
    assert!(wait_until(|| {
        controller.status().unwrap().state == StreamState::Stopped
    }));
    assert!(wait_until(|| stats.releases() == 1));
    assert_eq!(stats.opens(), 1);

    // The released device can be opened again by the next run.
    assert_eq!(
        controller.start().unwrap(),
        StartOutcome::Started { generation: 2 }
    );
    assert!(wait_until(|| stats.opens() == 2));
    assert!(wait_until(|| stats.releases() == 2));
    assert_eq!(stats.max_open(), 1);
    controller.shutdown();
}

#[test]
fn annotation_failure_keeps_the_plate() {
    let (camera, _stats) = FakeCamera::new(Feed::Constant(true));
    let pipeline = Pipeline {
        camera: Box::new(camera),
        detector: Some(Box::new(common::WhiteBoxDetector)),
        reader: PlateReader::new(Box::new(BrightTextOcr), false),
        // Beyond the thickest line OpenCV will draw.
        render: BoundingBoxRender {
            thickness: 40_000,
            ..BoundingBoxRender::default()
        },
    };
    let controller = StreamController::new(pipeline, ResultStore::default(), test_config());

    controller.start().unwrap();
    assert!(wait_until(|| frames(&controller) > 0));
    assert_eq!(controller.results().unwrap(), vec!["ABC1234".to_string()]);
    assert_eq!(controller.status().unwrap().state, StreamState::Running);
    controller.shutdown();
}

#[test]
fn read_failures_are_retried() {
    let (mut camera, stats) = FakeCamera::new(Feed::Constant(true));
    camera.failing_reads = 3;
    let controller = StreamController::new(
        common::pipeline(camera),
        ResultStore::default(),
        test_config(),
    );

    controller.start().unwrap();
    assert!(wait_until(|| frames(&controller) > 0));
    assert!(stats.reads() >= 4);
    assert_eq!(controller.status().unwrap().state, StreamState::Running);
    assert_eq!(controller.results().unwrap(), vec!["ABC1234".to_string()]);

    controller.shutdown();
    assert_eq!(stats.releases(), 1);
}

#[test]
fn streams_frames_without_detector() {
    let (camera, stats) = FakeCamera::new(Feed::Constant(true));
    let pipeline = Pipeline {
        camera: Box::new(camera),
        detector: None,
        reader: PlateReader::new(Box::new(BrightTextOcr), false),
        render: BoundingBoxRender::default(),
    };
    let controller = StreamController::new(pipeline, ResultStore::default(), test_config());
    assert!(!controller.status().unwrap().detector_loaded);

    controller.start().unwrap();
    assert!(wait_until(|| frames(&controller) > 2));
    assert_eq!(controller.results().unwrap(), vec![NO_DETECTION.to_string()]);

    controller.shutdown();
    assert_eq!(stats.releases(), 1);
}

#[test]
fn unavailable_ocr_reports_no_plate() {
    let (camera, _stats) = FakeCamera::new(Feed::Constant(true));
    let pipeline = Pipeline {
        camera: Box::new(camera),
        detector: Some(Box::new(common::WhiteBoxDetector)),
        reader: PlateReader::unavailable(true),
        render: BoundingBoxRender::default(),
    };
    let controller = StreamController::new(pipeline, ResultStore::default(), test_config());

    controller.start().unwrap();
    assert!(wait_until(|| frames(&controller) > 2));
    assert_eq!(controller.status().unwrap().state, StreamState::Running);
    assert_eq!(controller.results().unwrap(), vec![NO_DETECTION.to_string()]);
    controller.shutdown();
}

#[test]
fn subscribers_receive_jpeg_parts_until_stop() {
    let (controller, _stats) = controller(Feed::Constant(true));
    controller.start().unwrap();
    let (generation, mut rx) = controller.subscribe().unwrap().unwrap();
    assert_eq!(generation, 1);

    let chunk = loop {
        match rx.blocking_recv() {
            Ok(event) => {
                if let StreamPayload::Chunk(chunk) = event.payload {
                    break chunk;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("stream closed before a frame"),
        }
    };
    let header = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
    assert!(chunk.starts_with(header));
    assert_eq!(&chunk[header.len()..header.len() + 2], &[0xFF, 0xD8]);
    assert!(chunk.ends_with(b"\r\n"));

    controller.stop().unwrap();
    let closed = loop {
        match rx.blocking_recv() {
            Ok(event) => {
                if matches!(event.payload, StreamPayload::Closed) {
                    break event.generation;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("sender dropped"),
        }
    };
    assert_eq!(closed, 1);
    controller.shutdown();
}

#[test]
fn record_file_tracks_latest_plate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dataset").join("results.txt");
    let record = ResultRecord::create(&path).unwrap();

    let (feed, tx) = gated();
    let (camera, _stats) = FakeCamera::new(feed);
    let controller = StreamController::new(
        common::pipeline(camera),
        ResultStore::new(Some(record)),
        test_config(),
    );
    controller.start().unwrap();

    tx.send(true).unwrap();
    assert!(wait_until(|| frames(&controller) == 1));
    assert_eq!(fs::read_to_string(&path).unwrap(), "\"ABC1234\"\n");

    tx.send(false).unwrap();
    assert!(wait_until(|| frames(&controller) == 2));
    assert_eq!(fs::read_to_string(&path).unwrap(), "");

    controller.shutdown();
}

#[test]
fn shutdown_joins_the_worker() {
    let (controller, stats) = controller(Feed::Constant(false));
    controller.start().unwrap();
    assert!(wait_until(|| stats.opens() == 1));

    controller.shutdown();
    assert_eq!(stats.releases(), 1);
    assert_eq!(controller.status().unwrap().state, StreamState::Stopped);
}
