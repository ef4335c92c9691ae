//! HTTP surface: the operator page, the MJPEG feed and the control endpoints.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, warn};
use serde_json::json;
use warp::http::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use warp::http::StatusCode;
use warp::hyper::Body;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

use crate::controller::{StartOutcome, StopOutcome, StreamController};
use crate::error::{PlateError, Result};
use crate::metrics;
use crate::mjpeg::{self, subscriber_stream};

const BUILTIN_INDEX: &str = include_str!("../assets/index.html");

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub index_page: PathBuf,
    pub static_dir: PathBuf,
}

fn with_controller(
    controller: Arc<StreamController>,
) -> impl Filter<Extract = (Arc<StreamController>,), Error = Infallible> + Clone {
    warp::any().map(move || controller.clone())
}

fn json_reply(status: StatusCode, body: serde_json::Value) -> Response {
    warp::reply::with_status(warp::reply::json(&body), status).into_response()
}

fn message(text: &str) -> Response {
    json_reply(StatusCode::OK, json!({ "message": text }))
}

fn failure(context: &str, e: impl std::fmt::Display) -> Response {
    error!("{}: {}", context, e);
    json_reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": format!("{}: {}", context, e) }),
    )
}

pub fn routes(
    controller: Arc<StreamController>,
    config: ServerConfig,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let index_page = config.index_page.clone();
    let index = warp::path::end()
        .and(warp::get())
        .and_then(move || serve_index(index_page.clone()));

    let video_feed = warp::path("video_feed")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .map(video_feed);

    let results = warp::path("results")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .map(results);

    let status = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_controller(controller.clone()))
        .map(status);

    let start = warp::path("start")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_controller(controller.clone()))
        .map(start);

    let stop = warp::path("stop")
        .and(warp::path::end())
        .and(warp::post())
        .and(with_controller(controller))
        .map(stop);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(render_metrics);

    let favicon = warp::path("favicon.ico").and(warp::path::end()).and(
        warp::fs::file(config.static_dir.join("favicon.ico"))
            .map(Reply::into_response)
            .or(warp::any().map(|| StatusCode::NO_CONTENT.into_response()))
            .unify(),
    );

    let assets = warp::path("static").and(warp::fs::dir(config.static_dir));

    let devtools = warp::path!(".well-known" / "appspecific" / "com.chrome.devtools.json")
        .and(warp::get())
        .map(|| warp::reply::json(&json!({})));

    index
        .or(video_feed)
        .or(results)
        .or(status)
        .or(start)
        .or(stop)
        .or(metrics)
        .or(favicon)
        .or(assets)
        .or(devtools)
        .recover(handle_rejection)
        .with(warp::log("plate_stream::http"))
}

/// Binds the routes on `address` and serves until `signal` resolves.
///
/// The stream is stopped as soon as `signal` fires. Open `/video_feed` bodies
/// only end with their run, so the server could not drain otherwise.
pub fn bind(
    controller: Arc<StreamController>,
    config: ServerConfig,
    address: SocketAddr,
    signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()>)> {
    let stopping = controller.clone();
    let drain = async move {
        signal.await;
        if let Err(e) = stopping.stop() {
            error!("Cannot stop stream on shutdown: {}", e);
        }
    };
    warp::serve(routes(controller, config))
        .try_bind_with_graceful_shutdown(address, drain)
        .map_err(|e| PlateError::Server(e.to_string()))
}

async fn serve_index(path: PathBuf) -> std::result::Result<Response, Rejection> {
    let page = match tokio::fs::read_to_string(&path).await {
        Ok(page) => page,
        Err(e) => {
            warn!("Cannot read {}: {}, serving built-in page", path.display(), e);
            BUILTIN_INDEX.to_string()
        }
    };
    Ok(warp::reply::html(page).into_response())
}

fn video_feed(controller: Arc<StreamController>) -> Response {
    let (generation, rx) = match controller.subscribe() {
        Ok(Some(subscription)) => subscription,
        Ok(None) => {
            return json_reply(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "error": "stream is not running" }),
            )
        }
        Err(e) => return failure("Cannot attach to stream", e),
    };

    let mut response = Response::new(Body::wrap_stream(subscriber_stream(generation, rx)));
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(mjpeg::CONTENT_TYPE));
    headers.insert(
        CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

fn results(controller: Arc<StreamController>) -> Response {
    match controller.results() {
        Ok(results) => warp::reply::json(&results).into_response(),
        Err(e) => failure("Cannot read results", e),
    }
}

fn status(controller: Arc<StreamController>) -> Response {
    match controller.status() {
        Ok(status) => warp::reply::json(&status).into_response(),
        Err(e) => failure("Cannot read status", e),
    }
}

fn start(controller: Arc<StreamController>) -> Response {
    match controller.start() {
        Ok(StartOutcome::Started { .. }) => message("Stream started"),
        Ok(StartOutcome::AlreadyRunning) => message("Stream already running"),
        Err(e) => failure("Failed to start", e),
    }
}

fn stop(controller: Arc<StreamController>) -> Response {
    match controller.stop() {
        Ok(StopOutcome::Stopped) => message("Stream stopped"),
        Ok(StopOutcome::AlreadyStopped) => message("Stream already stopped"),
        Err(e) => failure("Failed to stop", e),
    }
}

fn render_metrics() -> Response {
    match metrics::render() {
        Ok(text) => {
            warp::reply::with_header(text, CONTENT_TYPE, "text/plain; version=0.0.4")
                .into_response()
        }
        Err(e) => failure("Cannot render metrics", e),
    }
}

async fn handle_rejection(rejection: Rejection) -> std::result::Result<Response, Infallible> {
    let (status, text) = if rejection.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else {
        error!("Unhandled rejection: {:?}", rejection);
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    };
    Ok(json_reply(status, json!({ "error": text })))
}
