//! WebDAV frontend: maps HTTP verbs onto pool operations.
//!
//! WebDAV methods like PROPFIND and MKCOL are not typed axum routes, so a
//! single fallback handler dispatches on the method string. Each request
//! runs to completion on its own task; write serialization per path lives
//! in the pool, not here.

pub mod listing;
pub mod propfind;
pub mod range;

use crate::error::PoolError;
use crate::pool::Pool;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Response, StatusCode, header};
use futures::TryStreamExt;
use percent_encoding::percent_decode_str;
use range::{RangeError, parse_range};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::signal;

#[derive(Clone)]
struct DavState {
    pool: Arc<Pool>,
}

pub fn router(pool: Arc<Pool>) -> Router {
    Router::new()
        .fallback(dispatch)
        .with_state(DavState { pool })
}

pub async fn serve(pool: Arc<Pool>, host: &str, port: u16) -> anyhow::Result<()> {
    let app = router(pool);
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    log::info!("WebDAV server listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("WebDAV server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutting down...");
}

async fn dispatch(State(state): State<DavState>, req: Request) -> Response<Body> {
    let started = Instant::now();
    let method = req.method().as_str().to_string();
    let path = percent_decode_str(req.uri().path())
        .decode_utf8_lossy()
        .into_owned();

    let range_header = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let accept_header = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let destination_header = req
        .headers()
        .get("Destination")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let depth_header = req
        .headers()
        .get("Depth")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let response = match method.as_str() {
        "OPTIONS" => options_response(),
        "HEAD" => head(&state, &path).await,
        "GET" => get(&state, range_header.as_deref(), accept_header.as_deref(), &path).await,
        "PUT" => put(&state, req, &path).await,
        "DELETE" => delete(&state, &path).await,
        "MKCOL" => status_response(StatusCode::CREATED),
        "MOVE" => move_resource(&state, destination_header.as_deref(), &path).await,
        "PROPFIND" => propfind_handler(&state, depth_header.as_deref(), &path).await,
        _ => status_response(StatusCode::METHOD_NOT_ALLOWED),
    };

    let bytes = response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    log::info!(
        "{method} {path} -> {} ({bytes} bytes, {:.1}ms)",
        response.status().as_u16(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    response
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, "0")
        .body(Body::empty())
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(message.to_string()))
        .unwrap()
}

fn pool_error_response(err: &PoolError) -> Response<Body> {
    let status = match err {
        PoolError::ManifestNotFound(_) => StatusCode::NOT_FOUND,
        PoolError::AlreadyExists(_) | PoolError::NameCollision { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &err.to_string())
}

fn options_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header("DAV", "1, 2")
        .header("MS-Author-Via", "DAV")
        .header(
            header::ALLOW,
            "OPTIONS, HEAD, GET, PUT, DELETE, PROPFIND, MKCOL, MOVE",
        )
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, "0")
        .body(Body::empty())
        .unwrap()
}

fn dir_response() -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "httpd/unix-directory")
        .header(header::CONTENT_LENGTH, "0")
        .body(Body::empty())
        .unwrap()
}

async fn head(state: &DavState, path: &str) -> Response<Body> {
    match state.pool.load_manifest(path).await {
        Ok(manifest) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type_for(path))
            .header(header::CONTENT_LENGTH, manifest.file_size.to_string())
            .header(header::ACCEPT_RANGES, "bytes")
            .header(header::LAST_MODIFIED, propfind::http_date(manifest.created_at))
            .body(Body::empty())
            .unwrap(),
        Err(PoolError::ManifestNotFound(_)) => match state.pool.is_dir(path).await {
            Ok(true) => dir_response(),
            Ok(false) => status_response(StatusCode::NOT_FOUND),
            Err(e) => pool_error_response(&e),
        },
        Err(e) => pool_error_response(&e),
    }
}

async fn get(
    state: &DavState,
    range_header: Option<&str>,
    accept_header: Option<&str>,
    path: &str,
) -> Response<Body> {
    let manifest = match state.pool.load_manifest(path).await {
        Ok(manifest) => manifest,
        Err(PoolError::ManifestNotFound(_)) => {
            return get_directory(state, accept_header, path).await;
        }
        Err(e) => return pool_error_response(&e),
    };

    match range_header {
        Some(raw) => match parse_range(raw, manifest.file_size) {
            Ok(range) => {
                let body = match state
                    .pool
                    .download_range_of(&manifest, range.start, range.len())
                    .await
                {
                    Ok(body) => body,
                    Err(e) => return pool_error_response(&e),
                };
                Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(header::CONTENT_TYPE, content_type_for(path))
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", range.start, range.end, manifest.file_size),
                    )
                    .header(header::CONTENT_LENGTH, body.len().to_string())
                    .header(header::ACCEPT_RANGES, "bytes")
                    .body(Body::from(body))
                    .unwrap()
            }
            Err(RangeError::Malformed | RangeError::Unsatisfiable) => Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes */{}", manifest.file_size),
                )
                .header(header::CONTENT_LENGTH, "0")
                .body(Body::empty())
                .unwrap(),
        },
        None => {
            // Stream the whole file in chunk-sized windows.
            let file_size = manifest.file_size;
            let window = manifest.chunk_size.max(1);
            let pool = state.pool.clone();
            let content_type = content_type_for(path);
            let stream = futures::stream::try_unfold(
                (pool, manifest, 0u64),
                move |(pool, manifest, offset)| async move {
                    if offset >= manifest.file_size {
                        return Ok(None);
                    }
                    let take = window.min(manifest.file_size - offset);
                    let data = pool
                        .download_range_of(&manifest, offset, take)
                        .await
                        .map_err(std::io::Error::other)?;
                    Ok::<_, std::io::Error>(Some((data, (pool, manifest, offset + take))))
                },
            );
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, file_size.to_string())
                .header(header::ACCEPT_RANGES, "bytes")
                .body(Body::from_stream(stream))
                .unwrap()
        }
    }
}

async fn get_directory(state: &DavState, accept_header: Option<&str>, path: &str) -> Response<Body> {
    match state.pool.is_dir(path).await {
        Ok(true) => {}
        Ok(false) => return status_response(StatusCode::NOT_FOUND),
        Err(e) => return pool_error_response(&e),
    }
    let wants_html = accept_header.is_some_and(|accept| accept.contains("text/html"));
    if !wants_html {
        return status_response(StatusCode::METHOD_NOT_ALLOWED);
    }
    match state.pool.browse(path).await {
        Ok(dir) => {
            let html = listing::html_listing(path, &dir.files, &dir.subdirs);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
                .header(header::CONTENT_LENGTH, html.len().to_string())
                .body(Body::from(html))
                .unwrap()
        }
        Err(e) => pool_error_response(&e),
    }
}

async fn put(state: &DavState, req: Request, path: &str) -> Response<Body> {
    let temp_dir = state.pool.config().temp_dir.clone();
    if let Err(e) = tokio::fs::create_dir_all(&temp_dir).await {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &PoolError::from_temp_io(e, &temp_dir).to_string(),
        );
    }
    let spool = temp_dir.join(format!("webdav_put_{}.tmp", uuid::Uuid::new_v4()));

    let body = req
        .into_body()
        .into_data_stream()
        .map_err(std::io::Error::other);
    let mut reader = tokio_util::io::StreamReader::new(body);
    let spooled = async {
        let mut file = tokio::fs::File::create(&spool).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    let response = match spooled {
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &PoolError::from_temp_io(e, &temp_dir).to_string(),
        ),
        Ok(()) => match state.pool.upload(&spool, path).await {
            Ok(outcome) if outcome.replaced => status_response(StatusCode::NO_CONTENT),
            Ok(_) => status_response(StatusCode::CREATED),
            Err(e) => pool_error_response(&e),
        },
    };
    let _ = tokio::fs::remove_file(&spool).await;
    response
}

async fn delete(state: &DavState, path: &str) -> Response<Body> {
    match state.pool.delete(path).await {
        Ok(_) => status_response(StatusCode::NO_CONTENT),
        Err(PoolError::ManifestNotFound(_)) => status_response(StatusCode::NOT_FOUND),
        Err(e) => pool_error_response(&e),
    }
}

async fn move_resource(state: &DavState, destination_header: Option<&str>, path: &str) -> Response<Body> {
    let Some(destination) = destination_header.map(destination_path) else {
        return error_response(StatusCode::BAD_REQUEST, "Destination header required");
    };

    match state.pool.rename(path, &destination).await {
        Ok(()) => status_response(StatusCode::CREATED),
        Err(PoolError::ManifestNotFound(_)) => status_response(StatusCode::NOT_FOUND),
        Err(e @ (PoolError::AlreadyExists(_) | PoolError::NameCollision { .. })) => {
            error_response(StatusCode::CONFLICT, &e.to_string())
        }
        Err(e) => pool_error_response(&e),
    }
}

/// Strip scheme and host from a Destination header, leaving the path.
fn destination_path(header: &str) -> String {
    let raw = match header.find("://") {
        Some(idx) => {
            let rest = &header[idx + 3..];
            match rest.find('/') {
                Some(slash) => &rest[slash..],
                None => "/",
            }
        }
        None => header,
    };
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

async fn propfind_handler(state: &DavState, depth_header: Option<&str>, path: &str) -> Response<Body> {
    let depth = depth_header.unwrap_or("1");
    if depth != "0" && depth != "1" {
        return error_response(StatusCode::FORBIDDEN, "Depth must be 0 or 1");
    }

    let mut resources = Vec::new();
    match state.pool.load_manifest(path).await {
        Ok(manifest) => resources.push(propfind::file_resource(&manifest)),
        Err(PoolError::ManifestNotFound(_)) => {
            let is_dir = match state.pool.is_dir(path).await {
                Ok(is_dir) => is_dir,
                Err(e) => return pool_error_response(&e),
            };
            if !is_dir {
                return status_response(StatusCode::NOT_FOUND);
            }
            let trimmed = path.trim_end_matches('/');
            let dir = if trimmed.is_empty() { "/" } else { trimmed };
            resources.push(propfind::dir_resource(dir, unix_now()));
            if depth == "1" {
                let dir_listing = match state.pool.browse(dir).await {
                    Ok(dir_listing) => dir_listing,
                    Err(e) => return pool_error_response(&e),
                };
                for sub in &dir_listing.subdirs {
                    let full = if dir == "/" {
                        format!("/{sub}")
                    } else {
                        format!("{dir}/{sub}")
                    };
                    resources.push(propfind::dir_resource(&full, unix_now()));
                }
                for manifest in &dir_listing.files {
                    resources.push(propfind::file_resource(manifest));
                }
            }
        }
        Err(e) => return pool_error_response(&e),
    }

    let xml = propfind::multistatus(&resources);
    Response::builder()
        .status(StatusCode::MULTI_STATUS)
        .header(header::CONTENT_TYPE, "application/xml; charset=utf-8")
        .header(header::CONTENT_LENGTH, xml.len().to_string())
        .body(Body::from(xml))
        .unwrap()
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Content type from the file extension; media types first since streaming
/// players are the main consumer.
pub fn content_type_for(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "7z" => "application/x-7z-compressed",
        "txt" | "srt" | "sub" => "text/plain",
        "json" => "application/json",
        "xml" => "application/xml",
        "html" => "text/html",
        "iso" => "application/x-iso9660-image",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_header_forms() {
        assert_eq!(destination_path("http://host:8080/t/b.bin"), "/t/b.bin");
        assert_eq!(destination_path("/t/b.bin"), "/t/b.bin");
        assert_eq!(destination_path("http://host"), "/");
        assert_eq!(destination_path("/a%20b"), "/a b");
    }

    #[test]
    fn content_types_cover_media() {
        assert_eq!(content_type_for("/t/a.mkv"), "video/x-matroska");
        assert_eq!(content_type_for("/t/a.MP4"), "video/mp4");
        assert_eq!(content_type_for("/t/a.unknown"), "application/octet-stream");
    }
}
