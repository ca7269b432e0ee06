//! Defines routes for folder, object and progress operations.
//!
//! ## Structure
//! - **Folder endpoints**
//!   - `GET    /folders`: every folder with its contents
//!   - `POST   /folder/{folderName}`: create folder
//!   - `GET    /folder/{folderID}`: list folder (supports sort, order)
//!   - `PATCH  /folder/{folderID}`: rename folder
//!   - `DELETE /folder/{folderID}`: delete folder and its objects
//!   - `DELETE /folder/{folderID}/file/{fileID}`: delete object
//!
//! - **Object endpoints**
//!   - `POST   /upload/{folderID}`: multipart upload
//!   - `GET    /download/{folderID}/{fileID}`: download object
//!   - `GET    /preview/{folderID}/{fileID}`: preview image
//!
//! - **Progress**
//!   - `GET    /ws`: websocket of progress events

use crate::{
    handlers::{
        folder_handlers::{
            create_folder, delete_file, delete_folder, get_folder, list_folders, rename_folder,
        },
        health_handlers::{healthz, readyz},
        object_handlers::{download_object, get_preview, upload_object},
        progress_handlers::progress_ws,
    },
    services::StoreService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Build the router with shared state (`StoreService`) for every handler.
///
/// `max_upload_bytes` bounds request bodies, uploads included.
pub fn routes(service: StoreService, max_upload_bytes: usize) -> Router {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Folder routes
        .route("/folders", get(list_folders))
        .route(
            "/folder/{folder}",
            post(create_folder)
                .get(get_folder)
                .patch(rename_folder)
                .delete(delete_folder),
        )
        .route("/folder/{folder}/file/{file}", delete(delete_file))
        // Object routes
        .route("/upload/{folder}", post(upload_object))
        .route("/download/{folder}/{file}", get(download_object))
        .route("/preview/{folder}/{file}", get(get_preview))
        .route("/ws", get(progress_ws))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}
