//! HTTP handlers for folders and their listings.

use crate::{
    errors::AppError,
    models::folder::{Folder, FolderListing, FolderSummary, SortSpec},
    services::StoreService,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

/// Body of `PATCH /folder/{folderID}`.
#[derive(Debug, Deserialize)]
pub struct RenameFolderReq {
    #[serde(rename = "newName")]
    pub new_name: String,
}

/// A folder plus a human-readable summary of what happened to it.
#[derive(Debug, Serialize)]
pub struct FolderChanged {
    pub message: String,
    #[serde(flatten)]
    pub folder: Folder,
}

#[derive(Debug, Serialize)]
pub struct Deleted {
    pub message: String,
}

/// `POST /folder/{folderName}`
pub async fn create_folder(
    State(service): State<StoreService>,
    Path(folder_name): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let folder = service.create_folder(&folder_name).await?;
    Ok((
        StatusCode::CREATED,
        Json(FolderChanged {
            message: format!("Folder created: {} with ID: {}", folder.name, folder.id),
            folder,
        }),
    ))
}

/// `DELETE /folder/{folderID}`, objects included.
pub async fn delete_folder(
    State(service): State<StoreService>,
    Path(folder_id): Path<String>,
) -> Result<Json<Deleted>, AppError> {
    service.delete_folder(&folder_id).await?;
    Ok(Json(Deleted {
        message: format!("Folder deleted with ID: {folder_id}"),
    }))
}

/// `PATCH /folder/{folderID}` with `{"newName": ".."}`
pub async fn rename_folder(
    State(service): State<StoreService>,
    Path(folder_id): Path<String>,
    Json(req): Json<RenameFolderReq>,
) -> Result<Json<FolderChanged>, AppError> {
    let folder = service.rename_folder(&folder_id, &req.new_name).await?;
    Ok(Json(FolderChanged {
        message: format!("Folder renamed: {} with ID: {}", folder.name, folder.id),
        folder,
    }))
}

/// `GET /folder/{folderID}?sort=name|size|date&order=asc|desc`
pub async fn get_folder(
    State(service): State<StoreService>,
    Path(folder_id): Path<String>,
    Query(sort): Query<SortSpec>,
) -> Result<Json<FolderListing>, AppError> {
    Ok(Json(service.list_folder(&folder_id, sort).await?))
}

/// `GET /folders`
pub async fn list_folders(
    State(service): State<StoreService>,
    Query(sort): Query<SortSpec>,
) -> Result<Json<Vec<FolderSummary>>, AppError> {
    Ok(Json(service.list_folders(sort).await?))
}

/// `DELETE /folder/{folderID}/file/{fileID}`
pub async fn delete_file(
    State(service): State<StoreService>,
    Path((folder_id, file_id)): Path<(String, String)>,
) -> Result<Json<Deleted>, AppError> {
    service.delete_object(&folder_id, &file_id).await?;
    Ok(Json(Deleted {
        message: format!("File deleted with ID: {file_id}"),
    }))
}
