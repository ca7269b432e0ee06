//! HTTP handlers for uploading and downloading objects.
//! Single-part downloads are streamed; multi-part downloads are sent once
//! reassembled.

use crate::{
    errors::AppError,
    models::object::UploadReceipt,
    services::{
        PreviewImage, StoreService, Upload,
        decoder::{Retrieved, RetrievedBody},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::debug;

/// Characters left unescaped in an RFC 5987 `filename*` value.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// `POST /upload/{folderID}` with multipart field `file` and optional `preview`.
pub async fn upload_object(
    State(service): State<StoreService>,
    Path(folder_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<UploadReceipt>, AppError> {
    let mut upload: Option<Upload> = None;
    let mut preview: Option<PreviewImage> = None;

    while let Some(field) = multipart.next_field().await? {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("file") => {
                let name = field.file_name().unwrap_or("unnamed").to_string();
                let content_type = field
                    .content_type()
                    .map(str::to_string)
                    .or_else(|| mime_guess::from_path(&name).first_raw().map(str::to_string));
                let data = field.bytes().await?;
                upload = Some(Upload {
                    name,
                    content_type,
                    data,
                    preview: None,
                });
            }
            Some("preview") => {
                let content_type = field.content_type().map(str::to_string);
                let data = field.bytes().await?;
                if !data.is_empty() {
                    preview = Some(PreviewImage { content_type, data });
                }
            }
            other => debug!(field = ?other, "ignoring multipart field"),
        }
    }

    let mut upload = upload.ok_or_else(|| AppError::bad_request("No file uploaded"))?;
    upload.preview = preview;
    let stored = service.store_object(&folder_id, upload).await?;

    let message = if stored.parts > 1 {
        format!(
            "File uploaded successfully in {} chunks: {} bytes",
            stored.parts, stored.size
        )
    } else {
        format!("File uploaded successfully: {} bytes", stored.size)
    };
    Ok(Json(UploadReceipt {
        message,
        filename: stored.name,
        id: stored.id,
    }))
}

/// `GET /download/{folderID}/{fileID}`
pub async fn download_object(
    State(service): State<StoreService>,
    Path((folder_id, file_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let Retrieved {
        name,
        content_type,
        etag,
        body,
        ..
    } = service.retrieve_object(&folder_id, &file_id).await?;

    let (body, length) = match body {
        RetrievedBody::Streamed {
            stream,
            content_length,
        } => (Body::from_stream(stream), content_length),
        RetrievedBody::Buffered(bytes) => {
            let length = bytes.len() as u64;
            (Body::from(bytes), length)
        }
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    set_body_headers(headers, &content_type, Some(length));
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition("attachment", &name),
    );
    if let Some(etag) = etag {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{etag}\"")) {
            headers.insert(header::ETAG, value);
        }
    }
    Ok(response)
}

/// `GET /preview/{folderID}/{fileID}`
pub async fn get_preview(
    State(service): State<StoreService>,
    Path((folder_id, file_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let preview = service.retrieve_preview(&folder_id, &file_id).await?;

    let mut response = Response::new(Body::from_stream(preview.body.stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    set_body_headers(headers, &preview.content_type, preview.body.content_length);
    headers.insert(
        header::CONTENT_DISPOSITION,
        content_disposition("inline", &preview.filename),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    Ok(response)
}

fn set_body_headers(headers: &mut HeaderMap, content_type: &str, length: Option<u64>) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(length) = length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
}

/// `<disposition>; filename="<ascii>"; filename*=UTF-8''<encoded>`
fn content_disposition(disposition: &str, name: &str) -> HeaderValue {
    let fallback: String = name
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect();
    let encoded = utf8_percent_encode(name, ATTR_CHAR);
    HeaderValue::from_str(&format!(
        "{disposition}; filename=\"{fallback}\"; filename*=UTF-8''{encoded}"
    ))
    .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}
