//! Request body parsing for the enroll and verify endpoints.
//!
//! Both accept `multipart/form-data` (file uploads) or a JSON body carrying
//! images as data URLs or bare base64.

use crate::error::ApiError;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header;
use axum::Json;
use faceprint_core::baseline::UserId;
use faceprint_core::codec;
use faceprint_core::types::Metric;
use serde::Deserialize;
use std::collections::HashMap;

/// Validated enrollment submission.
#[derive(Debug)]
pub struct EnrollInput {
    pub user_id: UserId,
    pub images: Vec<Vec<u8>>,
}

/// Validated verification submission.
#[derive(Debug)]
pub struct VerifyInput {
    pub user_id: UserId,
    pub image: Vec<u8>,
    pub metric: Metric,
    pub threshold: Option<f32>,
}

#[derive(Deserialize)]
struct EnrollJson {
    user_id: Option<String>,
    #[serde(default)]
    images: Vec<String>,
}

#[derive(Deserialize)]
struct VerifyJson {
    user_id: Option<String>,
    image: Option<String>,
    metric: Option<String>,
    threshold: Option<f32>,
}

#[derive(Default)]
struct Form {
    text: HashMap<String, String>,
    files: Vec<(String, Vec<u8>)>,
}

impl Form {
    fn files_named<'a>(&'a self, names: &'a [&str]) -> impl Iterator<Item = &'a Vec<u8>> + 'a {
        self.files
            .iter()
            .filter(move |(name, _)| names.contains(&name.as_str()))
            .map(|(_, bytes)| bytes)
    }
}

const IMAGE_FIELDS: &[&str] = &["images", "images[]", "image"];

pub async fn read_enroll(request: Request) -> Result<EnrollInput, ApiError> {
    let (user_id, images) = if is_multipart(&request) {
        let form = read_multipart(request).await?;
        let images: Vec<Vec<u8>> = form
            .files_named(&["images", "images[]"])
            .filter(|bytes| !bytes.is_empty())
            .cloned()
            .collect();
        (form.text.get("user_id").cloned(), images)
    } else {
        let Json(body) = Json::<EnrollJson>::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let images = body
            .images
            .iter()
            .enumerate()
            .map(|(i, encoded)| {
                codec::decode_data_url(encoded)
                    .map_err(|e| ApiError::BadRequest(format!("images[{i}]: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        (body.user_id, images)
    };

    let user_id = required_user(user_id.as_deref())?;
    if images.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one file is required in field 'images'".into(),
        ));
    }
    Ok(EnrollInput { user_id, images })
}

pub async fn read_verify(request: Request) -> Result<VerifyInput, ApiError> {
    let (user_id, image, metric, threshold) = if is_multipart(&request) {
        let form = read_multipart(request).await?;
        let image = form
            .files_named(&["image"])
            .find(|bytes| !bytes.is_empty())
            .cloned();
        let threshold = match form.text.get("threshold").map(|t| t.trim()) {
            None | Some("") => None,
            Some(raw) => Some(raw.parse::<f32>().map_err(|_| {
                ApiError::BadRequest(format!("threshold {raw:?} is not a number"))
            })?),
        };
        (
            form.text.get("user_id").cloned(),
            image,
            form.text.get("metric").cloned(),
            threshold,
        )
    } else {
        let Json(body) = Json::<VerifyJson>::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        let image = body
            .image
            .as_deref()
            .map(codec::decode_data_url)
            .transpose()
            .map_err(|e| ApiError::BadRequest(format!("image: {e}")))?;
        (body.user_id, image, body.metric, body.threshold)
    };

    let user_id = required_user(user_id.as_deref())?;
    let image = image.ok_or_else(|| ApiError::BadRequest("field 'image' is required".into()))?;
    let metric = match metric.as_deref().map(str::trim) {
        None | Some("") => Metric::default(),
        Some(raw) => raw
            .parse::<Metric>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
    };
    if threshold.is_some_and(|t| !t.is_finite()) {
        return Err(ApiError::BadRequest("threshold must be finite".into()));
    }

    Ok(VerifyInput {
        user_id,
        image,
        metric,
        threshold,
    })
}

pub fn required_user(raw: Option<&str>) -> Result<UserId, ApiError> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("user_id is required".into()))?;
    UserId::parse(raw).map_err(|e| ApiError::BadRequest(e.to_string()))
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"))
}

async fn read_multipart(request: Request) -> Result<Form, ApiError> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let mut form = Form::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if field.file_name().is_some() || IMAGE_FIELDS.contains(&name.as_str()) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            form.files.push((name, bytes.to_vec()));
        } else {
            let text = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(e.body_text()))?;
            form.text.insert(name, text);
        }
    }
    Ok(form)
}
