//! CRD conversion: rewrite `apiVersion` on every object in a ConversionReview.

use axum::body::Bytes;
use axum::routing::post;
use axum::{Json, Router};
use emissary_core::split_api_version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::CONVERT_PATH;

pub const REVIEW_API_VERSION: &str = "apiextensions.k8s.io/v1";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReview {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<ConversionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ConversionResponse>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionRequest {
    pub uid: String,
    #[serde(rename = "desiredAPIVersion")]
    pub desired_api_version: String,
    #[serde(default)]
    pub objects: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    pub uid: String,
    #[serde(default)]
    pub converted_objects: Vec<Value>,
    pub result: ResultStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ResultStatus {
    fn success() -> Self { Self { status: "Success".to_string(), message: None } }
    fn failure(message: impl Into<String>) -> Self { Self { status: "Failure".to_string(), message: Some(message.into()) } }
}

fn convert_object(mut obj: Value, desired: &str) -> Result<Value, String> {
    let current = obj.get("apiVersion").and_then(Value::as_str).ok_or("object has no apiVersion")?;
    let (have, _) = split_api_version(current);
    let (want, _) = split_api_version(desired);
    if have != want {
        return Err(format!("cannot convert {current} to {desired}: group mismatch"));
    }
    obj["apiVersion"] = Value::String(desired.to_string());
    Ok(obj)
}

/// Answer one request. Any object that cannot be converted fails the whole
/// review.
pub fn convert(req: ConversionRequest) -> ConversionResponse {
    let desired = req.desired_api_version;
    match req.objects.into_iter().map(|o| convert_object(o, &desired)).collect::<Result<Vec<_>, _>>() {
        Ok(converted_objects) => ConversionResponse { uid: req.uid, converted_objects, result: ResultStatus::success() },
        Err(message) => ConversionResponse { uid: req.uid, converted_objects: Vec::new(), result: ResultStatus::failure(message) },
    }
}

/// Parse a raw review body and build the reply review. Malformed input
/// yields a Failure result rather than an HTTP error.
pub fn review(body: &[u8]) -> ConversionReview {
    let response = match serde_json::from_slice::<ConversionReview>(body) {
        Ok(ConversionReview { request: Some(req), .. }) => {
            debug!(uid = %req.uid, desired = %req.desired_api_version, objects = req.objects.len(), "apiext: conversion review");
            convert(req)
        }
        Ok(_) => ConversionResponse { result: ResultStatus::failure("review has no request"), ..Default::default() },
        Err(e) => {
            warn!(error = %e, "apiext: malformed conversion review");
            // salvage the uid so the API server can match the reply
            let uid = serde_json::from_slice::<Value>(body)
                .ok()
                .and_then(|v| v["request"]["uid"].as_str().map(str::to_string))
                .unwrap_or_default();
            ConversionResponse { uid, result: ResultStatus::failure(format!("malformed review: {e}")), ..Default::default() }
        }
    };
    ConversionReview {
        api_version: REVIEW_API_VERSION.to_string(),
        kind: "ConversionReview".to_string(),
        request: None,
        response: Some(response),
    }
}

async fn handle_convert(body: Bytes) -> Json<ConversionReview> { Json(review(&body)) }

pub fn router() -> Router { Router::new().route(CONVERT_PATH, post(handle_convert)) }
