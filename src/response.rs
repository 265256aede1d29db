//! Standard response envelope helpers.

use axum::{http::StatusCode, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct SuccessOne<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct SuccessMany<T> {
    pub data: Vec<T>,
    pub meta: MetaCount,
}

#[derive(Serialize)]
pub struct MetaCount {
    pub count: u64,
}

/// Paging meta for query result pages.
#[derive(Serialize)]
pub struct MetaPage {
    pub count: u64,
    pub total_count: u64,
    pub page_number: u32,
    pub page_size: u32,
}

pub fn success_one<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (
        StatusCode::CREATED,
        Json(SuccessOne { data, meta: None }),
    )
}

pub fn success_one_ok<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (
        StatusCode::OK,
        Json(SuccessOne { data, meta: None }),
    )
}

pub fn success_many<T: Serialize>(data: Vec<T>) -> (StatusCode, Json<SuccessMany<T>>) {
    let count = data.len() as u64;
    (
        StatusCode::OK,
        Json(SuccessMany {
            data,
            meta: MetaCount { count },
        }),
    )
}

pub fn success_page<T: Serialize>(
    data: Vec<T>,
    total_count: u64,
    page_number: u32,
    page_size: u32,
) -> (StatusCode, Json<SuccessOne<Vec<T>>>) {
    let meta = serde_json::to_value(MetaPage {
        count: data.len() as u64,
        total_count,
        page_number,
        page_size,
    })
    .ok();
    (
        StatusCode::OK,
        Json(SuccessOne { data, meta }),
    )
}
