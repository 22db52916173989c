mod client;
mod endpoint;
mod model;

pub use client::{ApiError, ApiErrorClass, ApiResponse, BackendClient};
pub use endpoint::{ApiRequest, RequestShapeError, build_request};
pub use model::{EntityKind, MutationType, permanent_id};
pub use reqwest::{Method, StatusCode};
