//! Error types for the image processor.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level application errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Transcode error: {0}")]
    Transcode(#[from] TranscodeError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether retrying an operation could plausibly change its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network hiccups, throttling, upstream 5xx.
    Transient,
    /// Bad input that will fail the same way every time.
    Permanent,
}

/// Configuration loading and parsing errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{path}': {message}")]
    ParseFailed { path: PathBuf, message: String },

    #[error("Invalid value '{value}' for environment variable {var}")]
    InvalidEnv { var: String, value: String },

    #[error("Config validation failed with {error_count} error(s)")]
    ValidationFailed { error_count: usize },
}

/// Task envelope decoding errors.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Malformed task payload: {0}")]
    Malformed(String),

    #[error("Task for product {product_id} has no images")]
    NoImages { product_id: u64 },

    #[error("Task for product {product_id} has an empty image locator at position {index}")]
    EmptyLocator { product_id: u64, index: usize },
}

/// Single-image download, transcode and upload errors.
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Failed to download '{url}': {message}")]
    Download { url: String, message: String },

    #[error("Download of '{url}' returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("'{url}' is not an image (content type: {content_type})")]
    NotAnImage { url: String, content_type: String },

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Unsupported image format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Failed to encode image: {0}")]
    Encode(String),

    #[error("Transcode worker failed: {0}")]
    Worker(String),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Upload failed: {0}")]
    Upload(#[from] StorageError),
}

impl TranscodeError {
    /// Classifies the error for retry purposes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Download { .. } | Self::Worker(_) => ErrorKind::Transient,
            Self::HttpStatus { status, .. } => {
                if *status == 429 || *status >= 500 {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Permanent
                }
            }
            Self::NotAnImage { .. }
            | Self::Decode(_)
            | Self::UnsupportedFormat { .. }
            | Self::Encode(_)
            | Self::HttpClient(_) => ErrorKind::Permanent,
            Self::Upload(e) => e.kind(),
        }
    }
}

/// Blob storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to upload '{key}': {message}")]
    UploadFailed { key: String, message: String },

    #[error("Failed to download '{key}': {message}")]
    DownloadFailed { key: String, message: String },

    #[error("Object not found: {key}")]
    NotFound { key: String },
}

impl StorageError {
    /// Classifies the error for retry purposes.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::Permanent,
            _ => ErrorKind::Transient,
        }
    }
}

/// Product persistence errors.
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Failed to connect to database: {0}")]
    ConnectionFailed(String),

    #[error("Failed to update product {product_id}: {message}")]
    UpdateFailed { product_id: u64, message: String },

    #[error("Invalid status transition for product {product_id}: {from} -> {to}")]
    InvalidTransition {
        product_id: u64,
        from: String,
        to: String,
    },
}

/// Product read-cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to connect to Redis at '{url}': {message}")]
    ConnectionFailed { url: String, message: String },

    #[error("Failed to delete cache key '{key}': {message}")]
    DeleteFailed { key: String, message: String },
}

/// Message broker errors.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    ConnectionFailed(String),

    #[error("Failed to declare queue '{queue}': {message}")]
    DeclareFailed { queue: String, message: String },

    #[error("Failed to start consuming '{queue}': {message}")]
    ConsumeFailed { queue: String, message: String },

    #[error("Failed to publish to '{queue}': {message}")]
    PublishFailed { queue: String, message: String },

    #[error("Failed to settle delivery: {0}")]
    SettleFailed(String),

    #[error("Delivery stream closed unexpectedly after {settled} deliveries")]
    StreamClosed { settled: u64 },

    #[error("Failed to serialize message: {0}")]
    SerializationFailed(String),
}

/// Metrics export errors.
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus registration failed: {0}")]
    Registration(String),

    #[error("Metrics server failed: {0}")]
    Server(String),
}
