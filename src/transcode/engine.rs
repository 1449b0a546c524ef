//! Download, recompress and upload a single image.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info};
use uuid::Uuid;

use super::ImageProcessor;
use crate::config::model::{ProcessingConfig, StorageConfig};
use crate::error::TranscodeError;
use crate::storage::BlobStore;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// An encoded output image.
#[derive(Debug)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub extension: &'static str,
    pub content_type: &'static str,
}

/// Stateless image transcoder: fetches over HTTP, writes to a blob store.
pub struct Transcoder {
    http: reqwest::Client,
    store: Arc<dyn BlobStore>,
    quality: u8,
    prefix: String,
}

impl Transcoder {
    /// Builds a transcoder with a download client capped at [`DOWNLOAD_TIMEOUT`].
    pub fn new(
        store: Arc<dyn BlobStore>,
        quality: u8,
        prefix: impl Into<String>,
    ) -> Result<Self, TranscodeError> {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| TranscodeError::HttpClient(e.to_string()))?;

        Ok(Self::with_client(http, store, quality, prefix))
    }

    /// Uses an existing HTTP client as is.
    pub fn with_client(
        http: reqwest::Client,
        store: Arc<dyn BlobStore>,
        quality: u8,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            http,
            store,
            quality,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    pub fn from_config(
        store: Arc<dyn BlobStore>,
        processing: &ProcessingConfig,
        storage: &StorageConfig,
    ) -> Result<Self, TranscodeError> {
        Self::new(store, processing.jpeg_quality, storage.prefix.clone())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, TranscodeError> {
        let download_failed = |e: reqwest::Error| TranscodeError::Download {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.http.get(url).send().await.map_err(download_failed)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TranscodeError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !is_image_media_type(&content_type) {
            return Err(TranscodeError::NotAnImage {
                url: url.to_string(),
                content_type: if content_type.is_empty() {
                    "<none>".to_string()
                } else {
                    content_type
                },
            });
        }

        let bytes = response.bytes().await.map_err(download_failed)?;
        Ok(bytes.to_vec())
    }

    /// Destination key: `<prefix>/<unix-nanos>-<uuid>.<ext>`.
    fn object_key(&self, extension: &str) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("{}/{}-{}.{}", self.prefix, nanos, Uuid::new_v4(), extension)
    }
}

/// Media types compare case-insensitively, so `Image/JPEG` counts.
fn is_image_media_type(content_type: &str) -> bool {
    content_type
        .get(..6)
        .is_some_and(|top| top.eq_ignore_ascii_case("image/"))
}

/// Decodes `data`, detecting its format, and re-encodes it.
///
/// JPEG is recompressed at `quality`; PNG is re-encoded losslessly. Everything
/// else is rejected.
pub fn transcode(data: &[u8], quality: u8) -> Result<EncodedImage, TranscodeError> {
    let format = image::guess_format(data).map_err(|e| TranscodeError::Decode(e.to_string()))?;

    match format {
        ImageFormat::Jpeg | ImageFormat::Png => {}
        other => {
            return Err(TranscodeError::UnsupportedFormat {
                format: format!("{:?}", other).to_lowercase(),
            })
        }
    }

    let decoded = image::load_from_memory_with_format(data, format)
        .map_err(|e| TranscodeError::Decode(e.to_string()))?;

    if format == ImageFormat::Jpeg {
        encode_jpeg(&decoded, quality)
    } else {
        encode_png(&decoded)
    }
}

fn encode_jpeg(decoded: &DynamicImage, quality: u8) -> Result<EncodedImage, TranscodeError> {
    let mut data = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut data, quality);
    encoder
        .encode_image(&decoded.to_rgb8())
        .map_err(|e| TranscodeError::Encode(e.to_string()))?;

    Ok(EncodedImage {
        data,
        extension: "jpg",
        content_type: "image/jpeg",
    })
}

fn encode_png(decoded: &DynamicImage) -> Result<EncodedImage, TranscodeError> {
    let mut data = Vec::new();
    decoded
        .write_to(&mut Cursor::new(&mut data), ImageFormat::Png)
        .map_err(|e| TranscodeError::Encode(e.to_string()))?;

    Ok(EncodedImage {
        data,
        extension: "png",
        content_type: "image/png",
    })
}

#[async_trait]
impl ImageProcessor for Transcoder {
    async fn process_image(&self, url: &str) -> Result<String, TranscodeError> {
        let source = self.download(url).await?;
        let source_size = source.len();

        let quality = self.quality;
        let encoded = tokio::task::spawn_blocking(move || transcode(&source, quality))
            .await
            .map_err(|e| TranscodeError::Worker(e.to_string()))??;

        debug!(
            image = url,
            source_bytes = source_size,
            output_bytes = encoded.data.len(),
            "Image transcoded"
        );

        let key = self.object_key(encoded.extension);
        let uri = self
            .store
            .upload(&key, encoded.data, encoded.content_type)
            .await?;

        info!(image = url, destination = %uri, "Image compressed and stored");
        Ok(uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::storage::MockBlobStore;
    use image::{Rgb, RgbImage};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn sample(format: ImageFormat) -> Vec<u8> {
        let image = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16) as u8, (y * 16) as u8, 128]));
        let mut data = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut data), format)
            .unwrap();
        data
    }

    /// Serves one fixed response to every connection and returns its base URL.
    async fn serve(status: &'static str, content_type: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = socket.read(&mut buf).await;
                    let head = format!(
                        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status,
                        content_type,
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}", addr)
    }

    #[test]
    fn jpeg_is_recompressed_as_jpeg() {
        let encoded = transcode(&sample(ImageFormat::Jpeg), 60).unwrap();
        assert_eq!(encoded.extension, "jpg");
        assert_eq!(encoded.content_type, "image/jpeg");
        assert_eq!(image::guess_format(&encoded.data).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn png_is_reencoded_as_png() {
        let encoded = transcode(&sample(ImageFormat::Png), 60).unwrap();
        assert_eq!(encoded.extension, "png");
        assert_eq!(image::guess_format(&encoded.data).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn other_formats_are_rejected() {
        let err = transcode(&sample(ImageFormat::Bmp), 60).unwrap_err();
        assert!(matches!(err, TranscodeError::UnsupportedFormat { ref format } if format == "bmp"));
    }

    #[test]
    fn formats_without_codecs_are_rejected_by_signature() {
        let gif = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;";
        let err = transcode(gif, 60).unwrap_err();
        assert!(matches!(err, TranscodeError::UnsupportedFormat { ref format } if format == "gif"));

        let webp = b"RIFF\x1a\x00\x00\x00WEBPVP8L\x0d\x00\x00\x00";
        let err = transcode(webp, 60).unwrap_err();
        assert!(matches!(err, TranscodeError::UnsupportedFormat { ref format } if format == "webp"));
    }

    #[test]
    fn garbage_fails_to_decode() {
        let err = transcode(b"definitely not an image", 60).unwrap_err();
        assert!(matches!(err, TranscodeError::Decode(_)));
    }

    #[test]
    fn object_keys_are_unique_and_prefixed() {
        let transcoder = Transcoder::new(Arc::new(MockBlobStore::new()), 60, "/compressed/").unwrap();
        let a = transcoder.object_key("jpg");
        let b = transcoder.object_key("jpg");

        assert!(a.starts_with("compressed/"));
        assert!(a.ends_with(".jpg"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn uploads_compressed_jpeg() {
        let base = serve("200 OK", "image/jpeg", sample(ImageFormat::Jpeg)).await;

        let mut store = MockBlobStore::new();
        store
            .expect_upload()
            .withf(|key, data, content_type| {
                key.starts_with("compressed/")
                    && key.ends_with(".jpg")
                    && !data.is_empty()
                    && content_type == "image/jpeg"
            })
            .times(1)
            .returning(|key, _, _| Ok(format!("s3://bucket/{}", key)));

        let transcoder = Transcoder::new(Arc::new(store), 60, "compressed").unwrap();
        let uri = transcoder
            .process_image(&format!("{}/a.jpg", base))
            .await
            .unwrap();

        assert!(uri.starts_with("s3://bucket/compressed/"));
    }

    #[tokio::test]
    async fn rejects_non_image_content_type() {
        let base = serve("200 OK", "text/html", b"<html></html>".to_vec()).await;

        let mut store = MockBlobStore::new();
        store.expect_upload().times(0);

        let transcoder = Transcoder::new(Arc::new(store), 60, "compressed").unwrap();
        let err = transcoder
            .process_image(&format!("{}/a.jpg", base))
            .await
            .unwrap_err();

        assert!(matches!(err, TranscodeError::NotAnImage { ref content_type, .. } if content_type == "text/html"));
    }

    #[tokio::test]
    async fn accepts_mixed_case_image_content_type() {
        let base = serve("200 OK", "Image/JPEG", sample(ImageFormat::Jpeg)).await;

        let mut store = MockBlobStore::new();
        store
            .expect_upload()
            .times(1)
            .returning(|key, _, _| Ok(format!("s3://bucket/{}", key)));

        let transcoder = Transcoder::new(Arc::new(store), 60, "compressed").unwrap();
        let uri = transcoder
            .process_image(&format!("{}/a.jpg", base))
            .await
            .unwrap();

        assert!(uri.ends_with(".jpg"));
    }

    #[test]
    fn media_type_check_ignores_case_only() {
        assert!(is_image_media_type("image/png"));
        assert!(is_image_media_type("IMAGE/webp; charset=binary"));
        assert!(!is_image_media_type("text/html"));
        assert!(!is_image_media_type("imag"));
        assert!(!is_image_media_type(""));
    }

    #[test]
    fn builds_with_default_client() {
        let transcoder = Transcoder::new(Arc::new(MockBlobStore::new()), 75, "out");
        assert!(transcoder.is_ok());
    }

    #[tokio::test]
    async fn rejects_error_status() {
        let base = serve("404 Not Found", "text/plain", b"missing".to_vec()).await;

        let transcoder = Transcoder::new(Arc::new(MockBlobStore::new()), 60, "compressed").unwrap();
        let err = transcoder
            .process_image(&format!("{}/missing.jpg", base))
            .await
            .unwrap_err();

        assert!(matches!(err, TranscodeError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn upload_failure_is_transient() {
        let base = serve("200 OK", "image/png", sample(ImageFormat::Png)).await;

        let mut store = MockBlobStore::new();
        store.expect_upload().returning(|key, _, _| {
            Err(StorageError::UploadFailed {
                key: key.to_string(),
                message: "slow down".into(),
            })
        });

        let transcoder = Transcoder::new(Arc::new(store), 60, "compressed").unwrap();
        let err = transcoder
            .process_image(&format!("{}/a.png", base))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Transient);
    }
}
