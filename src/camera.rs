use crate::config::{CameraConfig, SourceKind};
use crate::domain::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageBuffer, ImageFormat, Rgb};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameSourceError {
    #[error("Failed to open camera {0}: {1}")]
    OpenCameraFailed(String, String),
    #[error("Failed to read frame: {0}")]
    ReadFrameFailed(String),
    #[error("Timed out after {0} ms waiting for a frame")]
    ReadTimeout(u64),
    #[error("Failed to encode frame: {0}")]
    EncodeFrameFailed(String),
    #[error("Capture devices need the `camera` feature")]
    DeviceUnsupported,
    #[error("Frame source was already released")]
    Released,
}

/// Anything that hands out encoded frames at the caller's pace.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Frame, FrameSourceError>;
    fn release(&mut self);
}

#[async_trait]
impl FrameSource for Box<dyn FrameSource> {
    async fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
        (**self).next_frame().await
    }

    fn release(&mut self) {
        (**self).release()
    }
}

pub fn open_source(config: &CameraConfig) -> Result<Box<dyn FrameSource>, FrameSourceError> {
    match config.source {
        SourceKind::Synthetic => {
            tracing::info!("Using synthetic frame source");
            Ok(Box::new(SyntheticSource::new(config.width, config.height)?))
        }
        #[cfg(feature = "camera")]
        SourceKind::Device => Ok(Box::new(device::DeviceSource::open(config)?)),
        #[cfg(not(feature = "camera"))]
        SourceKind::Device => Err(FrameSourceError::DeviceUnsupported),
    }
}

/// Releases the wrapped source exactly once, on explicit release or on drop,
/// whichever comes first.
pub struct CaptureGuard<S: FrameSource> {
    source: S,
    released: bool,
}

impl<S: FrameSource> CaptureGuard<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            released: false,
        }
    }

    pub async fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
        if self.released {
            return Err(FrameSourceError::Released);
        }
        self.source.next_frame().await
    }

    pub fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.source.release();
        }
    }
}

impl<S: FrameSource> Drop for CaptureGuard<S> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Gradient test card, encoded once and replayed for every frame.
pub struct SyntheticSource {
    encoded: Bytes,
    sequence: u64,
    released: bool,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32) -> Result<Self, FrameSourceError> {
        Ok(Self {
            encoded: encode_gradient(width, height)?,
            sequence: 0,
            released: false,
        })
    }
}

fn encode_gradient(width: u32, height: u32) -> Result<Bytes, FrameSourceError> {
    let img = ImageBuffer::from_fn(width, height, |_, y| {
        let red = (255 * y / height) as u8;
        let green = (255 * (height - y) / height) as u8;
        Rgb([red, green, 128u8])
    });

    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
        .map_err(|e| FrameSourceError::EncodeFrameFailed(e.to_string()))?;
    Ok(Bytes::from(buffer))
}

#[async_trait]
impl FrameSource for SyntheticSource {
    async fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
        if self.released {
            return Err(FrameSourceError::Released);
        }
        let frame = Frame::new(self.sequence, self.encoded.clone());
        self.sequence += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        self.released = true;
    }
}

#[cfg(feature = "camera")]
mod device {
    use super::{FrameSource, FrameSourceError};
    use crate::config::CameraConfig;
    use crate::domain::Frame;
    use async_trait::async_trait;
    use opencv::{core::Mat, core::Vector, imgcodecs, prelude::*, videoio};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    const MAX_EMPTY_READS: usize = 5;

    pub struct DeviceSource {
        capture: Arc<Mutex<videoio::VideoCapture>>,
        read_timeout_ms: u64,
        sequence: u64,
    }

    impl DeviceSource {
        pub fn open(config: &CameraConfig) -> Result<Self, FrameSourceError> {
            let open_failed =
                |e: opencv::Error| FrameSourceError::OpenCameraFailed(config.device.clone(), e.to_string());

            let mut capture = match config.device.parse::<i32>() {
                Ok(index) => videoio::VideoCapture::new(index, videoio::CAP_ANY),
                Err(_) => videoio::VideoCapture::from_file(&config.device, videoio::CAP_ANY),
            }
            .map_err(open_failed)?;

            if !capture.is_opened().map_err(open_failed)? {
                return Err(FrameSourceError::OpenCameraFailed(
                    config.device.clone(),
                    "device did not open".to_string(),
                ));
            }

            capture
                .set(videoio::CAP_PROP_FRAME_WIDTH, config.width as f64)
                .map_err(open_failed)?;
            capture
                .set(videoio::CAP_PROP_FRAME_HEIGHT, config.height as f64)
                .map_err(open_failed)?;
            capture
                .set(videoio::CAP_PROP_FPS, config.fps as f64)
                .map_err(open_failed)?;

            tracing::info!("Opened capture device {}", config.device);
            Ok(Self {
                capture: Arc::new(Mutex::new(capture)),
                read_timeout_ms: config.read_timeout_ms,
                sequence: 0,
            })
        }
    }

    fn read_encoded(capture: &Mutex<videoio::VideoCapture>) -> Result<Vec<u8>, FrameSourceError> {
        let mut cam = capture.lock();
        let mut frame = Mat::default();
        for _ in 0..MAX_EMPTY_READS {
            let ok = cam
                .read(&mut frame)
                .map_err(|e| FrameSourceError::ReadFrameFailed(e.to_string()))?;
            if ok && !frame.empty() {
                let mut buf = Vector::<u8>::new();
                imgcodecs::imencode(".jpg", &frame, &mut buf, &Vector::new())
                    .map_err(|e| FrameSourceError::EncodeFrameFailed(e.to_string()))?;
                return Ok(buf.into());
            }
            // File-backed sources loop back to the start instead of ending.
            cam.set(videoio::CAP_PROP_POS_FRAMES, 0.0)
                .map_err(|e| FrameSourceError::ReadFrameFailed(e.to_string()))?;
        }
        Err(FrameSourceError::ReadFrameFailed(format!(
            "no frame after {} attempts",
            MAX_EMPTY_READS
        )))
    }

    #[async_trait]
    impl FrameSource for DeviceSource {
        async fn next_frame(&mut self) -> Result<Frame, FrameSourceError> {
            let capture = self.capture.clone();
            let read = tokio::task::spawn_blocking(move || read_encoded(&capture));

            let data = timeout(Duration::from_millis(self.read_timeout_ms), read)
                .await
                .map_err(|_| FrameSourceError::ReadTimeout(self.read_timeout_ms))?
                .map_err(|e| FrameSourceError::ReadFrameFailed(e.to_string()))??;

            let frame = Frame::new(self.sequence, data);
            self.sequence += 1;
            Ok(frame)
        }

        fn release(&mut self) {
            release_detached(self.capture.clone(), |cam| {
                if let Err(e) = cam.release() {
                    tracing::warn!("Failed to release capture device: {}", e);
                }
            });
        }
    }

    /// Runs `release` on the blocking pool. A timed-out read may still hold
    /// the capture lock, and waiting for it here would stall the runtime.
    fn release_detached<T: Send + 'static>(
        capture: Arc<Mutex<T>>,
        release: impl FnOnce(&mut T) + Send + 'static,
    ) {
        let job = move || {
            let mut guard = capture.lock();
            release(&mut *guard);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

}
