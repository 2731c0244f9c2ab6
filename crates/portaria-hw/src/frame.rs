//! Frame type and pixel conversion — YUYV/GREY to RGB24, luma, dark detection.

/// A captured camera frame in packed RGB24.
#[derive(Clone)]
pub struct Frame {
    /// RGB pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
    pub is_dark: bool,
}

impl Frame {
    /// Build a frame from RGB24 data, validating its length.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        let is_dark = is_dark_frame(&rgb_to_luma(&data), DARK_THRESHOLD);
        Ok(Self {
            data,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence,
            is_dark,
        })
    }

    /// Per-pixel luma (BT.601), for grayscale consumers such as OCR.
    pub fn luma(&self) -> Vec<u8> {
        rgb_to_luma(&self.data)
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let luma = self.luma();
        if luma.is_empty() {
            return 0.0;
        }
        luma.iter().map(|&b| b as f32).sum::<f32>() / luma.len() as f32
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish_non_exhaustive()
    }
}

/// Fraction of pixels in the darkest bucket above which a frame is dark.
pub const DARK_THRESHOLD: f32 = 0.95;

/// Convert packed YUYV (4:2:2) to RGB24 with BT.601 coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    let mut rgb = Vec::with_capacity(expected / 2 * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

/// Expand 8-bit grayscale to RGB24.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize;
    if gray.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: gray.len(),
        });
    }
    Ok(gray[..expected].iter().flat_map(|&g| [g, g, g]).collect())
}

pub fn rgb_to_luma(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|p| {
            let y = 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32;
            y.round().clamp(0.0, 255.0) as u8
        })
        .collect()
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = u as f32 - 128.0;
    let cr = v as f32 - 128.0;
    let clamp = |c: f32| c.round().clamp(0.0, 255.0) as u8;
    [
        clamp(y + 1.402 * cr),
        clamp(y - 0.344_136 * cb - 0.714_136 * cr),
        clamp(y + 1.772 * cb),
    ]
}

/// Check if a frame is dark: more than `threshold_pct` of pixels below 32.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark_count = gray.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / gray.len() as f32) > threshold_pct
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}
