//! Raw V4L2 buffer → 8-bit grayscale conversions.

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("short buffer for {format}: expected {expected} bytes, got {actual}")]
    InvalidLength {
        format: &'static str,
        expected: usize,
        actual: usize,
    },
}

fn check_len(buf: &[u8], format: &'static str, expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            format,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Convert packed YUYV (4:2:2) to grayscale by keeping the Y samples.
///
/// Two pixels share four bytes: `[Y0, U, Y1, V]`.
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    check_len(yuyv, "YUYV", expected)?;
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Convert 16-bit little-endian luminance to 8-bit by keeping the high byte.
pub fn y16_to_grayscale(y16: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize * 2;
    check_len(y16, "Y16", expected)?;
    Ok(y16[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// GREY is already 8-bit luminance; drop any driver padding past the image.
pub fn grey_passthrough(grey: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = width as usize * height as usize;
    check_len(grey, "GREY", expected)?;
    Ok(grey[..expected].to_vec())
}
