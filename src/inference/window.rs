use std::ops::Range;

use crate::error::{Error, Result};

/// A tile of the full image: origin plus extent.
///
/// The extent is smaller than the patch only when the image itself is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Window {
    /// Row and column ranges of the window in full-image coordinates.
    pub fn indices(&self) -> (Range<usize>, Range<usize>) {
        (self.y..self.y + self.height, self.x..self.x + self.width)
    }
}

/// Distance between consecutive window origins.
pub fn window_step(patch_size: usize, overlap: f64) -> Result<usize> {
    if patch_size == 0 {
        return Err(Error::Window("patch size must be positive".to_string()));
    }
    if !(0.0..1.0).contains(&overlap) {
        return Err(Error::Window(format!("overlap {} outside [0, 1)", overlap)));
    }
    let step = (patch_size as f64 * (1.0 - overlap)).round() as usize;
    Ok(step.max(1))
}

/// Window origins along one axis.
///
/// The last origin is pulled back so the window ends on the border.
pub fn axis_starts(dim: usize, patch_size: usize, step: usize) -> Vec<usize> {
    if dim <= patch_size {
        return vec![0];
    }
    let last = dim - patch_size;
    let mut starts: Vec<usize> = (0..dim).step_by(step).map(|s| s.min(last)).collect();
    starts.dedup();
    starts
}

/// Overlapping windows covering a `height x width` image, row-major.
pub fn sliding_windows(
    height: usize,
    width: usize,
    patch_size: usize,
    overlap: f64,
) -> Result<Vec<Window>> {
    if height == 0 || width == 0 {
        return Err(Error::EmptyImage { height, width });
    }
    let step = window_step(patch_size, overlap)?;
    let rows = axis_starts(height, patch_size, step);
    let cols = axis_starts(width, patch_size, step);

    let mut windows = Vec::with_capacity(rows.len() * cols.len());
    for &y in &rows {
        for &x in &cols {
            windows.push(Window {
                x,
                y,
                width: patch_size.min(width),
                height: patch_size.min(height),
            });
        }
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coverage(height: usize, width: usize, windows: &[Window]) -> Vec<bool> {
        let mut seen = vec![false; height * width];
        for window in windows {
            let (rows, cols) = window.indices();
            assert!(rows.end <= height && cols.end <= width, "{:?} out of bounds", window);
            for y in rows {
                for x in cols.clone() {
                    seen[y * width + x] = true;
                }
            }
        }
        seen
    }

    #[test]
    fn covers_every_pixel_with_half_overlap() {
        for &(h, w) in &[(300, 300), (228, 228), (229, 500), (1000, 640), (520, 696)] {
            let windows = sliding_windows(h, w, 228, 0.5).unwrap();
            assert!(coverage(h, w, &windows).iter().all(|&v| v), "{}x{}", h, w);
        }
    }

    #[test]
    fn tiles_300_image_with_two_windows_per_axis() {
        let windows = sliding_windows(300, 300, 228, 0.5).unwrap();
        assert_eq!(windows.len(), 4);
        assert_eq!(axis_starts(300, 228, 114), vec![0, 72]);
        assert!(windows.iter().all(|w| w.width == 228 && w.height == 228));
    }

    #[test]
    fn small_image_gets_one_window_at_origin() {
        let windows = sliding_windows(100, 150, 228, 0.5).unwrap();
        assert_eq!(
            windows,
            vec![Window {
                x: 0,
                y: 0,
                width: 150,
                height: 100
            }]
        );
    }

    #[test]
    fn rejects_degenerate_inputs() {
        assert!(matches!(
            sliding_windows(0, 10, 228, 0.5),
            Err(Error::EmptyImage { .. })
        ));
        assert!(sliding_windows(10, 10, 228, 1.0).is_err());
        assert!(sliding_windows(10, 10, 0, 0.5).is_err());
    }
}
