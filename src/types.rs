use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};

use crate::error::{Error, Result};

/// Single-channel confidence map, one `f32` per image pixel.
pub type ProbabilityMap = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Normalized image in channel-major (`C x H x W`) layout.
///
/// Values are expected in `[0, 1]` once they reach the network.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    height: usize,
    width: usize,
    channels: usize,
    data: Vec<f32>,
}

impl Image {
    pub fn new(height: usize, width: usize, channels: usize, data: Vec<f32>) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(Error::EmptyImage { height, width });
        }
        if channels != 1 && channels != 3 {
            return Err(Error::InvalidConfig(format!(
                "images must have 1 or 3 channels, got {}",
                channels
            )));
        }
        if data.len() != height * width * channels {
            return Err(Error::Tensor(format!(
                "buffer of {} values does not match {}x{}x{}",
                data.len(),
                channels,
                height,
                width
            )));
        }
        Ok(Self {
            height,
            width,
            channels,
            data,
        })
    }

    pub fn zeros(height: usize, width: usize, channels: usize) -> Result<Self> {
        Self::new(height, width, channels, vec![0.0; height * width * channels])
    }

    /// Converts a decoded image into a normalized `[0, 1]` buffer.
    pub fn from_dynamic(img: &DynamicImage, color: bool) -> Result<Self> {
        let (width, height) = (img.width() as usize, img.height() as usize);
        if color {
            let rgb = img.to_rgb8();
            let mut data = Vec::with_capacity(3 * width * height);
            for c in 0..3 {
                data.extend(rgb.pixels().map(|p| p[c] as f32 / 255.0));
            }
            Self::new(height, width, 3, data)
        } else {
            let gray = img.to_luma8();
            let data = gray.pixels().map(|p| p[0] as f32 / 255.0).collect();
            Self::new(height, width, 1, data)
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[(c * self.height + y) * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, c: usize, y: usize, x: usize, value: f32) {
        self.data[(c * self.height + y) * self.width + x] = value;
    }

    /// Appends a `channels x patch x patch` crop starting at `(x, y)`.
    ///
    /// Pixels outside the image are written as zero.
    pub fn write_patch(&self, x: usize, y: usize, patch: usize, out: &mut Vec<f32>) {
        for c in 0..self.channels {
            for py in 0..patch {
                let sy = y + py;
                for px in 0..patch {
                    let sx = x + px;
                    if sy < self.height && sx < self.width {
                        out.push(self.get(c, sy, sx));
                    } else {
                        out.push(0.0);
                    }
                }
            }
        }
    }

    /// Copies a `(y, x, h, w)` region into a new image.
    pub fn crop(&self, y: usize, x: usize, height: usize, width: usize) -> Result<Self> {
        if y + height > self.height || x + width > self.width {
            return Err(Error::Window(format!(
                "crop ({}, {}, {}, {}) exceeds {}x{} image",
                y, x, height, width, self.height, self.width
            )));
        }
        let mut data = Vec::with_capacity(self.channels * height * width);
        for c in 0..self.channels {
            for row in y..y + height {
                let start = (c * self.height + row) * self.width + x;
                data.extend_from_slice(&self.data[start..start + width]);
            }
        }
        Self::new(height, width, self.channels, data)
    }

    pub fn flip_horizontal(&mut self) {
        for c in 0..self.channels {
            for y in 0..self.height {
                let start = (c * self.height + y) * self.width;
                self.data[start..start + self.width].reverse();
            }
        }
    }

    pub fn flip_vertical(&mut self) {
        for c in 0..self.channels {
            for y in 0..self.height / 2 {
                let top = (c * self.height + y) * self.width;
                let bottom = (c * self.height + self.height - 1 - y) * self.width;
                for x in 0..self.width {
                    self.data.swap(top + x, bottom + x);
                }
            }
        }
    }

    /// Bilinear resize of every channel.
    pub fn resize(&self, height: usize, width: usize) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(Error::EmptyImage { height, width });
        }
        let plane = self.height * self.width;
        let mut data = Vec::with_capacity(self.channels * height * width);
        for c in 0..self.channels {
            let channel: ProbabilityMap = ImageBuffer::from_raw(
                self.width as u32,
                self.height as u32,
                self.data[c * plane..(c + 1) * plane].to_vec(),
            )
            .ok_or_else(|| Error::Tensor("channel plane size mismatch".to_string()))?;
            let resized = imageops::resize(
                &channel,
                width as u32,
                height as u32,
                FilterType::Triangle,
            );
            data.extend(resized.into_raw());
        }
        Self::new(height, width, self.channels, data)
    }

    /// 8-bit RGB rendering, used when saving images next to results.
    pub fn to_rgb8(&self) -> RgbImage {
        let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        RgbImage::from_fn(self.width as u32, self.height as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            if self.channels == 3 {
                Rgb([
                    to_u8(self.get(0, y, x)),
                    to_u8(self.get(1, y, x)),
                    to_u8(self.get(2, y, x)),
                ])
            } else {
                let v = to_u8(self.get(0, y, x));
                Rgb([v, v, v])
            }
        })
    }
}

/// Half-open pixel rectangle `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl Bounds {
    pub fn intersect(&self, other: &Bounds) -> Option<Bounds> {
        let b = Bounds {
            x0: self.x0.max(other.x0),
            y0: self.y0.max(other.y0),
            x1: self.x1.min(other.x1),
            y1: self.y1.min(other.y1),
        };
        (b.x0 < b.x1 && b.y0 < b.y1).then_some(b)
    }
}

/// Binary mask of a single object. Non-zero pixels are foreground.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceMask {
    mask: GrayImage,
    area: u64,
    bounds: Option<Bounds>,
}

impl InstanceMask {
    pub fn from_gray(mask: GrayImage) -> Self {
        let mut area = 0u64;
        let mut bounds: Option<Bounds> = None;
        for (x, y, p) in mask.enumerate_pixels() {
            if p[0] == 0 {
                continue;
            }
            area += 1;
            bounds = Some(match bounds {
                None => Bounds {
                    x0: x,
                    y0: y,
                    x1: x + 1,
                    y1: y + 1,
                },
                Some(b) => Bounds {
                    x0: b.x0.min(x),
                    y0: b.y0.min(y),
                    x1: b.x1.max(x + 1),
                    y1: b.y1.max(y + 1),
                },
            });
        }
        Self { mask, area, bounds }
    }

    pub fn from_pixels<I>(width: u32, height: u32, pixels: I) -> Self
    where
        I: IntoIterator<Item = (u32, u32)>,
    {
        let mut mask = GrayImage::new(width, height);
        for (x, y) in pixels {
            mask.put_pixel(x, y, Luma([255]));
        }
        Self::from_gray(mask)
    }

    pub fn width(&self) -> u32 {
        self.mask.width()
    }

    pub fn height(&self) -> u32 {
        self.mask.height()
    }

    pub fn area(&self) -> u64 {
        self.area
    }

    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds
    }

    pub fn is_empty(&self) -> bool {
        self.area == 0
    }

    pub fn as_gray(&self) -> &GrayImage {
        &self.mask
    }

    #[inline]
    pub fn contains(&self, x: u32, y: u32) -> bool {
        self.mask.get_pixel(x, y)[0] != 0
    }

    /// First foreground pixel in raster order, as `(x, y)`.
    pub fn first_pixel(&self) -> Option<(u32, u32)> {
        let b = self.bounds?;
        (b.y0..b.y1)
            .flat_map(|y| (b.x0..b.x1).map(move |x| (x, y)))
            .find(|&(x, y)| self.contains(x, y))
    }

    pub fn intersection(&self, other: &InstanceMask) -> u64 {
        if self.mask.dimensions() != other.mask.dimensions() {
            return 0;
        }
        let (Some(a), Some(b)) = (self.bounds, other.bounds) else {
            return 0;
        };
        let Some(shared) = a.intersect(&b) else {
            return 0;
        };
        let mut count = 0u64;
        for y in shared.y0..shared.y1 {
            for x in shared.x0..shared.x1 {
                if self.contains(x, y) && other.contains(x, y) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Intersection over union; `0.0` when the union is empty.
    pub fn iou(&self, other: &InstanceMask) -> f64 {
        let inter = self.intersection(other);
        let union = self.area + other.area - inter;
        if union == 0 {
            0.0
        } else {
            inter as f64 / union as f64
        }
    }

    /// Nearest-neighbour resize, used to map instances back to source resolution.
    pub fn resize(&self, width: u32, height: u32) -> Self {
        Self::from_gray(imageops::resize(
            &self.mask,
            width,
            height,
            FilterType::Nearest,
        ))
    }
}
