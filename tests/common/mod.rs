#![allow(dead_code)]

use std::path::Path;

use image::{GrayImage, Luma, Rgb, RgbImage};

/// Writes one sample in the `<id>/images/<id>.png`, `<id>/masks/*.png` layout
/// with a bright square per `(x, y, side)`.
pub fn write_sample(root: &Path, id: &str, size: u32, squares: &[(u32, u32, u32)]) {
    let dir = root.join(id);
    std::fs::create_dir_all(dir.join("images")).unwrap();
    std::fs::create_dir_all(dir.join("masks")).unwrap();

    let mut rgb = RgbImage::from_pixel(size, size, Rgb([20, 20, 30]));
    for (i, &(x, y, side)) in squares.iter().enumerate() {
        let mut mask = GrayImage::new(size, size);
        for py in y..(y + side).min(size) {
            for px in x..(x + side).min(size) {
                mask.put_pixel(px, py, Luma([255]));
                rgb.put_pixel(px, py, Rgb([220, 210, 230]));
            }
        }
        mask.save(dir.join("masks").join(format!("{}_{}.png", id, i))).unwrap();
    }
    rgb.save(dir.join("images").join(format!("{}.png", id))).unwrap();
}

/// `count` samples of `size x size`, two squares each at varying positions.
pub fn write_dataset(root: &Path, count: u32, size: u32) {
    for i in 0..count {
        let offset = (i * 3) % (size / 4);
        write_sample(
            root,
            &format!("cell{:02}", i),
            size,
            &[(offset, offset, size / 4), (size / 2 + offset / 2, size / 2, size / 5)],
        );
    }
}
