use burn::prelude::*;

/// Mirror padding on H and W (edge pixel excluded, like `numpy` `reflect`).
///
/// `pad` must be smaller than both spatial sizes.
pub fn reflect_pad<B: Backend>(x: Tensor<B, 4>, pad: usize) -> Tensor<B, 4> {
    if pad == 0 {
        return x;
    }
    let [batch, channels, height, width] = x.dims();
    assert!(
        pad < height && pad < width,
        "reflect padding {} needs a feature map larger than {}x{}",
        pad,
        height,
        width
    );

    let top = x.clone().slice([0..batch, 0..channels, 1..pad + 1, 0..width]).flip([2]);
    let bottom = x
        .clone()
        .slice([0..batch, 0..channels, height - 1 - pad..height - 1, 0..width])
        .flip([2]);
    let x = Tensor::cat(vec![top, x, bottom], 2);

    let height = height + 2 * pad;
    let left = x.clone().slice([0..batch, 0..channels, 0..height, 1..pad + 1]).flip([3]);
    let right = x
        .clone()
        .slice([0..batch, 0..channels, 0..height, width - 1 - pad..width - 1])
        .flip([3]);
    Tensor::cat(vec![left, x, right], 3)
}

/// Crops the spatial center of `x` to `height x width`.
///
/// The offset on each axis is `floor((size - target) / 2)`.
pub fn center_crop<B: Backend>(x: Tensor<B, 4>, height: usize, width: usize) -> Tensor<B, 4> {
    let [batch, channels, h, w] = x.dims();
    assert!(
        h >= height && w >= width,
        "cannot crop {}x{} feature map to {}x{}",
        h,
        w,
        height,
        width
    );
    let y = (h - height) / 2;
    let x0 = (w - width) / 2;
    x.slice([0..batch, 0..channels, y..y + height, x0..x0 + width])
}
