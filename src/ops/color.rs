use ndarray::prelude::*;
use palette::{FromColor, Lab, LinSrgb, Srgb};

/// Converts a byte image in CHW layout to CIE Lab (D65 white point).
///
/// `channels` gives the plane index of red, green and blue in `image`, so BGR
/// inputs can be converted without a copy. The output is always `(L, a, b)`.
pub fn rgb_to_lab(image: ArrayView3<u8>, channels: [usize; 3]) -> Array3<f32> {
    let (_, height, width) = image.dim();
    let [r, g, b] = channels;
    let mut lab = Array3::<f32>::zeros((3, height, width));

    for y in 0..height {
        for x in 0..width {
            let srgb: Srgb<f32> =
                Srgb::new(image[[r, y, x]], image[[g, y, x]], image[[b, y, x]]).into_format();
            let linear: LinSrgb<f32> = srgb.into_linear();
            let color: Lab = Lab::from_color(linear);
            lab[[0, y, x]] = color.l;
            lab[[1, y, x]] = color.a;
            lab[[2, y, x]] = color.b;
        }
    }

    lab
}
