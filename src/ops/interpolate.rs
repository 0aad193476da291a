use ndarray::{prelude::*, Zip};

/// Source sampling positions for one axis of a bilinear resize with
/// `align_corners = false`: for each output index the two input taps and the
/// weight of the second one.
fn taps(in_len: usize, out_len: usize) -> Vec<(usize, usize, f32)> {
    let scale = in_len as f32 / out_len as f32;
    (0..out_len)
        .map(|i| {
            let src = (scale * (i as f32 + 0.5) - 0.5).max(0.0);
            let i0 = (src as usize).min(in_len - 1);
            let i1 = (i0 + 1).min(in_len - 1);
            (i0, i1, src - i0 as f32)
        })
        .collect()
}

/// Bilinear resize of a single plane to `(out_h, out_w)`, half-pixel centers,
/// not corner-aligned.
pub fn resize_bilinear(input: ArrayView2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = input.dim();
    if in_h == 0 || in_w == 0 {
        return Array2::zeros((out_h, out_w));
    }
    let rows = taps(in_h, out_h);
    let cols = taps(in_w, out_w);

    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, dy) = rows[y];
        let (x0, x1, dx) = cols[x];
        let top = (1.0 - dx) * input[[y0, x0]] + dx * input[[y0, x1]];
        let bottom = (1.0 - dx) * input[[y1, x0]] + dx * input[[y1, x1]];
        (1.0 - dy) * top + dy * bottom
    })
}

/// Resizes every plane of an `(n, h, w)` stack, in parallel over `n`.
pub fn resize_bilinear_stack(input: ArrayView3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let mut output = Array3::<f32>::zeros((input.len_of(Axis(0)), out_h, out_w));
    Zip::from(output.outer_iter_mut())
        .and(input.outer_iter())
        .par_for_each(|mut dst, src| dst.assign(&resize_bilinear(src, out_h, out_w)));
    output
}

/// Integer-factor bilinear upsampling of a `(batch, n, h, w)` tensor.
pub fn upsample_bilinear(input: ArrayView4<f32>, factor: usize) -> Array4<f32> {
    let (batch, slots, height, width) = input.dim();
    let mut output = Array4::<f32>::zeros((batch, slots, height * factor, width * factor));
    for (mut dst, src) in output.outer_iter_mut().zip(input.outer_iter()) {
        dst.assign(&resize_bilinear_stack(src, height * factor, width * factor));
    }
    output
}

/// Average pooling with a square window equal to its stride and no padding.
/// Trailing rows/columns that do not fill a window are dropped.
pub fn avg_pool2d(input: ArrayView4<f32>, stride: usize) -> Array4<f32> {
    let (batch, channels, height, width) = input.dim();
    let (out_h, out_w) = (height / stride, width / stride);
    let area = (stride * stride) as f32;

    Array4::from_shape_fn((batch, channels, out_h, out_w), |(b, c, y, x)| {
        input
            .slice(s![
                b,
                c,
                y * stride..(y + 1) * stride,
                x * stride..(x + 1) * stride
            ])
            .sum()
            / area
    })
}
