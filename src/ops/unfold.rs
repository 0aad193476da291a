use std::ops::Range;

use ndarray::prelude::*;

/// Extracts, for every pixel, the `kernel_size² - 1` dilated neighbors
/// around it, leaving out the center.
///
/// Padding is SAME (`(k + (d - 1)(k - 1)) / 2`) with zero fill, so the output
/// keeps the input's spatial size. The neighbor axis follows the row-major
/// order of the kernel window with the center entry removed.
///
/// Output layout: `(batch, channel, k² - 1, height, width)`.
///
/// # Panics
///
/// Panics if `kernel_size` is even or `dilation` is zero.
pub fn unfold_without_center(
    x: ArrayView4<f32>,
    kernel_size: usize,
    dilation: usize,
) -> Array5<f32> {
    assert!(
        kernel_size % 2 == 1,
        "kernel size must be odd, got {kernel_size}"
    );
    assert!(dilation >= 1, "dilation must be at least 1");

    let (batch, channels, height, width) = x.dim();
    let padding = (kernel_size + (dilation - 1) * (kernel_size - 1)) / 2;
    let window = kernel_size * kernel_size;
    let center = window / 2;

    let mut unfolded = Array5::<f32>::zeros((batch, channels, window - 1, height, width));

    let neighbors = (0..window).filter(|&i| i != center);
    for (n, i) in neighbors.enumerate() {
        let dy = (i / kernel_size * dilation) as isize - padding as isize;
        let dx = (i % kernel_size * dilation) as isize - padding as isize;

        let (Some((dst_y, src_y)), Some((dst_x, src_x))) =
            (shifted(height, dy), shifted(width, dx))
        else {
            // the whole window position falls in the padding
            continue;
        };

        unfolded
            .slice_mut(s![.., .., n, dst_y, dst_x])
            .assign(&x.slice(s![.., .., src_y, src_x]));
    }

    unfolded
}

/// Destination and source ranges along one axis for a read at `index + shift`.
fn shifted(len: usize, shift: isize) -> Option<(Range<usize>, Range<usize>)> {
    let magnitude = shift.unsigned_abs();
    if magnitude >= len {
        return None;
    }
    if shift >= 0 {
        Some((0..len - magnitude, magnitude..len))
    } else {
        Some((magnitude..len, 0..len - magnitude))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(batch: usize, channels: usize, height: usize, width: usize) -> Array4<f32> {
        Array4::from_shape_fn((batch, channels, height, width), |(b, c, y, x)| {
            (b * 1000 + c * 100 + y * 10 + x) as f32
        })
    }

    #[test]
    fn test_same_size_output() {
        for kernel_size in [3, 5, 7] {
            for dilation in [1, 2, 3] {
                let x = ramp(2, 3, 9, 11);
                let unfolded = unfold_without_center(x.view(), kernel_size, dilation);
                assert_eq!(
                    unfolded.shape(),
                    &[2, 3, kernel_size * kernel_size - 1, 9, 11]
                );
            }
        }
    }

    #[test]
    fn test_neighbor_order_and_zero_padding() {
        let x = ramp(1, 1, 5, 5);
        let unfolded = unfold_without_center(x.view(), 3, 1);

        // neighbor 0 is the top-left offset (-1, -1)
        assert_eq!(unfolded[[0, 0, 0, 2, 2]], x[[0, 0, 1, 1]]);
        // neighbor 3 is (0, -1), neighbor 4 is (0, +1) since the center is skipped
        assert_eq!(unfolded[[0, 0, 3, 2, 2]], x[[0, 0, 2, 1]]);
        assert_eq!(unfolded[[0, 0, 4, 2, 2]], x[[0, 0, 2, 3]]);
        // neighbor 7 is the bottom-right offset (+1, +1)
        assert_eq!(unfolded[[0, 0, 7, 2, 2]], x[[0, 0, 3, 3]]);
        // reads outside the image are zero
        assert_eq!(unfolded[[0, 0, 0, 0, 0]], 0.0);
        assert_eq!(unfolded[[0, 0, 7, 4, 4]], 0.0);
    }

    #[test]
    fn test_dilated_offsets() {
        let x = ramp(1, 2, 8, 8);
        let unfolded = unfold_without_center(x.view(), 3, 2);

        assert_eq!(unfolded[[0, 1, 0, 4, 4]], x[[0, 1, 2, 2]]);
        assert_eq!(unfolded[[0, 1, 7, 4, 4]], x[[0, 1, 6, 6]]);
        assert_eq!(unfolded[[0, 1, 1, 1, 5]], 0.0);
    }

    #[test]
    fn test_dilation_larger_than_image() {
        let x = ramp(1, 1, 2, 2);
        let unfolded = unfold_without_center(x.view(), 3, 4);
        assert!(unfolded.iter().all(|v| *v == 0.0));
    }

    #[test]
    #[should_panic(expected = "kernel size must be odd")]
    fn test_even_kernel_panics() {
        let x = ramp(1, 1, 4, 4);
        unfold_without_center(x.view(), 2, 1);
    }
}
