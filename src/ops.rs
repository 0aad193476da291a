mod color;
mod interpolate;
mod unfold;

pub use color::rgb_to_lab;
pub use interpolate::{avg_pool2d, resize_bilinear, resize_bilinear_stack, upsample_bilinear};
pub use unfold::unfold_without_center;

use num_traits::Float;

pub fn sigmoid<T: Float>(x: T) -> T {
    T::one() / (T::one() + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigmoid() {
        assert_eq!(sigmoid(0.0f32), 0.5);
        assert!(sigmoid(20.0f32) > 0.999);
        assert!(sigmoid(-20.0f64) < 1e-6);
    }
}
