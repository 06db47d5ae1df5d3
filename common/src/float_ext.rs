pub trait FloatExt {
    fn approximately_eq(self, other: Self) -> bool;

    /// Clamps into `[0, 1]`; NaN maps to `None`.
    fn to_unit_interval(self) -> Option<Self>
    where
        Self: Sized;
}

impl FloatExt for f64 {
    fn approximately_eq(self, other: Self) -> bool {
        (self - other).abs() < crate::EPSILON
    }

    fn to_unit_interval(self) -> Option<Self> {
        if self.is_nan() {
            return None;
        }
        Some(self.clamp(0.0, 1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f64_approximately_eq() {
        assert!(1.0_f64.approximately_eq(1.0));
        assert!((0.1_f64 + 0.2_f64).approximately_eq(0.3));
        assert!(!1.0_f64.approximately_eq(1.0001));
        assert!(!f64::NAN.approximately_eq(f64::NAN));
    }

    #[test]
    fn unit_interval_clamps() {
        assert_eq!((-0.5_f64).to_unit_interval(), Some(0.0));
        assert_eq!(1.5_f64.to_unit_interval(), Some(1.0));
        assert_eq!(0.25_f64.to_unit_interval(), Some(0.25));
        assert_eq!(f64::NAN.to_unit_interval(), None);
    }
}
