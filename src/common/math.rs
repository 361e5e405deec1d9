use std::ops::{Div, Mul};

/// Increases a value by the given percentage. Multiplies before dividing so
/// 256-bit values never go through floating point.
pub fn increase_by_percent<T>(n: T, percent: u64) -> T
where
    T: Mul<u64, Output = T> + Div<u64, Output = T>,
{
    n * (100 + percent) / 100
}

/// Scales a value by an integer ratio, multiplying first.
pub fn ratio<T>(n: T, numerator: u64, denominator: u64) -> T
where
    T: Mul<u64, Output = T> + Div<u64, Output = T>,
{
    n * numerator / denominator
}

#[cfg(test)]
mod tests {
    use ethers::types::U256;

    use super::*;

    #[test]
    fn test_increase_by_percent() {
        assert_eq!(increase_by_percent(U256::from(1000), 10), U256::from(1100));
        assert_eq!(increase_by_percent(U256::from(3), 10), U256::from(3));
    }

    #[test]
    fn test_ratio() {
        assert_eq!(ratio(U256::from(100_000), 3, 2), U256::from(150_000));
        assert_eq!(ratio(U256::from(100_000), 11, 10), U256::from(110_000));
    }
}
