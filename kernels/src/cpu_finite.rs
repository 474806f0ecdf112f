use crate::KernelElem;
use rayon::prelude::*;

/// Returns `true` if no element is NaN or infinite.
///
/// Integer element types are always finite. An empty slice is finite.
pub fn cpu_all_finite<T>(data: &[T]) -> bool
where
    T: KernelElem,
{
    data.par_iter()
        .all(|x| x.to_f64().is_some_and(f64::is_finite))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finite_values() {
        assert!(cpu_all_finite(&[1.0f32, -2.0, 0.0]));
        assert!(cpu_all_finite::<f32>(&[]));
        assert!(cpu_all_finite(&[3i32, 4]));
    }

    #[test]
    fn test_non_finite_values() {
        assert!(!cpu_all_finite(&[1.0f32, f32::NAN]));
        assert!(!cpu_all_finite(&[f32::INFINITY]));
        assert!(!cpu_all_finite(&[f64::NEG_INFINITY, 0.0]));
    }
}
