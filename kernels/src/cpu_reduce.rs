use crate::{KernelElem, KernelError, Result};
use rayon::prelude::*;

/// Element-wise sum of `inputs`.
///
/// All inputs must have the same length. The output is computed in parallel
/// over element positions, so each output element accumulates its inputs in
/// the order they were given. That keeps the result deterministic regardless
/// of how rayon schedules the work.
pub fn cpu_add_n<T>(inputs: &[&[T]]) -> Result<Vec<T>>
where
    T: KernelElem,
{
    let first = inputs.first().ok_or(KernelError::EmptyInput)?;
    let len = first.len();
    if let Some(bad) = inputs.iter().find(|x| x.len() != len) {
        return Err(KernelError::ShapeMismatch {
            expected: vec![len],
            got: vec![bad.len()],
        });
    }

    let mut out = first.to_vec();
    out.par_iter_mut().enumerate().for_each(|(i, acc)| {
        for input in &inputs[1..] {
            *acc += input[i];
        }
    });
    Ok(out)
}

/// Multiplies every element by `factor`.
pub fn cpu_scale<T>(data: &[T], factor: T) -> Vec<T>
where
    T: KernelElem,
{
    data.par_iter().map(|&x| x * factor).collect()
}

/// `y += alpha * x`, in place.
///
/// This is the update rule of plain gradient descent when `alpha` is the
/// negated learning rate.
pub fn cpu_axpy<T>(y: &mut [T], alpha: T, x: &[T]) -> Result<()>
where
    T: KernelElem,
{
    if y.len() != x.len() {
        return Err(KernelError::ShapeMismatch {
            expected: vec![y.len()],
            got: vec![x.len()],
        });
    }

    y.par_iter_mut().zip(x.par_iter()).for_each(|(y, &x)| {
        *y += alpha * x;
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_n_three_inputs() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [10.0f32, 20.0, 30.0];
        let c = [100.0f32, 200.0, 300.0];

        let out = cpu_add_n(&[&a, &b, &c]).unwrap();
        assert_eq!(out, vec![111.0, 222.0, 333.0]);
    }

    #[test]
    fn test_add_n_single_input_is_copy() {
        let a = [0.1f32, -7.5];
        let out = cpu_add_n(&[&a]).unwrap();
        assert_eq!(out, a.to_vec());
    }

    #[test]
    fn test_add_n_length_mismatch() {
        let a = [1.0f32, 2.0];
        let b = [1.0f32];
        assert!(matches!(
            cpu_add_n(&[&a, &b]),
            Err(KernelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_add_n_empty() {
        let inputs: [&[f32]; 0] = [];
        assert!(matches!(cpu_add_n(&inputs), Err(KernelError::EmptyInput)));
    }

    #[test]
    fn test_scale() {
        assert_eq!(cpu_scale(&[2.0f32, -4.0], 0.25), vec![0.5, -1.0]);
    }

    #[test]
    fn test_axpy() {
        let mut y = vec![1.0f32, 1.0];
        cpu_axpy(&mut y, -0.5, &[2.0, 4.0]).unwrap();
        assert_eq!(y, vec![0.0, -1.0]);
    }

    #[test]
    fn test_axpy_mismatch() {
        let mut y = vec![1.0f32];
        assert!(cpu_axpy(&mut y, 1.0, &[1.0, 2.0]).is_err());
    }
}
