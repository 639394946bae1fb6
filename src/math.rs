use ndarray::{Array1, Array2, ArrayView1};
use ndarray_linalg::LeastSquaresSvd;

use crate::Result;

/// Generate the Vandermonde matrix of `degree` for observations `x`
///
/// The Vandermonde matrix is a (n x degree + 1) matrix. Each row of the matrix is a geometric
/// progression for an individual observation `x` from power `0` to `degree` inclusive.
///
/// # Examples
///
/// ```
/// use dose_margin::math::vandermonde;
/// use ndarray::arr2;
///
/// let vander = vandermonde(&[2., 3.], 2);
///
/// let expected = arr2(&[[1., 2., 4.], [1., 3., 9.]]);
/// assert_eq!(vander, expected);
/// ```
pub fn vandermonde(x: &[f64], degree: usize) -> Array2<f64> {
    let mut vander = Array2::zeros((x.len(), degree + 1));
    for (mut row, &xi) in vander.rows_mut().into_iter().zip(x) {
        let mut power = 1.0;
        for element in &mut row {
            *element = power;
            power *= xi;
        }
    }
    vander
}

/// Least-squares polynomial coefficients, lowest power first
///
/// # Errors
/// Returns an error if LAPACK fails to compute the SVD of the Vandermonde matrix.
pub fn polynomial_least_squares(x: &[f64], y: &[f64], degree: usize) -> Result<Array1<f64>> {
    let vander = vandermonde(x, degree);
    let rhs = Array1::from(y.to_vec());
    let result = vander.least_squares(&rhs)?;
    Ok(result.solution)
}

/// Trapezoidal integral of `y` over the abscissa `x`
pub fn trapezoid(x: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    x.windows(2)
        .into_iter()
        .zip(y.windows(2))
        .map(|(xs, ys)| 0.5 * (xs[1] - xs[0]) * (ys[0] + ys[1]))
        .sum()
}

/// Coefficients `wᵢ` with `Σ wᵢ·yᵢ` equal to [`trapezoid`] over `x`
pub fn trapezoid_weights(x: ArrayView1<f64>) -> Array1<f64> {
    let mut weights = Array1::zeros(x.len());
    for (ii, pair) in x.windows(2).into_iter().enumerate() {
        let half = 0.5 * (pair[1] - pair[0]);
        weights[ii] += half;
        weights[ii + 1] += half;
    }
    weights
}

/// Average a matrix with its transpose, removing rounding asymmetry
pub fn symmetrise(a: &Array2<f64>) -> Array2<f64> {
    (a + &a.t()) * 0.5
}

/// Median of a slice, ignoring ordering of the input
pub(crate) fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        0.5 * (sorted[mid - 1] + sorted[mid])
    } else {
        sorted[mid]
    }
}

/// Smallest and largest element, or `None` for an empty input
pub(crate) fn extent(values: impl IntoIterator<Item = f64>) -> Option<(f64, f64)> {
    values.into_iter().fold(None, |acc, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}
