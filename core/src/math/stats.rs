use ndarray::{Array2, ArrayView3, Axis, Zip};

pub struct StatsHelper;

impl StatsHelper {
    /// Sum of the finite values; NaN entries are skipped.
    pub fn nansum<I: IntoIterator<Item = f32>>(values: I) -> f32 {
        values.into_iter().filter(|v| !v.is_nan()).sum()
    }

    /// Mean of the non-NaN values, or NaN when there are none.
    pub fn nanmean<I: IntoIterator<Item = f32>>(values: I) -> f32 {
        let (sum, count) = values
            .into_iter()
            .filter(|v| !v.is_nan())
            .fold((0.0f64, 0usize), |(s, n), v| (s + v as f64, n + 1));
        if count == 0 {
            f32::NAN
        } else {
            (sum / count as f64) as f32
        }
    }

    /// Pixel-wise NaN-aware mean over the pulses flagged in `kept`.
    pub fn nanmean_pulses(images: ArrayView3<'_, f32>, kept: &[bool]) -> Array2<f32> {
        let (_, rows, cols) = images.dim();
        let mut sums = Array2::<f64>::zeros((rows, cols));
        let mut counts = Array2::<u32>::zeros((rows, cols));
        for (image, _) in images
            .axis_iter(Axis(0))
            .zip(kept)
            .filter(|(_, keep)| **keep)
        {
            Zip::from(&mut sums)
                .and(&mut counts)
                .and(&image)
                .for_each(|s, n, &v| {
                    if !v.is_nan() {
                        *s += v as f64;
                        *n += 1;
                    }
                });
        }
        Zip::from(&sums)
            .and(&counts)
            .map_collect(|&s, &n| if n == 0 { f32::NAN } else { (s / n as f64) as f32 })
    }

    /// Trapezoidal integral of `y` over `x`, optionally restricted to
    /// `x` values inside `range` (inclusive).
    pub fn trapz(x: &[f64], y: &[f64], range: Option<(f64, f64)>) -> f64 {
        let inside = |v: f64| range.map_or(true, |(lo, hi)| v >= lo && v <= hi);
        x.windows(2)
            .zip(y.windows(2))
            .filter(|(xs, _)| inside(xs[0]) && inside(xs[1]))
            .map(|(xs, ys)| 0.5 * (xs[1] - xs[0]) * (ys[0] + ys[1]))
            .sum()
    }
}
