//! Validation metrics

use ndarray::{Array2, Axis};

use crate::config::F1Type;

/// F1 over multi-hot matrices `[n, num_outputs]`
///
/// Per-class F1 uses zero when precision and recall are both undefined.
/// `Macro` averages classes uniformly, `Weighted` by true-positive support.
pub fn f1_score(y_true: &Array2<f64>, y_pred: &Array2<f64>, average: F1Type) -> f64 {
    let classes = y_true.ncols();
    if classes == 0 {
        return 0.0;
    }

    let mut per_class = Vec::with_capacity(classes);
    let mut support = Vec::with_capacity(classes);
    for (t, p) in y_true.axis_iter(Axis(1)).zip(y_pred.axis_iter(Axis(1))) {
        let mut tp = 0.0;
        let mut fp = 0.0;
        let mut fn_ = 0.0;
        for (&yt, &yp) in t.iter().zip(p.iter()) {
            match (yt > 0.5, yp > 0.5) {
                (true, true) => tp += 1.0,
                (false, true) => fp += 1.0,
                (true, false) => fn_ += 1.0,
                (false, false) => {}
            }
        }
        let denom = 2.0 * tp + fp + fn_;
        per_class.push(if denom > 0.0 { 2.0 * tp / denom } else { 0.0 });
        support.push(tp + fn_);
    }

    match average {
        F1Type::Macro => per_class.iter().sum::<f64>() / classes as f64,
        F1Type::Weighted => {
            let total: f64 = support.iter().sum();
            if total == 0.0 {
                0.0
            } else {
                per_class.iter().zip(support.iter()).map(|(f, s)| f * s).sum::<f64>() / total
            }
        }
    }
}
