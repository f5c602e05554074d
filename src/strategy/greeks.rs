// ===============================
// src/strategy/greeks.rs
// ===============================
use crate::domain::OptionRight;

/// erf via Abramowitz & Stegun 7.1.26 (|err| < 1.5e-7).
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    sign * (1.0 - poly * (-x * x).exp())
}

pub fn norm_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Black-Scholes delta of one long option. `t` in years.
/// Expired or zero-vol options fall back to intrinsic delta.
pub fn bs_delta(right: OptionRight, spot: f64, strike: f64, t: f64, vol: f64, rate: f64) -> f64 {
    if t <= 0.0 || vol <= 0.0 || spot <= 0.0 || strike <= 0.0 {
        let itm = match right {
            OptionRight::Call => spot > strike,
            OptionRight::Put => spot < strike,
        };
        return match (right, itm) {
            (OptionRight::Call, true) => 1.0,
            (OptionRight::Put, true) => -1.0,
            _ => 0.0,
        };
    }
    let d1 = ((spot / strike).ln() + (rate + 0.5 * vol * vol) * t) / (vol * t.sqrt());
    match right {
        OptionRight::Call => norm_cdf(d1),
        OptionRight::Put => norm_cdf(d1) - 1.0,
    }
}
