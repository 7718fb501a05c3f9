//! Closed intervals over the extended reals.
//!
//! Infinite endpoints never meet their opposite sign in a sum: lower bounds
//! are accumulated towards `-inf` and upper bounds towards `+inf`.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub lo: f64,
    pub hi: f64,
}

fn add_lo(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY || b == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        a + b
    }
}

fn add_hi(a: f64, b: f64) -> f64 {
    if a == f64::INFINITY || b == f64::INFINITY {
        f64::INFINITY
    } else {
        a + b
    }
}

/// Product where `0 · ∞ = 0`
fn mul_bound(a: f64, b: f64) -> f64 {
    if a == 0.0 || b == 0.0 {
        0.0
    } else {
        a * b
    }
}

fn extremes(candidates: [f64; 4]) -> Interval {
    let lo = candidates.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = candidates.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Interval { lo, hi }
}

impl Interval {
    pub const ENTIRE: Interval = Interval {
        lo: f64::NEG_INFINITY,
        hi: f64::INFINITY,
    };

    pub const EMPTY: Interval = Interval {
        lo: f64::INFINITY,
        hi: f64::NEG_INFINITY,
    };

    pub const BOOLEAN: Interval = Interval { lo: 0.0, hi: 1.0 };

    pub fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    pub fn point(value: f64) -> Self {
        Self {
            lo: value,
            hi: value,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lo.is_nan() || self.hi.is_nan() || self.lo > self.hi
    }

    pub fn is_point(&self) -> bool {
        self.lo == self.hi
    }

    pub fn width(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else if self.lo.is_infinite() || self.hi.is_infinite() {
            f64::INFINITY
        } else {
            self.hi - self.lo
        }
    }

    pub fn midpoint(&self) -> f64 {
        self.lo + (self.hi - self.lo) / 2.0
    }

    pub fn contains(&self, value: f64) -> bool {
        self.lo <= value && value <= self.hi
    }

    pub fn excludes_zero(&self) -> bool {
        self.lo > 0.0 || self.hi < 0.0
    }

    pub fn is_zero(&self) -> bool {
        self.lo == 0.0 && self.hi == 0.0
    }

    pub fn intersect(&self, other: &Interval) -> Interval {
        Interval {
            lo: self.lo.max(other.lo),
            hi: self.hi.min(other.hi),
        }
    }

    pub fn hull(&self, other: &Interval) -> Interval {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        Interval {
            lo: self.lo.min(other.lo),
            hi: self.hi.max(other.hi),
        }
    }

    pub fn add(&self, other: &Interval) -> Interval {
        Interval {
            lo: add_lo(self.lo, other.lo),
            hi: add_hi(self.hi, other.hi),
        }
    }

    pub fn neg(&self) -> Interval {
        Interval {
            lo: -self.hi,
            hi: -self.lo,
        }
    }

    pub fn sub(&self, other: &Interval) -> Interval {
        self.add(&other.neg())
    }

    pub fn scale(&self, factor: f64) -> Interval {
        if factor == 0.0 {
            Interval::point(0.0)
        } else if factor > 0.0 {
            Interval {
                lo: mul_bound(self.lo, factor),
                hi: mul_bound(self.hi, factor),
            }
        } else {
            Interval {
                lo: mul_bound(self.hi, factor),
                hi: mul_bound(self.lo, factor),
            }
        }
    }

    pub fn mul(&self, other: &Interval) -> Interval {
        extremes([
            mul_bound(self.lo, other.lo),
            mul_bound(self.lo, other.hi),
            mul_bound(self.hi, other.lo),
            mul_bound(self.hi, other.hi),
        ])
    }

    /// Entire line when the divisor contains zero
    pub fn div(&self, other: &Interval) -> Interval {
        if !other.excludes_zero() {
            return Interval::ENTIRE;
        }
        self.mul(&Interval {
            lo: 1.0 / other.hi,
            hi: 1.0 / other.lo,
        })
    }

    pub fn abs(&self) -> Interval {
        if self.lo >= 0.0 {
            *self
        } else if self.hi <= 0.0 {
            self.neg()
        } else {
            Interval {
                lo: 0.0,
                hi: (-self.lo).max(self.hi),
            }
        }
    }

    pub fn min(&self, other: &Interval) -> Interval {
        Interval {
            lo: self.lo.min(other.lo),
            hi: self.hi.min(other.hi),
        }
    }

    pub fn max(&self, other: &Interval) -> Interval {
        Interval {
            lo: self.lo.max(other.lo),
            hi: self.hi.max(other.hi),
        }
    }

    pub fn pow(&self, exponent: &Interval) -> Interval {
        if exponent.is_point() {
            let k = exponent.lo;
            if k == 0.0 {
                return Interval::point(1.0);
            }
            if k.fract() == 0.0 && k > 0.0 && k <= 64.0 {
                let k = k as i32;
                if k % 2 == 1 {
                    return Interval::new(self.lo.powi(k), self.hi.powi(k));
                }
                let magnitude = self.abs();
                return Interval::new(magnitude.lo.powi(k), magnitude.hi.powi(k));
            }
            if self.lo > 0.0 {
                let (a, b) = (self.lo.powf(k), self.hi.powf(k));
                return Interval::new(a.min(b), a.max(b));
            }
            return Interval::ENTIRE;
        }
        if self.lo > 0.0 {
            return extremes([
                self.lo.powf(exponent.lo),
                self.lo.powf(exponent.hi),
                self.hi.powf(exponent.lo),
                self.hi.powf(exponent.hi),
            ]);
        }
        Interval::ENTIRE
    }

    /// Integer hull of the interval, allowing `slack` before rounding inwards
    pub fn integral(&self, slack: f64) -> Interval {
        Interval {
            lo: (self.lo - slack).ceil(),
            hi: (self.hi + slack).floor(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn interval(bound: f64) -> impl Strategy<Value = (f64, f64)> {
        (-bound..bound, -bound..bound).prop_map(|(a, b)| if a <= b { (a, b) } else { (b, a) })
    }

    fn samples(lo: f64, hi: f64) -> Vec<f64> {
        (0..=8).map(|step| lo + (hi - lo) * step as f64 / 8.0).collect()
    }

    const SLACK: f64 = 1e-9;

    fn encloses(interval: &Interval, value: f64) -> bool {
        let scale = 1.0 + value.abs();
        interval.lo - SLACK * scale <= value && value <= interval.hi + SLACK * scale
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Every pointwise product lies inside the interval product
        #[test]
        fn product_is_sound((a_lo, a_hi) in interval(50.0), (b_lo, b_hi) in interval(50.0)) {
            let product = Interval::new(a_lo, a_hi).mul(&Interval::new(b_lo, b_hi));
            for a in samples(a_lo, a_hi) {
                for b in samples(b_lo, b_hi) {
                    prop_assert!(encloses(&product, a * b), "{} * {} not in {:?}", a, b, product);
                }
            }
        }

        #[test]
        fn sum_and_abs_are_sound((a_lo, a_hi) in interval(50.0), (b_lo, b_hi) in interval(50.0)) {
            let a_interval = Interval::new(a_lo, a_hi);
            let sum = a_interval.sub(&Interval::new(b_lo, b_hi));
            let magnitude = a_interval.abs();
            for a in samples(a_lo, a_hi) {
                prop_assert!(encloses(&magnitude, a.abs()));
                for b in samples(b_lo, b_hi) {
                    prop_assert!(encloses(&sum, a - b));
                }
            }
        }

        #[test]
        fn square_is_sound((a_lo, a_hi) in interval(20.0)) {
            let square = Interval::new(a_lo, a_hi).pow(&Interval::point(2.0));
            for a in samples(a_lo, a_hi) {
                prop_assert!(encloses(&square, a * a));
            }
        }
    }

    #[test]
    fn infinite_bounds_do_not_produce_nan() {
        let half = Interval::new(0.0, f64::INFINITY);
        let sum = half.add(&Interval::new(f64::NEG_INFINITY, 3.0));
        assert_eq!(sum, Interval::ENTIRE);
        let product = half.mul(&Interval::point(0.0));
        assert_eq!(product, Interval::point(0.0));
        assert!(!half.scale(-2.0).is_empty());
    }

    #[test]
    fn division_by_an_interval_with_zero_is_entire() {
        let quotient = Interval::new(1.0, 2.0).div(&Interval::new(-1.0, 1.0));
        assert_eq!(quotient, Interval::ENTIRE);
        let quotient = Interval::new(12.0, f64::INFINITY).div(&Interval::new(2.0, 4.0));
        assert_eq!(quotient, Interval::new(3.0, f64::INFINITY));
    }

    #[test]
    fn integral_hull_rounds_inwards() {
        assert_eq!(
            Interval::new(0.2, 4.9999999).integral(1e-9),
            Interval::new(1.0, 4.0)
        );
        assert!(Interval::new(0.2, 0.8).integral(1e-9).is_empty());
    }
}
