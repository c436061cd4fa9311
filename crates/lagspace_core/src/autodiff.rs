use num_traits::{Float, FromPrimitive, Num, NumCast, One, ToPrimitive, Zero};
use std::ops::{
    Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Rem, RemAssign, Sub, SubAssign,
};

/// Number of tangent directions carried by one forward-mode pass.
pub const CHUNK_SIZE: usize = 4;

/// Dual number for chunked forward-mode AD.
/// val: real part
/// eps: one infinitesimal part per seeded input direction
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual<const N: usize = CHUNK_SIZE> {
    pub val: f64,
    pub eps: [f64; N],
}

impl<const N: usize> Dual<N> {
    pub fn new(val: f64, eps: [f64; N]) -> Self {
        Self { val, eps }
    }

    pub fn constant(val: f64) -> Self {
        Self { val, eps: [0.0; N] }
    }

    /// A variable seeded in direction `dir`; `None` gives a constant.
    pub fn seeded(val: f64, dir: Option<usize>) -> Self {
        let mut eps = [0.0; N];
        if let Some(d) = dir {
            eps[d] = 1.0;
        }
        Self { val, eps }
    }

    fn is_constant(&self) -> bool {
        self.eps.iter().all(|e| *e == 0.0)
    }

    /// Unary chain rule: result value `val`, derivative `d` w.r.t. self.
    fn chain(self, val: f64, d: f64) -> Self {
        let mut eps = self.eps;
        for e in eps.iter_mut() {
            *e *= d;
        }
        Self { val, eps }
    }

    /// Binary chain rule with partials `da` (w.r.t. self) and `db` (w.r.t. rhs).
    fn combine(self, rhs: Self, val: f64, da: f64, db: f64) -> Self {
        let mut eps = [0.0; N];
        for (i, e) in eps.iter_mut().enumerate() {
            *e = da * self.eps[i] + db * rhs.eps[i];
        }
        Self { val, eps }
    }
}

impl<const N: usize> Zero for Dual<N> {
    fn zero() -> Self {
        Self::constant(0.0)
    }
    fn is_zero(&self) -> bool {
        self.val == 0.0 && self.is_constant()
    }
}

impl<const N: usize> One for Dual<N> {
    fn one() -> Self {
        Self::constant(1.0)
    }
}

impl<const N: usize> Add for Dual<N> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        self.combine(rhs, self.val + rhs.val, 1.0, 1.0)
    }
}

impl<const N: usize> Sub for Dual<N> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self.combine(rhs, self.val - rhs.val, 1.0, -1.0)
    }
}

impl<const N: usize> Mul for Dual<N> {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self {
        self.combine(rhs, self.val * rhs.val, rhs.val, self.val)
    }
}

impl<const N: usize> Div for Dual<N> {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        let inv = 1.0 / rhs.val;
        let val = self.val * inv;
        self.combine(rhs, val, inv, -val * inv)
    }
}

impl<const N: usize> Neg for Dual<N> {
    type Output = Self;
    fn neg(self) -> Self {
        self.chain(-self.val, -1.0)
    }
}

impl<const N: usize> Rem for Dual<N> {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        // d(a % b)/da = 1 away from the jumps
        self.combine(
            rhs,
            self.val % rhs.val,
            1.0,
            -(self.val / rhs.val).trunc(),
        )
    }
}

impl<const N: usize> AddAssign for Dual<N> {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}
impl<const N: usize> SubAssign for Dual<N> {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}
impl<const N: usize> MulAssign for Dual<N> {
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}
impl<const N: usize> DivAssign for Dual<N> {
    fn div_assign(&mut self, rhs: Self) {
        *self = *self / rhs;
    }
}
impl<const N: usize> RemAssign for Dual<N> {
    fn rem_assign(&mut self, rhs: Self) {
        *self = *self % rhs;
    }
}

impl<const N: usize> Num for Dual<N> {
    type FromStrRadixErr = ();
    fn from_str_radix(str: &str, radix: u32) -> Result<Self, Self::FromStrRadixErr> {
        f64::from_str_radix(str, radix)
            .map(Self::constant)
            .map_err(|_| ())
    }
}

impl<const N: usize> ToPrimitive for Dual<N> {
    fn to_i64(&self) -> Option<i64> {
        self.val.to_i64()
    }
    fn to_u64(&self) -> Option<u64> {
        self.val.to_u64()
    }
    fn to_f64(&self) -> Option<f64> {
        Some(self.val)
    }
}

impl<const N: usize> FromPrimitive for Dual<N> {
    fn from_i64(n: i64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_u64(n: u64) -> Option<Self> {
        Some(Self::constant(n as f64))
    }
    fn from_f64(n: f64) -> Option<Self> {
        Some(Self::constant(n))
    }
}

impl<const N: usize> NumCast for Dual<N> {
    fn from<T: ToPrimitive>(n: T) -> Option<Self> {
        n.to_f64().map(Self::constant)
    }
}

impl<const N: usize> Float for Dual<N> {
    fn nan() -> Self {
        Self::constant(f64::NAN)
    }
    fn infinity() -> Self {
        Self::constant(f64::INFINITY)
    }
    fn neg_infinity() -> Self {
        Self::constant(f64::NEG_INFINITY)
    }
    fn neg_zero() -> Self {
        Self::constant(-0.0)
    }
    fn min_value() -> Self {
        Self::constant(f64::MIN)
    }
    fn min_positive_value() -> Self {
        Self::constant(f64::MIN_POSITIVE)
    }
    fn max_value() -> Self {
        Self::constant(f64::MAX)
    }
    fn is_nan(self) -> bool {
        self.val.is_nan()
    }
    fn is_infinite(self) -> bool {
        self.val.is_infinite()
    }
    fn is_finite(self) -> bool {
        self.val.is_finite()
    }
    fn is_normal(self) -> bool {
        self.val.is_normal()
    }
    fn classify(self) -> std::num::FpCategory {
        self.val.classify()
    }
    fn floor(self) -> Self {
        Self::constant(self.val.floor())
    }
    fn ceil(self) -> Self {
        Self::constant(self.val.ceil())
    }
    fn round(self) -> Self {
        Self::constant(self.val.round())
    }
    fn trunc(self) -> Self {
        Self::constant(self.val.trunc())
    }
    fn fract(self) -> Self {
        self.chain(self.val.fract(), 1.0)
    }
    fn abs(self) -> Self {
        self.chain(self.val.abs(), if self.val >= 0.0 { 1.0 } else { -1.0 })
    }
    fn signum(self) -> Self {
        Self::constant(self.val.signum())
    }
    fn is_sign_positive(self) -> bool {
        self.val.is_sign_positive()
    }
    fn is_sign_negative(self) -> bool {
        self.val.is_sign_negative()
    }
    fn mul_add(self, a: Self, b: Self) -> Self {
        self * a + b
    }
    fn recip(self) -> Self {
        Self::one() / self
    }

    fn powi(self, n: i32) -> Self {
        let d = if n == 0 {
            0.0
        } else {
            (n as f64) * self.val.powi(n - 1)
        };
        self.chain(self.val.powi(n), d)
    }

    fn powf(self, n: Self) -> Self {
        let val = self.val.powf(n.val);
        let d_base = if self.is_constant() {
            0.0
        } else {
            n.val * self.val.powf(n.val - 1.0)
        };
        // ln(x) is only needed when the exponent itself varies
        let d_exp = if n.is_constant() {
            0.0
        } else {
            val * self.val.ln()
        };
        self.combine(n, val, d_base, d_exp)
    }

    fn sqrt(self) -> Self {
        let s = self.val.sqrt();
        self.chain(s, 0.5 / s)
    }

    fn exp(self) -> Self {
        let e = self.val.exp();
        self.chain(e, e)
    }

    fn exp2(self) -> Self {
        let e = self.val.exp2();
        self.chain(e, e * std::f64::consts::LN_2)
    }
    fn ln(self) -> Self {
        self.chain(self.val.ln(), 1.0 / self.val)
    }
    fn log(self, base: Self) -> Self {
        self.ln() / base.ln()
    }
    fn log2(self) -> Self {
        self.chain(self.val.log2(), 1.0 / (self.val * std::f64::consts::LN_2))
    }
    fn log10(self) -> Self {
        self.chain(self.val.log10(), 1.0 / (self.val * std::f64::consts::LN_10))
    }

    fn max(self, other: Self) -> Self {
        if self.val >= other.val {
            self
        } else {
            other
        }
    }
    fn min(self, other: Self) -> Self {
        if self.val <= other.val {
            self
        } else {
            other
        }
    }

    fn abs_sub(self, other: Self) -> Self {
        if self.val > other.val {
            self - other
        } else {
            Self::zero()
        }
    }

    fn cbrt(self) -> Self {
        let c = self.val.cbrt();
        self.chain(c, 1.0 / (3.0 * c * c))
    }
    fn hypot(self, other: Self) -> Self {
        let h = self.val.hypot(other.val);
        self.combine(other, h, self.val / h, other.val / h)
    }

    fn sin(self) -> Self {
        self.chain(self.val.sin(), self.val.cos())
    }
    fn cos(self) -> Self {
        self.chain(self.val.cos(), -self.val.sin())
    }
    fn tan(self) -> Self {
        let t = self.val.tan();
        self.chain(t, 1.0 + t * t)
    }
    fn asin(self) -> Self {
        self.chain(self.val.asin(), 1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn acos(self) -> Self {
        self.chain(self.val.acos(), -1.0 / (1.0 - self.val * self.val).sqrt())
    }
    fn atan(self) -> Self {
        self.chain(self.val.atan(), 1.0 / (1.0 + self.val * self.val))
    }
    fn atan2(self, other: Self) -> Self {
        let r2 = self.val * self.val + other.val * other.val;
        self.combine(
            other,
            self.val.atan2(other.val),
            other.val / r2,
            -self.val / r2,
        )
    }
    fn sin_cos(self) -> (Self, Self) {
        (self.sin(), self.cos())
    }

    fn exp_m1(self) -> Self {
        self.chain(self.val.exp_m1(), self.val.exp())
    }
    fn ln_1p(self) -> Self {
        self.chain(self.val.ln_1p(), 1.0 / (1.0 + self.val))
    }
    fn sinh(self) -> Self {
        self.chain(self.val.sinh(), self.val.cosh())
    }
    fn cosh(self) -> Self {
        self.chain(self.val.cosh(), self.val.sinh())
    }
    fn tanh(self) -> Self {
        let t = self.val.tanh();
        self.chain(t, 1.0 - t * t)
    }
    fn asinh(self) -> Self {
        self.chain(self.val.asinh(), 1.0 / (self.val * self.val + 1.0).sqrt())
    }
    fn acosh(self) -> Self {
        self.chain(self.val.acosh(), 1.0 / (self.val * self.val - 1.0).sqrt())
    }
    fn atanh(self) -> Self {
        self.chain(self.val.atanh(), 1.0 / (1.0 - self.val * self.val))
    }

    fn integer_decode(self) -> (u64, i16, i8) {
        self.val.integer_decode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type D = Dual<2>;

    #[test]
    fn product_rule_tracks_both_directions() {
        let x = D::seeded(3.0, Some(0));
        let y = D::seeded(2.0, Some(1));
        let z = x * y + x;
        assert_eq!(z.val, 9.0);
        assert_eq!(z.eps, [3.0, 3.0]);
    }

    #[test]
    fn quotient_rule() {
        let x = D::seeded(1.0, Some(0));
        let y = D::seeded(4.0, Some(1));
        let z = x / y;
        assert!((z.val - 0.25).abs() < 1e-15);
        assert!((z.eps[0] - 0.25).abs() < 1e-15);
        assert!((z.eps[1] + 1.0 / 16.0).abs() < 1e-15);
    }

    #[test]
    fn powi_is_finite_for_negative_base() {
        let x = D::seeded(-2.0, Some(0));
        let z = x.powi(3);
        assert_eq!(z.val, -8.0);
        assert_eq!(z.eps[0], 12.0);
    }

    #[test]
    fn powf_with_constant_exponent_skips_log_term() {
        let x = D::seeded(-2.0, Some(0));
        let z = x.powf(D::constant(2.0));
        assert!((z.val - 4.0).abs() < 1e-12);
        assert!((z.eps[0] + 4.0).abs() < 1e-12);
        assert!(z.eps[1] == 0.0);
    }

    #[test]
    fn elementary_functions_match_closed_forms() {
        let x = D::seeded(0.5, Some(0));
        assert!((x.exp().eps[0] - 0.5_f64.exp()).abs() < 1e-12);
        assert!((x.ln().eps[0] - 2.0).abs() < 1e-12);
        assert!((x.sin().eps[0] - 0.5_f64.cos()).abs() < 1e-12);
        assert!((x.sqrt().eps[0] - 0.5 / 0.5_f64.sqrt()).abs() < 1e-12);
        assert!((x.atan().eps[0] - 0.8).abs() < 1e-12);
    }
}
