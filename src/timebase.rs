use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::{bail, Error};
use ffmpeg_sys_next::AVRational;
use serde::{Deserialize, Serialize};

/// Timestamp value for "unknown", same bit pattern as AV_NOPTS_VALUE.
pub const NO_PTS: i64 = i64::MIN;

/// Rational time base (seconds per tick).
///
/// Four of these exist per session: the input stream base, the encoder base,
/// the container stream base and the microsecond wall clock used by I/O
/// timeouts. They are never interchangeable; conversions go through
/// [TimeBase::rescale].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

/// Wall-clock base of `av_gettime_relative`, microseconds.
pub const MICROSECONDS: TimeBase = TimeBase {
    num: 1,
    den: 1_000_000,
};

impl TimeBase {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// Convert `v` ticks of `self` into ticks of `to`, rounding to the
    /// nearest integer with ties away from zero (the AV_ROUND_NEAR_INF
    /// behaviour of `av_rescale_q`). `NO_PTS` passes through unchanged.
    pub fn rescale(&self, v: i64, to: TimeBase) -> i64 {
        if v == NO_PTS {
            return NO_PTS;
        }
        let b = self.num as i128 * to.den as i128;
        let c = self.den as i128 * to.num as i128;
        debug_assert!(c != 0, "rescale to a zero time base");
        let n = v as i128 * b;
        let r = if n >= 0 { (n + c / 2) / c } else { (n - c / 2) / c };
        r as i64
    }

    /// Seconds per tick.
    pub fn to_f64(&self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Ticks of this base per frame at `fps` (num/den frames per second).
    pub fn ticks_per_frame(&self, fps: TimeBase) -> i64 {
        // frame duration = fps.den/fps.num seconds = den*self.den/(num*self.num) ticks
        let n = fps.den as i128 * self.den as i128;
        let c = fps.num as i128 * self.num as i128;
        ((n + c / 2) / c) as i64
    }
}

impl From<AVRational> for TimeBase {
    fn from(r: AVRational) -> Self {
        Self {
            num: r.num,
            den: r.den,
        }
    }
}

impl From<TimeBase> for AVRational {
    fn from(t: TimeBase) -> Self {
        AVRational {
            num: t.num,
            den: t.den,
        }
    }
}

impl Display for TimeBase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for TimeBase {
    type Err = Error;

    /// Accepts "30", "30/1", "30000/1001".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (num, den) = match s.split_once('/') {
            Some((n, d)) => (n.trim().parse()?, d.trim().parse()?),
            None => (s.trim().parse()?, 1),
        };
        if den == 0 || num == 0 {
            bail!("invalid rational: {}", s);
        }
        Ok(Self { num, den })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TB_90K: TimeBase = TimeBase::new(1, 90_000);
    const TB_MS: TimeBase = TimeBase::new(1, 1_000);

    #[test]
    fn rescale_matches_reference_formula() {
        let input = TimeBase::new(1, 12_800);
        for pts in [0i64, 1, 2, 511, 12_800, 999_983] {
            let got = input.rescale(pts, TB_90K);
            let expect = (pts as f64 * 90_000.0 / 12_800.0).round() as i64;
            assert!((got - expect).abs() <= 1, "pts={pts} got={got} expect={expect}");
        }
    }

    #[test]
    fn rescale_identity() {
        assert_eq!(TB_90K.rescale(123_456, TB_90K), 123_456);
    }

    #[test]
    fn rescale_round_trip_within_one_tick() {
        for v in [0i64, 1, 17, 1_000, 90_001, 123_456_789] {
            let ms = TB_90K.rescale(v, TB_MS);
            let back = TB_MS.rescale(ms, TB_90K);
            // one millisecond is 90 ticks; round trip loses at most half of that
            assert!((back - v).abs() <= 45, "v={v} back={back}");
        }
        // exact round trip when the bases divide evenly
        let tb_a = TimeBase::new(1, 1_000);
        let tb_b = TimeBase::new(1, 90_000);
        for v in [0i64, 3, 40, 1_000] {
            assert_eq!(tb_b.rescale(tb_a.rescale(v, tb_b), tb_a), v);
        }
    }

    #[test]
    fn rescale_negative_rounds_away_from_zero() {
        let a = TimeBase::new(1, 2);
        let b = TimeBase::new(1, 3);
        // -1 tick of 1/2s = -1.5 ticks of 1/3s, rounds to -2
        assert_eq!(a.rescale(-1, b), -2);
        assert_eq!(a.rescale(1, b), 2);
    }

    #[test]
    fn no_pts_passes_through() {
        assert_eq!(TB_90K.rescale(NO_PTS, TB_MS), NO_PTS);
    }

    #[test]
    fn parse_rational() {
        assert_eq!("30".parse::<TimeBase>().unwrap(), TimeBase::new(30, 1));
        assert_eq!(
            "30000/1001".parse::<TimeBase>().unwrap(),
            TimeBase::new(30_000, 1001)
        );
        assert!("0/1".parse::<TimeBase>().is_err());
        assert!("x".parse::<TimeBase>().is_err());
    }

    #[test]
    fn frame_duration_in_ticks() {
        // 30fps in 90kHz: 3000 ticks
        assert_eq!(TB_90K.ticks_per_frame(TimeBase::new(30, 1)), 3_000);
        // 60fps in 1/60 base: 1 tick
        assert_eq!(TimeBase::new(1, 60).ticks_per_frame(TimeBase::new(60, 1)), 1);
    }
}
