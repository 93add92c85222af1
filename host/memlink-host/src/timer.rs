// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Prescaler/period arithmetic for the device timers.
//!
//! The timers count a 72 MHz peripheral clock through a 16-bit
//! prescaler and a 16-bit period register. The prescaler is restricted
//! to powers of two: the smallest one that brings the per-period tick
//! count into 16 bits wins, keeping the realized frequency as close to
//! the request as the divider allows.

use crate::error::{Error, Result};

/// Nominal timer input clock.
pub const PERIPH_CLOCK_HZ: f64 = 72e6;

/// The two streaming-capable timers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Timer {
    /// Drives GPIO streaming.
    T1,
    /// Drives ADC streaming.
    T2,
}

impl Timer {
    pub(crate) fn index(self) -> usize {
        match self {
            Timer::T1 => 0,
            Timer::T2 => 1,
        }
    }
}

/// Register values realizing an interrupt rate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TickParams {
    pub prescaler: u16,
    pub period: u16,
    /// The frequency the registers actually produce.
    pub realized_hz: f64,
}

/// Register values realizing a PWM frequency and duty cycle.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PwmParams {
    pub prescaler: u16,
    pub period: u16,
    pub pulse: u16,
    pub realized_hz: f64,
    pub realized_duty: f64,
}

/// Picks the divider pair for interrupt rate `hz`.
pub fn tick_params(hz: f64) -> Result<TickParams> {
    if !hz.is_finite() || hz <= 0.0 {
        return Err(Error::Invalid("frequency must be positive"));
    }
    let mut ticks = PERIPH_CLOCK_HZ / hz;
    if ticks < 1.5 {
        return Err(Error::Invalid("frequency above the timer clock"));
    }
    let mut div = 1u32;
    while ticks > 65536.0 {
        div *= 2;
        ticks /= 2.0;
        if div > 65536 {
            return Err(Error::Invalid("frequency below the timer range"));
        }
    }
    let prescaler = (div - 1) as u16;
    let period = (ticks.round() - 1.0) as u16;
    let realized_hz =
        PERIPH_CLOCK_HZ / (f64::from(div) * (f64::from(period) + 1.0));
    Ok(TickParams {
        prescaler,
        period,
        realized_hz,
    })
}

/// Picks the divider triple for a PWM wave at `hz` with the given duty
/// cycle in `[0, 1]`.
pub fn pwm_params(hz: f64, duty: f64) -> Result<PwmParams> {
    if !(0.0..=1.0).contains(&duty) {
        return Err(Error::Invalid("duty cycle outside [0, 1]"));
    }
    let base = tick_params(hz)?;
    let span = f64::from(base.period) + 1.0;
    let pulse = ((span * duty).round() - 1.0).max(0.0) as u16;
    let realized_duty = (f64::from(pulse) + 1.0) / span;
    Ok(PwmParams {
        prescaler: base.prescaler,
        period: base.period,
        pulse,
        realized_hz: base.realized_hz,
        realized_duty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kilohertz_needs_one_halving() {
        // 72_000 ticks per period overflows 16 bits; /2 fits.
        let p = tick_params(1e3).unwrap();
        assert_eq!(p.prescaler, 1);
        assert_eq!(p.period, 35_999);
        assert!((p.realized_hz - 1e3).abs() < 1e-6);
    }

    #[test]
    fn slow_rates_scale_by_powers_of_two() {
        // 100 Hz needs 720_000 ticks: /16 brings it to 45_000.
        let p = tick_params(100.0).unwrap();
        assert_eq!(p.prescaler, 15);
        assert_eq!(p.period, 44_999);
        assert!((p.realized_hz - 100.0).abs() < 1e-6);
    }

    #[test]
    fn realized_rate_tracks_rounding() {
        let p = tick_params(3e3).unwrap();
        assert_eq!(p.prescaler, 0);
        assert_eq!(p.period, 23_999);
        let err = (p.realized_hz - 3e3).abs() / 3e3;
        assert!(err < 1e-4);
    }

    #[test]
    fn out_of_range_rates_are_rejected() {
        assert!(tick_params(0.0).is_err());
        assert!(tick_params(-5.0).is_err());
        assert!(tick_params(1e9).is_err());
        assert!(tick_params(0.001).is_err());
    }

    #[test]
    fn pwm_duty_realization() {
        let p = pwm_params(2e3, 0.25).unwrap();
        assert_eq!(p.period, 35_999);
        assert_eq!(p.pulse, 8_999);
        assert!((p.realized_duty - 0.25).abs() < 1e-4);
        assert!(pwm_params(1e3, 1.5).is_err());
    }
}
