//! CAN bit-timing computation.
//!
//! Turns an abstract user request (bitrate, sample point, sjw) into the
//! discrete `{brp, tseg1, tseg2, sjw}` quadruple a controller accepts,
//! scanning the prescaler range and keeping the candidate whose achieved
//! sample point lands closest to the request. Sample points are fixed-point
//! with a scale of [`SAMPLE_POINT_SCALE`] so the whole solver stays in
//! integer arithmetic.
//!
//! The CAN-FD strategy follows the CiA recommendations:
//! same prescaler for the arbitration and data phases, the lowest prescaler
//! that admits both, sjw as large as tseg2 allows.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed-point scale for sample points: 1024 == 100 %.
pub const SAMPLE_POINT_SCALE: u32 = 1024;

/// Sentinel sjw request: make sjw as large as tseg2 (capped at sjw_max).
pub const SJW_TSEG2: u32 = 0;

/// Hardware constraints of one bit-timing phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwConstraints {
    pub clock_hz: u32,
    pub brp_min: u32,
    pub brp_max: u32,
    pub brp_step: u32,
    pub tseg1_min: u32,
    pub tseg1_max: u32,
    pub tseg2_min: u32,
    pub tseg2_max: u32,
    pub sjw_max: u32,
}

/// User request with the sample point in fixed-point (0..SAMPLE_POINT_SCALE).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConstraints {
    pub bitrate: u32,
    pub sample_point: u32,
    /// Explicit sjw, or [`SJW_TSEG2`] for "as large as tseg2".
    pub sjw: u32,
    /// Lower bound on time quanta per bit; 0 for no preference.
    pub min_tqs: u32,
}

impl UserConstraints {
    /// Build from a real-valued sample point in (0, 1).
    pub fn from_real(bitrate: u32, sample_point: f64, sjw: u32, min_tqs: u32) -> Result<Self> {
        if !(0.0..=1.0).contains(&sample_point) {
            return Err(Error::InvalidParam);
        }
        Ok(Self {
            bitrate,
            sample_point: (sample_point * SAMPLE_POINT_SCALE as f64) as u32,
            sjw,
            min_tqs,
        })
    }
}

/// A solved bit timing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitTiming {
    pub brp: u32,
    pub tseg1: u32,
    pub tseg2: u32,
    pub sjw: u32,
}

impl BitTiming {
    /// The bitrate this timing produces on the given clock.
    pub fn bitrate(&self, clock_hz: u32) -> u32 {
        clock_hz / (self.brp * (1 + self.tseg1 + self.tseg2))
    }

    /// Achieved sample point, fixed-point scaled.
    pub fn sample_point(&self) -> u32 {
        let tqs = 1 + self.tseg1 + self.tseg2;
        ((1 + self.tseg1) * SAMPLE_POINT_SCALE) / tqs
    }
}

fn validate_range(min: u32, max: u32) -> Result<()> {
    if max < min {
        return Err(Error::InvalidParam);
    }
    Ok(())
}

fn validate_hw(hw: &HwConstraints) -> Result<()> {
    validate_range(hw.brp_min, hw.brp_max)?;

    if hw.brp_step == 0 || hw.brp_min == 0 {
        return Err(Error::InvalidParam);
    }

    // brp range must be evenly divisible by the step
    let range = hw.brp_max - hw.brp_min;
    if (range / hw.brp_step) * hw.brp_step != range {
        return Err(Error::InvalidParam);
    }

    validate_range(hw.tseg1_min, hw.tseg1_max)?;
    validate_range(hw.tseg2_min, hw.tseg2_max)?;

    if hw.sjw_max < 1 || hw.clock_hz < 1 {
        return Err(Error::InvalidParam);
    }

    Ok(())
}

fn validate_user(hw: &HwConstraints, user: &UserConstraints) -> Result<()> {
    if user.sample_point == 0 || user.sample_point >= SAMPLE_POINT_SCALE {
        return Err(Error::InvalidParam);
    }

    if user.sjw != SJW_TSEG2 && user.sjw > hw.sjw_max {
        return Err(Error::InvalidParam);
    }

    if user.bitrate < 1 {
        return Err(Error::InvalidParam);
    }

    Ok(())
}

/// Core scan over the prescaler range. Constraints must be pre-validated.
fn run(hw: &HwConstraints, user: &UserConstraints) -> Result<BitTiming> {
    let mut best: Option<(BitTiming, u32)> = None;

    let mut brp = hw.brp_min;
    while brp <= hw.brp_max {
        let can_hz = hw.clock_hz / brp;
        let tqs = can_hz / user.bitrate;

        if user.min_tqs > 0 && tqs < user.min_tqs {
            break; // insufficient tqs, only gets worse as brp grows
        }

        if tqs < 1 + hw.tseg1_min + hw.tseg2_min {
            break;
        }

        if tqs > 1 + hw.tseg1_max + hw.tseg2_max {
            brp += hw.brp_step;
            continue;
        }

        let mut tseg2 = ((SAMPLE_POINT_SCALE - user.sample_point) * tqs
            + SAMPLE_POINT_SCALE / 2)
            / SAMPLE_POINT_SCALE;
        if tseg2 < hw.tseg2_min {
            tseg2 = hw.tseg2_min;
        } else if tseg2 > hw.tseg2_max {
            tseg2 = hw.tseg2_max;
            if tseg2 + 3 > tqs {
                brp += hw.brp_step;
                continue;
            }
        }

        let tseg1 = tqs - 1 - tseg2;
        if tseg1 < hw.tseg1_min || tseg1 > hw.tseg1_max {
            brp += hw.brp_step;
            continue;
        }

        let achieved = ((1 + tseg1) * SAMPLE_POINT_SCALE) / tqs;
        let score = achieved.abs_diff(user.sample_point);

        let better = match &best {
            Some((_, best_score)) => score < *best_score,
            None => true,
        };

        if better {
            let sjw = if user.sjw == SJW_TSEG2 {
                tseg2.min(hw.sjw_max)
            } else {
                user.sjw
            };

            best = Some((BitTiming { brp, tseg1, tseg2, sjw }, score));

            if score == 0 {
                break;
            }
        }

        brp += hw.brp_step;
    }

    best.map(|(settings, _)| settings).ok_or(Error::NoSolution)
}

/// Solve one phase against its hardware constraints.
pub fn solve(hw: &HwConstraints, user: &UserConstraints) -> Result<BitTiming> {
    validate_hw(hw)?;
    validate_user(hw, user)?;
    run(hw, user)
}

/// CiA classic-CAN strategy: lowest prescaler admitting a solution, sjw as
/// large as tseg2.
pub fn cia_classic(hw: &HwConstraints, user: &UserConstraints) -> Result<BitTiming> {
    validate_hw(hw)?;
    validate_user(hw, user)?;

    let mut user = *user;
    user.sjw = SJW_TSEG2;

    let mut brp = hw.brp_min;
    while brp <= hw.brp_max {
        let mut pinned = *hw;
        pinned.brp_min = brp;
        pinned.brp_max = brp;

        match run(&pinned, &user) {
            Ok(settings) => return Ok(settings),
            Err(Error::NoSolution) => {}
            Err(other) => return Err(other),
        }

        brp += hw.brp_step;
    }

    Err(Error::NoSolution)
}

/// CiA CAN-FD strategy: a single prescaler shared by the arbitration and
/// data phases, the lowest that admits a solution for both.
pub fn cia_fd(
    hw_nominal: &HwConstraints,
    hw_data: &HwConstraints,
    user_nominal: &UserConstraints,
    user_data: &UserConstraints,
) -> Result<(BitTiming, BitTiming)> {
    validate_hw(hw_nominal)?;
    validate_user(hw_nominal, user_nominal)?;
    validate_hw(hw_data)?;
    validate_user(hw_data, user_data)?;

    let mut user_n = *user_nominal;
    user_n.sjw = SJW_TSEG2;
    let mut user_d = *user_data;
    user_d.sjw = SJW_TSEG2;

    let mut brp = hw_nominal.brp_min;
    while brp <= hw_nominal.brp_max {
        let mut hw_n = *hw_nominal;
        hw_n.brp_min = brp;
        hw_n.brp_max = brp;

        match run(&hw_n, &user_n) {
            Ok(nominal) => {
                if brp >= hw_data.brp_min && brp <= hw_data.brp_max {
                    let mut hw_d = *hw_data;
                    hw_d.brp_min = brp;
                    hw_d.brp_max = brp;

                    match run(&hw_d, &user_d) {
                        Ok(data) => return Ok((nominal, data)),
                        Err(Error::NoSolution) => {}
                        Err(other) => return Err(other),
                    }
                }
            }
            Err(Error::NoSolution) => {}
            Err(other) => return Err(other),
        }

        brp += hw_nominal.brp_step;
    }

    Err(Error::NoSolution)
}

fn interpolate_sample_point(bitrate: u32, low_rate: u32, high_rate: u32, low: u32, high: u32) -> u32 {
    if bitrate <= low_rate {
        low
    } else if bitrate >= high_rate {
        high
    } else {
        // low > high here; interpolate downward between the two thresholds
        let span = (bitrate - low_rate) as i64 * (high as i64 - low as i64);
        (low as i64 + span / (high_rate - low_rate) as i64) as u32
    }
}

/// CiA default sample point for a classic or arbitration-phase bitrate:
/// 87.5 % up to 500 kbit/s, sliding to 75 % at 1 Mbit/s.
pub fn cia_classic_defaults(bitrate: u32) -> UserConstraints {
    UserConstraints {
        bitrate,
        sample_point: interpolate_sample_point(bitrate, 500_000, 1_000_000, 896, 768),
        sjw: SJW_TSEG2,
        min_tqs: 0,
    }
}

/// CiA default sample points for an FD pair: the arbitration phase uses the
/// classic table, the data phase 75 % sliding to 70 % at 5 Mbit/s.
pub fn cia_fd_defaults(nominal_bitrate: u32, data_bitrate: u32) -> (UserConstraints, UserConstraints) {
    (
        cia_classic_defaults(nominal_bitrate),
        UserConstraints {
            bitrate: data_bitrate,
            sample_point: interpolate_sample_point(data_bitrate, 5_000_000, 5_000_000, 768, 717),
            sjw: SJW_TSEG2,
            min_tqs: 0,
        },
    )
}
