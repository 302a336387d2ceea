//! Time-of-flight and distance math
//!
//! Timestamps carried in ranging frames are the lower 32 bits of the radio's
//! 40-bit counter. All intervals are therefore computed modulo 2^32, which
//! makes every function here invariant under a uniform offset of its inputs.
//!
//! Time of flight is returned in device time units as `f64`. Degenerate
//! inputs produce sentinel values rather than errors: a zero double-sided
//! denominator gives `NaN`, a zero distance gives an infinite path loss.

use core::f64::consts::PI;

use crate::time::{DTU_PERIOD_S, MASK32};

/// Speed of light in vacuum, m/s
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Refractive index of air
pub const AIR_REFRACTIVE_INDEX: f64 = 1.000_293;

/// Propagation speed of radio waves in air, m/s
pub const SPEED_IN_AIR: f64 = SPEED_OF_LIGHT / AIR_REFRACTIVE_INDEX;

fn interval(earlier: u64, later: u64) -> f64 {
    (later.wrapping_sub(earlier) & MASK32) as f64
}

/// Single-sided two-way ranging
///
/// `request` and `response` are the initiator's transmission and reception
/// times, `reception` and `transmission` the responder's. `skew` is the
/// fractional clock skew between the two nodes; the responder's reply time is
/// scaled by `1 - skew` before it is subtracted from the round trip.
///
/// If every timestamp is at its maximum, both intervals wrap to zero and so
/// does the result.
///
/// # Example
///
/// ``` rust
/// use uwb_core::ranging::math::{calc_tof_ss, tof_to_meters};
///
/// let tof = calc_tof_ss(254076713, 175480898, 1470169168, 1391575515, 0.0);
/// assert_eq!(tof_to_meters(tof) as u64, 5);
/// ```
pub fn calc_tof_ss(response: u32, request: u32, transmission: u64, reception: u64, skew: f64) -> f64 {
    let round_trip = interval(u64::from(request), u64::from(response));
    let reply_time = interval(reception, transmission);

    (round_trip - reply_time * (1.0 - skew)) / 2.0
}

/// Asymmetric double-sided two-way ranging
///
/// Takes the four timestamps of the first exchange and the four of the
/// second one, in the same order as [`calc_tof_ss`]. Clock skew cancels out,
/// so no skew term is needed.
///
/// Products of two 32-bit intervals overflow 64-bit integers, so everything
/// is computed in `f64`. Returns `NaN` if the denominator is zero.
///
/// [`calc_tof_ss`]: fn.calc_tof_ss.html
#[allow(clippy::too_many_arguments)]
pub fn calc_tof_ds(
    first_response: u32,
    first_request: u32,
    first_transmission: u64,
    first_reception: u64,
    response: u32,
    request: u32,
    transmission: u64,
    reception: u64,
) -> f64 {
    let round_trip_1 = interval(u64::from(first_request), u64::from(first_response));
    let reply_1 = interval(first_reception, first_transmission);
    let round_trip_2 = interval(u64::from(request), u64::from(response));
    let reply_2 = interval(reception, transmission);

    let denominator = round_trip_1 + round_trip_2 + reply_1 + reply_2;
    if denominator == 0.0 {
        return f64::NAN;
    }

    (round_trip_1 * round_trip_2 - reply_1 * reply_2) / denominator
}

/// Symmetric single-sided ranging in integer arithmetic
///
/// Only accurate if both nodes' clocks run at the same rate.
pub fn calc_tof_sym_ss(response: u32, request: u32, transmission: u32, reception: u32) -> u32 {
    let round_trip = response.wrapping_sub(request);
    let reply_time = transmission.wrapping_sub(reception);

    round_trip.wrapping_sub(reply_time) >> 1
}

/// Symmetric double-sided ranging in integer arithmetic
///
/// Averages two symmetric round trips. Only accurate if both reply times are
/// (nearly) equal.
#[allow(clippy::too_many_arguments)]
pub fn calc_tof_sym_ds(
    first_response: u32,
    first_request: u32,
    first_transmission: u32,
    first_reception: u32,
    response: u32,
    request: u32,
    transmission: u32,
    reception: u32,
) -> u32 {
    let round_trip_1 = first_response.wrapping_sub(first_request);
    let reply_1 = first_transmission.wrapping_sub(first_reception);
    let round_trip_2 = response.wrapping_sub(request);
    let reply_2 = transmission.wrapping_sub(reception);

    round_trip_1
        .wrapping_sub(reply_1)
        .wrapping_add(round_trip_2)
        .wrapping_sub(reply_2)
        >> 2
}

/// Converts a time of flight in device time units to meters
///
/// `NaN` stays `NaN`.
pub fn tof_to_meters(tof: f64) -> f64 {
    if tof.is_nan() {
        return f64::NAN;
    }
    tof * SPEED_IN_AIR * DTU_PERIOD_S
}

/// Free-space path loss
///
/// `tx_power` in dBm, `antenna_gain` in dBi (applied for both antennas),
/// `frequency` in Hz and `distance` in meters. Returns the received power in
/// dBm. A distance (or frequency) of zero yields `+inf`.
///
/// # Example
///
/// ``` rust
/// use uwb_core::ranging::math::path_loss;
///
/// assert_eq!(path_loss(0.0, 0.0, 0.0, 0.0), f64::INFINITY);
/// assert!((path_loss(1.0, 1.0, 1.0, 1.0) - 150.54967).abs() < 1e-4);
/// ```
pub fn path_loss(tx_power: f32, antenna_gain: f32, frequency: f32, distance: f32) -> f64 {
    let tx_power = f64::from(tx_power);
    let antenna_gain = f64::from(antenna_gain);
    let frequency = f64::from(frequency);
    let distance = f64::from(distance);

    tx_power + 2.0 * antenna_gain + 20.0 * SPEED_IN_AIR.log10()
        - 20.0 * (4.0 * PI * frequency * distance).log10()
}
