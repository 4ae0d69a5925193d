//! Spatial gain math
//!
//! A member's gain falls off linearly with its distance from the listening
//! source, floored so nobody goes fully silent.

use std::collections::HashMap;

use crate::sync::{GainEntry, Member, Position};

/// Distance at which gain bottoms out
pub const MAX_DISTANCE: f64 = 100.0;

/// Lowest gain any member is assigned
pub const MIN_GAIN: f64 = 0.1;

/// Ramp time attached to every periodic gain entry, in seconds
pub const DEFAULT_RAMP_SECONDS: f64 = 0.25;

/// Ramp back to unity when spatial audio stops, in seconds
pub const RESET_RAMP_SECONDS: f64 = 0.5;

/// Gain for a member `distance` units from the listening source
pub fn gain_for_distance(distance: f64) -> f64 {
    let normalized = (distance / MAX_DISTANCE).min(1.0);
    (1.0 - normalized).max(MIN_GAIN)
}

/// Gain entries for every member of a room
pub fn compute_gains(listening_source: &Position, members: &[Member]) -> HashMap<String, GainEntry> {
    members
        .iter()
        .map(|member| {
            let gain = gain_for_distance(member.position.distance_to(listening_source));
            (
                member.client_id.clone(),
                GainEntry {
                    gain,
                    ramp_time: DEFAULT_RAMP_SECONDS,
                },
            )
        })
        .collect()
}

/// Pick the entry that applies to `client_id`.
///
/// Falls back to the room average (with the longest ramp) when the client
/// has no entry of its own, e.g. it joined after the tick was computed.
pub fn gain_for_client(gains: &HashMap<String, GainEntry>, client_id: Option<&str>) -> Option<GainEntry> {
    if let Some(entry) = client_id.and_then(|id| gains.get(id)) {
        return Some(*entry);
    }
    if gains.is_empty() {
        return None;
    }
    let n = gains.len() as f64;
    Some(GainEntry {
        gain: gains.values().map(|e| e.gain).sum::<f64>() / n,
        ramp_time: gains.values().map(|e| e.ramp_time).fold(0.0, f64::max),
    })
}
