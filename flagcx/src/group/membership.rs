//! Membership validation and the canonical form agreed through the store.

use crate::error::{FlagcxError, Result};
use crate::types::{GroupId, Rank};

/// Check an ordered membership list against the world and locate the
/// caller in it. Returns the caller's group rank.
pub(crate) fn validate(ranks: &[Rank], world_size: u32, world_rank: Rank) -> Result<Rank> {
    if ranks.is_empty() {
        return Err(FlagcxError::config("group membership is empty"));
    }
    let mut seen = vec![false; world_size as usize];
    for &r in ranks {
        if r >= world_size {
            return Err(FlagcxError::config(format!(
                "rank {r} is outside the world of size {world_size}"
            )));
        }
        if std::mem::replace(&mut seen[r as usize], true) {
            return Err(FlagcxError::config(format!(
                "rank {r} appears more than once in the membership"
            )));
        }
    }
    ranks
        .iter()
        .position(|&r| r == world_rank)
        .map(|i| i as Rank)
        .ok_or_else(|| {
            FlagcxError::config(format!(
                "rank {world_rank} is not a member of {ranks:?} and cannot create the group"
            ))
        })
}

/// Little-endian u32 list, the value every member compares in the store.
pub(crate) fn encode(ranks: &[Rank]) -> Vec<u8> {
    ranks.iter().flat_map(|r| r.to_le_bytes()).collect()
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Vec<Rank>> {
    if bytes.len() % 4 != 0 {
        return Err(FlagcxError::DecodeFailed(format!(
            "membership record of {} bytes is not a list of u32",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| Rank::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Explain why `ours` does not match the membership already registered.
pub(crate) fn mismatch(label: &str, ours: &[Rank], registered: &[u8]) -> FlagcxError {
    match decode(registered) {
        Ok(theirs) if theirs.len() != ours.len() => FlagcxError::config(format!(
            "group '{label}' already registered with {} ranks {theirs:?}, this rank asked for {} ranks {ours:?}",
            theirs.len(),
            ours.len()
        )),
        Ok(theirs) => FlagcxError::config(format!(
            "group '{label}' already registered with membership {theirs:?}, this rank asked for {ours:?}"
        )),
        Err(_) => FlagcxError::config(format!(
            "group '{label}' has an unreadable membership record"
        )),
    }
}

/// Label for a group created without an explicit name. The n-th group a
/// rank creates over a given membership gets the same label on every
/// member, and ranks outside the membership never need to take part.
pub(crate) fn auto_label(ranks: &[Rank], nth: u64) -> String {
    let digest = GroupId::from_label(&format!("{ranks:?}"));
    format!("pg-{digest}-{nth}")
}
