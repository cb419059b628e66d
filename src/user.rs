//! Per-user resource accounting.
//!
//! Every peer carries one [`UserCharge`] per [`Slot`]. Charging a peer adds
//! to the totals of the user it runs as; once a user's total for a slot
//! would exceed its limit the charge fails with [`PeerError::Quota`].

use std::collections::HashMap;

use crate::error::PeerError;

/// Kinds of accounted resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Name claims (owned or queued).
    Names = 0,
    /// Installed match rules.
    Matches = 1,
    /// Outstanding expected replies.
    Replies = 2,
}

pub const N_SLOTS: usize = 3;

/// Per-user limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserLimits {
    pub max_names: usize,
    pub max_matches: usize,
    pub max_replies: usize,
}

impl Default for UserLimits {
    fn default() -> Self {
        Self {
            max_names: 512,
            max_matches: 16 * 1024,
            max_replies: 8 * 1024,
        }
    }
}

impl UserLimits {
    fn limit(&self, slot: Slot) -> usize {
        match slot {
            Slot::Names => self.max_names,
            Slot::Matches => self.max_matches,
            Slot::Replies => self.max_replies,
        }
    }
}

/// What one peer currently has charged, per slot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UserCharge {
    amounts: [usize; N_SLOTS],
}

impl UserCharge {
    pub fn amount(&self, slot: Slot) -> usize {
        self.amounts[slot as usize]
    }
}

/// Totals for every user with at least one connected peer.
#[derive(Debug, Default)]
pub struct UserRegistry {
    limits: UserLimits,
    usage: HashMap<u32, [usize; N_SLOTS]>,
}

impl UserRegistry {
    pub fn new(limits: UserLimits) -> Self {
        Self {
            limits,
            usage: HashMap::new(),
        }
    }

    pub fn limits(&self) -> UserLimits {
        self.limits
    }

    /// Charge `n` units of `slot` to `uid`, recorded in `charge`.
    pub fn charge(&mut self, uid: u32, charge: &mut UserCharge, slot: Slot, n: usize) -> Result<(), PeerError> {
        let usage = self.usage.entry(uid).or_default();
        let total = usage[slot as usize].saturating_add(n);
        if total > self.limits.limit(slot) {
            return Err(PeerError::Quota);
        }
        usage[slot as usize] = total;
        charge.amounts[slot as usize] += n;
        Ok(())
    }

    /// Give back up to `n` units previously charged through `charge`.
    pub fn discharge(&mut self, uid: u32, charge: &mut UserCharge, slot: Slot, n: usize) {
        let n = n.min(charge.amounts[slot as usize]);
        charge.amounts[slot as usize] -= n;
        if let Some(usage) = self.usage.get_mut(&uid) {
            usage[slot as usize] = usage[slot as usize].saturating_sub(n);
            if usage.iter().all(|u| *u == 0) {
                self.usage.remove(&uid);
            }
        }
    }

    /// Give back everything charged through `charge`.
    pub fn discharge_all(&mut self, uid: u32, charge: &mut UserCharge) {
        for slot in [Slot::Names, Slot::Matches, Slot::Replies] {
            let n = charge.amount(slot);
            self.discharge(uid, charge, slot, n);
        }
    }

    pub fn usage(&self, uid: u32, slot: Slot) -> usize {
        self.usage.get(&uid).map_or(0, |u| u[slot as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(max_names: usize) -> UserRegistry {
        UserRegistry::new(UserLimits {
            max_names,
            ..Default::default()
        })
    }

    #[test]
    fn test_charge_until_limit() {
        let mut users = registry(2);
        let mut charge = UserCharge::default();
        users.charge(1000, &mut charge, Slot::Names, 1).unwrap();
        users.charge(1000, &mut charge, Slot::Names, 1).unwrap();
        assert_eq!(
            users.charge(1000, &mut charge, Slot::Names, 1),
            Err(PeerError::Quota)
        );
        assert_eq!(charge.amount(Slot::Names), 2);
        assert_eq!(users.usage(1000, Slot::Names), 2);
    }

    #[test]
    fn test_limits_are_per_user_not_per_peer() {
        let mut users = registry(1);
        let mut a = UserCharge::default();
        let mut b = UserCharge::default();
        let mut c = UserCharge::default();
        users.charge(1000, &mut a, Slot::Names, 1).unwrap();
        assert_eq!(users.charge(1000, &mut b, Slot::Names, 1), Err(PeerError::Quota));
        users.charge(1001, &mut c, Slot::Names, 1).unwrap();
    }

    #[test]
    fn test_discharge_is_clamped() {
        let mut users = registry(4);
        let mut charge = UserCharge::default();
        users.charge(7, &mut charge, Slot::Names, 2).unwrap();
        users.discharge(7, &mut charge, Slot::Names, 5);
        assert_eq!(charge.amount(Slot::Names), 0);
        assert_eq!(users.usage(7, Slot::Names), 0);
    }

    #[test]
    fn test_discharge_all() {
        let mut users = registry(4);
        let mut charge = UserCharge::default();
        users.charge(7, &mut charge, Slot::Names, 1).unwrap();
        users.charge(7, &mut charge, Slot::Matches, 3).unwrap();
        users.discharge_all(7, &mut charge);
        assert_eq!(charge, UserCharge::default());
        assert_eq!(users.usage(7, Slot::Matches), 0);
    }
}
