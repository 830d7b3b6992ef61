//! Transport bids.
//!
//! Before a message is sent every registered transport is asked what it would cost
//! to carry it. The cheapest usable bid wins; equal costs go to the transport that
//! was registered first.

use std::fmt;

use super::TransportId;

/// Cost marking a bid that must never be selected.
pub const TRANSIENT_FAIL: u32 = 999_999;

/// A transport's self-reported cost for carrying one message. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bid {
    cost: u32,
    transport: TransportId,
}

impl Bid {
    pub const fn new(cost: u32, transport: TransportId) -> Self {
        Self { cost, transport }
    }

    /// A bid that will never be selected.
    pub const fn transient_fail(transport: TransportId) -> Self {
        Self::new(TRANSIENT_FAIL, transport)
    }

    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn transport(&self) -> TransportId {
        self.transport
    }

    /// Whether the bid may be selected at all.
    pub fn is_usable(&self) -> bool {
        self.cost < TRANSIENT_FAIL
    }
}

impl fmt::Display for Bid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bid {}", self.transport, self.cost)
    }
}

/// Pick the cheapest usable bid.
///
/// Bids must be supplied in transport registration order: among equal costs the
/// first one encountered wins.
pub fn select_lowest<I>(bids: I) -> Option<Bid>
where
    I: IntoIterator<Item = Bid>,
{
    bids.into_iter()
        .filter(Bid::is_usable)
        .min_by_key(Bid::cost)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NTCP: TransportId = TransportId::new("NTCP");
    const SSU: TransportId = TransportId::new("SSU");

    #[test]
    fn lowest_cost_wins() {
        let selected = select_lowest([Bid::new(50, NTCP), Bid::new(30, SSU)]);
        assert_eq!(selected.map(|b| b.transport()), Some(SSU));
    }

    #[test]
    fn ties_go_to_first_registered() {
        let selected = select_lowest([Bid::new(10, NTCP), Bid::new(10, SSU)]);
        assert_eq!(selected.map(|b| b.transport()), Some(NTCP));

        let selected = select_lowest([Bid::new(10, SSU), Bid::new(10, NTCP)]);
        assert_eq!(selected.map(|b| b.transport()), Some(SSU));
    }

    #[test]
    fn sentinel_bids_are_never_selected() {
        assert!(!Bid::transient_fail(NTCP).is_usable());
        assert_eq!(select_lowest([Bid::transient_fail(NTCP)]), None);
        let selected = select_lowest([Bid::transient_fail(NTCP), Bid::new(TRANSIENT_FAIL - 1, SSU)]);
        assert_eq!(selected.map(|b| b.transport()), Some(SSU));
    }

    #[test]
    fn no_bids_selects_nothing() {
        assert_eq!(select_lowest(std::iter::empty()), None);
    }
}
