//! Price & tick utilities
//!
//! Pure functions over wire prices ([0, 1] decimals) and cents values.
//! A posted limit is rounded away from the quoted best so it is never
//! crossed by the price it was derived from.

use crate::models::OrderSide;

/// API-level hard price bounds for outcome shares.
pub const HARD_MIN_PRICE: f64 = 0.01;
pub const HARD_MAX_PRICE: f64 = 0.99;

/// Best bid at or below this while the ask sits at the opposite extreme
/// marks a book with no tradeable interior.
pub const DEAD_BOOK_BID_CENTS: f64 = 1.0;
pub const DEAD_BOOK_ASK_CENTS: f64 = 99.0;

/// 2¢-band above dead: tradeable in theory, dust in practice.
pub const DUST_BOOK_BID_CENTS: f64 = 2.0;
pub const DUST_BOOK_ASK_CENTS: f64 = 98.0;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum PriceError {
    #[error("invalid price: {0}")]
    InvalidPrice(f64),
    #[error("invalid tick: {0}")]
    InvalidTick(f64),
}

/// Round a price to the venue tick. BUY rounds up, SELL rounds down, so the
/// posted limit stays on the taker side of the quoted best.
pub fn round_to_tick(price: f64, tick: f64, side: OrderSide) -> Result<f64, PriceError> {
    if !price.is_finite() || price < 0.0 || price > 1.0 {
        return Err(PriceError::InvalidPrice(price));
    }
    if !tick.is_finite() || tick <= 0.0 || tick > 0.1 {
        return Err(PriceError::InvalidTick(tick));
    }
    let ticks = price / tick;
    // f64 division leaves residue on exact multiples (0.56 / 0.01); snap
    // before rounding so they pass through unchanged.
    let snapped = ticks.round();
    let rounded = if (ticks - snapped).abs() < 1e-9 {
        snapped
    } else {
        match side {
            OrderSide::Buy => ticks.ceil(),
            OrderSide::Sell => ticks.floor(),
        }
    };
    Ok(rounded * tick)
}

/// Clamp a price into the API-level hard bounds.
pub fn clamp_hard_bounds(price: f64) -> Result<f64, PriceError> {
    if !price.is_finite() || price < 0.0 || price > 1.0 {
        return Err(PriceError::InvalidPrice(price));
    }
    Ok(price.clamp(HARD_MIN_PRICE, HARD_MAX_PRICE))
}

/// True iff the book has no tradeable interior: bid ≤ 1¢ AND ask ≥ 99¢.
pub fn is_dead_book(bid_cents: f64, ask_cents: f64) -> bool {
    bid_cents <= DEAD_BOOK_BID_CENTS && ask_cents >= DEAD_BOOK_ASK_CENTS
}

/// Weaker predicate: bid ≤ 2¢ AND ask ≥ 98¢. A dead book is also dust.
pub fn is_dust_book(bid_cents: f64, ask_cents: f64) -> bool {
    bid_cents <= DUST_BOOK_BID_CENTS && ask_cents >= DUST_BOOK_ASK_CENTS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buy_rounds_up_sell_rounds_down() {
        let up = round_to_tick(0.523, 0.01, OrderSide::Buy).unwrap();
        assert!((up - 0.53).abs() < 1e-9);
        let down = round_to_tick(0.523, 0.01, OrderSide::Sell).unwrap();
        assert!((down - 0.52).abs() < 1e-9);
    }

    #[test]
    fn exact_multiples_pass_through() {
        let p = round_to_tick(0.56, 0.01, OrderSide::Buy).unwrap();
        assert!((p - 0.56).abs() < 1e-9);
        let p = round_to_tick(0.56, 0.01, OrderSide::Sell).unwrap();
        assert!((p - 0.56).abs() < 1e-9);
    }

    #[test]
    fn rejects_non_finite_and_out_of_range() {
        assert!(round_to_tick(f64::NAN, 0.01, OrderSide::Buy).is_err());
        assert!(round_to_tick(1.5, 0.01, OrderSide::Buy).is_err());
        assert!(round_to_tick(-0.1, 0.01, OrderSide::Sell).is_err());
        assert!(clamp_hard_bounds(f64::INFINITY).is_err());
    }

    #[test]
    fn hard_bounds_clamp() {
        assert_eq!(clamp_hard_bounds(0.001).unwrap(), HARD_MIN_PRICE);
        assert_eq!(clamp_hard_bounds(0.999).unwrap(), HARD_MAX_PRICE);
        assert_eq!(clamp_hard_bounds(0.5).unwrap(), 0.5);
    }

    #[test]
    fn dead_and_dust_predicates_are_distinct() {
        assert!(is_dead_book(1.0, 99.0));
        assert!(is_dust_book(1.0, 99.0));

        // Dust band but not dead.
        assert!(!is_dead_book(2.0, 98.0));
        assert!(is_dust_book(2.0, 98.0));

        assert!(!is_dust_book(48.0, 52.0));
        assert!(!is_dead_book(48.0, 52.0));
    }
}
