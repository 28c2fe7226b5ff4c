//! Local order book for Bybit `orderbook.<depth>` topics.
//!
//! Bybit sends one `snapshot` followed by `delta` messages that add, update
//! or remove levels; a level with size `0` is removed. The book keeps both
//! sides sorted best-first so the top `n` levels can be handed to the
//! catalog after every message.

/// Incremental book retaining up to `N` levels per side.
///
/// Bids are sorted descending by price, asks ascending.
pub struct OrderBook<const N: usize> {
    bids: Vec<[f64; 2]>,
    asks: Vec<[f64; 2]>,
}

/// Tolerance for floating-point price comparison.
const PRICE_EPS: f64 = 1e-10;

impl<const N: usize> OrderBook<N> {
    pub fn new() -> Self {
        Self { bids: Vec::with_capacity(N), asks: Vec::with_capacity(N) }
    }

    /// Replace the entire book with a snapshot.
    pub fn set_snapshot(&mut self, bids: &[[f64; 2]], asks: &[[f64; 2]]) {
        self.bids.clear();
        self.asks.clear();
        self.update(bids, asks);
    }

    /// Apply a delta.
    pub fn update(&mut self, bids: &[[f64; 2]], asks: &[[f64; 2]]) {
        for &[price, size] in bids {
            apply_level(&mut self.bids, price, size, N, |level, p| level < p);
        }
        for &[price, size] in asks {
            apply_level(&mut self.asks, price, size, N, |level, p| level > p);
        }
    }

    /// Best `depth` levels of each side.
    pub fn top(&self, depth: usize) -> (Vec<[f64; 2]>, Vec<[f64; 2]>) {
        let n = depth.clamp(1, N);
        (self.bids.iter().take(n).copied().collect(), self.asks.iter().take(n).copied().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

impl<const N: usize> Default for OrderBook<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Upsert or remove one level on a side kept sorted so that
/// `worse(existing, new)` marks the insertion point. The worst level is
/// dropped beyond `max`.
fn apply_level(levels: &mut Vec<[f64; 2]>, price: f64, size: f64, max: usize, worse: impl Fn(f64, f64) -> bool) {
    if let Some(idx) = levels.iter().position(|l| (l[0] - price).abs() < PRICE_EPS) {
        if size == 0.0 {
            levels.remove(idx);
        } else {
            levels[idx][1] = size;
        }
    } else if size > 0.0 {
        let pos = levels.iter().position(|l| worse(l[0], price)).unwrap_or(levels.len());
        levels.insert(pos, [price, size]);
        levels.truncate(max);
    }
}
