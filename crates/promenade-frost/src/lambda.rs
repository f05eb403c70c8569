//! Lagrange interpolation coefficients and their memoization.

use std::collections::HashMap;

use k256::Scalar;
use parking_lot::Mutex;

/// The interpolating value λ_i for participant `id` over the polynomial
/// defined by `participants`.
///
/// Callers must guarantee: `id != 0`, no participant is zero, and there
/// are no duplicates.
pub fn compute_lambda(id: u16, participants: &[u16]) -> Scalar {
    let sid = Scalar::from(id as u64);
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &participant in participants {
        if participant == id {
            continue;
        }
        let p = Scalar::from(participant as u64);
        numerator *= p;
        denominator *= p - sid;
    }

    numerator * denominator.invert().unwrap_or(Scalar::ZERO)
}

/// Memoization cache for λ values, keyed by `(id, sorted participants)`.
///
/// One registry may be shared across concurrent signing sessions; entries
/// are immutable once written and insertion is atomic.
#[derive(Default)]
pub struct LambdaRegistry {
    inner: Mutex<HashMap<(u16, Vec<u16>), Scalar>>,
}

impl LambdaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached λ for `(id, participants)`, computing and
    /// recording it on first use.
    pub fn get_or_compute(&self, id: u16, participants: &[u16]) -> Scalar {
        let mut sorted = participants.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut inner = self.inner.lock();
        *inner
            .entry((id, sorted.clone()))
            .or_insert_with(|| compute_lambda(id, &sorted))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
