//! Tracking of direct stack-pointer manipulation along a traversal path.
//!
//! The shadow displacement is the number of bytes the stack pointer currently sits below the frame
//! pointer. A stack-pointer relative displacement `d` then names the canonical (frame-pointer
//! relative) offset `d - shadow`.

/// The running stack-pointer adjustment of a single traversal path. It is a plain value: forking
/// a path copies it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShadowDisplacement {
    Known(i64),
    /// Converging paths disagreed about the adjustment, or it was changed by a non-constant
    /// amount.
    Unknown,
}

impl Default for ShadowDisplacement {
    fn default() -> Self {
        ShadowDisplacement::Known(0)
    }
}

impl ShadowDisplacement {
    /// Move the stack pointer `delta` bytes further down (a negative `delta` moves it up).
    pub fn shift(&mut self, delta: i64) {
        if let ShadowDisplacement::Known(d) = self {
            *d = d.wrapping_add(delta);
        }
    }

    /// Forget the adjustment.
    pub fn invalidate(&mut self) {
        *self = ShadowDisplacement::Unknown;
    }

    /// The canonical offset named by a stack-pointer relative `displacement`, if known.
    pub fn resolve(&self, displacement: i64) -> Option<i64> {
        match self {
            ShadowDisplacement::Known(d) => Some(displacement.wrapping_sub(*d)),
            ShadowDisplacement::Unknown => None,
        }
    }

    /// Join with a displacement arriving over another edge. Returns `true` if `self` changed.
    pub fn join_from(&mut self, other: &Self) -> bool {
        if self != other && *self != ShadowDisplacement::Unknown {
            *self = ShadowDisplacement::Unknown;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subtracting_from_sp_shifts_resolution() {
        let mut s = ShadowDisplacement::default();
        assert_eq!(s.resolve(4), Some(4));
        s.shift(16);
        assert_eq!(s.resolve(4), Some(-12));
        s.shift(-16);
        assert_eq!(s.resolve(4), Some(4));
    }

    #[test]
    fn forks_do_not_share() {
        let mut a = ShadowDisplacement::default();
        let b = a;
        a.shift(8);
        assert_eq!(b, ShadowDisplacement::Known(0));
        assert_eq!(a, ShadowDisplacement::Known(8));
    }

    #[test]
    fn join() {
        let mut a = ShadowDisplacement::Known(4);
        assert!(!a.join_from(&ShadowDisplacement::Known(4)));
        assert!(a.join_from(&ShadowDisplacement::Known(8)));
        assert_eq!(a, ShadowDisplacement::Unknown);
        assert!(!a.join_from(&ShadowDisplacement::Known(4)));
        a.shift(4);
        assert_eq!(a.resolve(0), None);
    }
}
