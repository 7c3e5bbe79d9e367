//! Bound arithmetic for nested sets.
//!
//! Nothing in here touches storage. The patches computed here are handed to a
//! [`crate::persist::BoundsStore`] which applies them to every matching row in
//! a single statement. Both kinds of patch evaluate the left and the right
//! bound of a row independently, which is what lets an ancestor's right bound
//! move while its left bound stays put.

use crate::error::{NestsetError, Result};
use crate::node::Bounds;

/// Bounds for a fresh subtree of `height` slots starting at `position`.
/// The caller is responsible for opening a gap of the same height first.
pub fn insert_at(height: i64, position: i64) -> Bounds {
    Bounds::new(position, position + height - 1)
}

// ------------- Gap -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapDelta {
    pub cut: i64,
    pub height: i64,
}
impl GapDelta {
    pub fn shift(&self, bound: i64) -> i64 {
        if bound >= self.cut {
            bound + self.height
        } else {
            bound
        }
    }
    pub fn touches(&self, bounds: Bounds) -> bool {
        bounds.left >= self.cut || bounds.right >= self.cut
    }
    pub fn apply(&self, bounds: Bounds) -> Bounds {
        Bounds::new(self.shift(bounds.left), self.shift(bounds.right))
    }
    /// The delta that undoes this one.
    pub fn inverse(&self) -> GapDelta {
        GapDelta {
            cut: self.cut,
            height: -self.height,
        }
    }
}

/// Opens (`height > 0`) or closes (`height < 0`) a gap at `cut`.
pub fn gap_delta(cut: i64, height: i64) -> GapDelta {
    GapDelta { cut, height }
}

// ------------- Move -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovePlan {
    /// Bounds of the subtree being moved, before the move.
    pub subtree: Bounds,
    /// First slot of the span touched by the move.
    pub from: i64,
    /// Last slot of the span touched by the move.
    pub to: i64,
    /// Signed displacement applied to bounds inside the subtree.
    pub subtree_shift: i64,
    /// Signed displacement applied to the other bounds inside `[from, to]`.
    pub corridor_shift: i64,
}
impl MovePlan {
    pub fn shift(&self, bound: i64) -> i64 {
        if self.subtree.left <= bound && bound <= self.subtree.right {
            bound + self.subtree_shift
        } else if self.from <= bound && bound <= self.to {
            bound + self.corridor_shift
        } else {
            bound
        }
    }
    pub fn touches(&self, bounds: Bounds) -> bool {
        let within = |b: i64| self.from <= b && b <= self.to;
        within(bounds.left) || within(bounds.right)
    }
    pub fn apply(&self, bounds: Bounds) -> Bounds {
        Bounds::new(self.shift(bounds.left), self.shift(bounds.right))
    }
    /// Where the moved subtree ends up.
    pub fn destination(&self) -> Bounds {
        self.apply(self.subtree)
    }
}

/// Plans moving the subtree at `bounds` so that its left bound becomes
/// `position`. Returns `Ok(None)` when nothing lies between origin and
/// destination, in which case no row has to change.
pub fn move_node(bounds: Bounds, position: i64) -> Result<Option<MovePlan>> {
    if bounds.left < position && position <= bounds.right {
        return Err(NestsetError::MoveIntoSelf { bounds, position });
    }
    let height = bounds.height();
    let from = bounds.left.min(position);
    let to = bounds.right.max(position - 1);
    let distance = to - from + 1 - height;
    if distance == 0 {
        return Ok(None);
    }
    let (subtree_shift, corridor_shift) = if position > bounds.left {
        (distance, -height)
    } else {
        (-distance, height)
    };
    Ok(Some(MovePlan {
        subtree: bounds,
        from,
        to,
        subtree_shift,
        corridor_shift,
    }))
}

// ------------- Patch -------------
/// A bound patch ready to be applied by a store as one bulk update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundPatch {
    Gap(GapDelta),
    Move(MovePlan),
}
impl BoundPatch {
    pub fn shift(&self, bound: i64) -> i64 {
        match self {
            BoundPatch::Gap(gap) => gap.shift(bound),
            BoundPatch::Move(plan) => plan.shift(bound),
        }
    }
    pub fn touches(&self, bounds: Bounds) -> bool {
        match self {
            BoundPatch::Gap(gap) => gap.touches(bounds),
            BoundPatch::Move(plan) => plan.touches(bounds),
        }
    }
    pub fn apply(&self, bounds: Bounds) -> Bounds {
        Bounds::new(self.shift(bounds.left), self.shift(bounds.right))
    }
}
impl From<GapDelta> for BoundPatch {
    fn from(gap: GapDelta) -> Self {
        BoundPatch::Gap(gap)
    }
}
impl From<MovePlan> for BoundPatch {
    fn from(plan: MovePlan) -> Self {
        BoundPatch::Move(plan)
    }
}
