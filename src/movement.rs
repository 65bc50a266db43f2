//! Grid movement cost.
//!
//! Uniform-cost search over `(cell, diagonal parity)` states. Orthogonal
//! steps always cost one square's worth of feet and leave the parity alone.
//! Diagonal steps alternate: the first costs one square, the second two, the
//! third one again, and so on. Entering a weighted cell multiplies the cost
//! of that step.
//!
//! The search is a pure function of the grid, the extra blocked set and the
//! endpoints. It knows nothing about turns or ownership; callers check those
//! first.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use thiserror::Error;

use crate::state::grid::{GridGeometry, Position};

/// Why a move cannot be made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MoveError {
    #[error("destination {0} is outside the map")]
    OutOfBounds(Position),

    #[error("destination {0} is blocked")]
    Blocked(Position),

    #[error("no path to {0}")]
    NoPath(Position),

    #[error("move costs {cost} ft but only {budget} ft remain")]
    OverBudget { cost: u32, budget: u32 },
}

/// Cost in feet of one step from a state with the given parity.
/// Returns the step cost and the parity after the step.
fn step_cost(feet_per_square: u32, diagonal: bool, parity: u8) -> (u32, u8) {
    match (diagonal, parity) {
        (false, p) => (feet_per_square, p),
        (true, 0) => (feet_per_square, 1),
        (true, _) => (feet_per_square * 2, 0),
    }
}

/// Least cost in feet from `from` to `to`, or `None` if there is no path.
///
/// `blocked` holds cells that are impassable for this mover in addition to
/// the map's obstacles (usually other combatants). The start cell is never
/// treated as blocked.
pub fn shortest_cost(
    grid: &GridGeometry,
    blocked: &BTreeSet<Position>,
    from: Position,
    to: Position,
) -> Option<u32> {
    if from == to {
        return Some(0);
    }
    let passable = |p: Position| grid.is_walkable(p) && !blocked.contains(&p);
    if !passable(to) {
        return None;
    }

    let mut best: HashMap<(Position, u8), u32> = HashMap::new();
    let mut open = BinaryHeap::new();
    best.insert((from, 0), 0);
    open.push(Reverse((0u32, from, 0u8)));

    while let Some(Reverse((cost, cell, parity))) = open.pop() {
        if cell == to {
            return Some(cost);
        }
        if best.get(&(cell, parity)).is_some_and(|&c| c < cost) {
            continue;
        }

        for (next, diagonal) in cell.neighbors() {
            if !passable(next) {
                continue;
            }
            let (step, next_parity) = step_cost(grid.feet_per_square, diagonal, parity);
            let entry = step.saturating_mul(grid.terrain_multiplier(next));
            let next_cost = cost.saturating_add(entry);
            let key = (next, next_parity);
            if best.get(&key).map_or(true, |&c| next_cost < c) {
                best.insert(key, next_cost);
                open.push(Reverse((next_cost, next, next_parity)));
            }
        }
    }

    None
}

/// Cost of moving within a budget, with the reason when it is not possible.
pub fn movement_cost(
    grid: &GridGeometry,
    blocked: &BTreeSet<Position>,
    from: Position,
    to: Position,
    budget_ft: u32,
) -> Result<u32, MoveError> {
    if !grid.in_bounds(to) {
        return Err(MoveError::OutOfBounds(to));
    }
    if to != from && (grid.is_obstacle(to) || blocked.contains(&to)) {
        return Err(MoveError::Blocked(to));
    }

    let cost = shortest_cost(grid, blocked, from, to).ok_or(MoveError::NoPath(to))?;
    if cost > budget_ft {
        return Err(MoveError::OverBudget {
            cost,
            budget: budget_ft,
        });
    }
    Ok(cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn open_grid() -> GridGeometry {
        GridGeometry::new(10, 10)
    }

    fn none() -> BTreeSet<Position> {
        BTreeSet::new()
    }

    #[test]
    fn test_orthogonal_steps_are_cheap() {
        let cost = shortest_cost(&open_grid(), &none(), Position::new(0, 0), Position::new(3, 0));
        assert_eq!(cost, Some(15));
    }

    #[test]
    fn test_diagonal_alternation() {
        let grid = open_grid();
        let start = Position::new(0, 0);

        assert_eq!(shortest_cost(&grid, &none(), start, Position::new(1, 1)), Some(5));
        assert_eq!(shortest_cost(&grid, &none(), start, Position::new(2, 2)), Some(15));
        assert_eq!(shortest_cost(&grid, &none(), start, Position::new(3, 3)), Some(20));
        assert_eq!(shortest_cost(&grid, &none(), start, Position::new(4, 4)), Some(30));
    }

    #[test]
    fn test_difficult_terrain_doubles_step() {
        let grid = GridGeometry::new(3, 1).with_terrain(Position::new(1, 0), 2);
        let cost = shortest_cost(&grid, &none(), Position::new(0, 0), Position::new(2, 0));
        assert_eq!(cost, Some(15));
    }

    #[test]
    fn test_huge_terrain_multiplier_saturates() {
        let grid = GridGeometry::new(4, 1)
            .with_terrain(Position::new(1, 0), u32::MAX)
            .with_terrain(Position::new(2, 0), u32::MAX);
        let cost = shortest_cost(&grid, &none(), Position::new(0, 0), Position::new(3, 0));
        assert_eq!(cost, Some(u32::MAX));

        let err = movement_cost(&grid, &none(), Position::new(0, 0), Position::new(3, 0), 30);
        assert_eq!(
            err,
            Err(MoveError::OverBudget {
                cost: u32::MAX,
                budget: 30,
            })
        );
    }

    #[test]
    fn test_routes_around_obstacle() {
        // Wall at x=1 except the top row.
        let grid = GridGeometry::new(3, 3)
            .with_obstacle(Position::new(1, 1))
            .with_obstacle(Position::new(1, 2));

        let cost = shortest_cost(&grid, &none(), Position::new(0, 2), Position::new(2, 2));
        // (0,2) -> (0,1) -> (1,0) diag -> (2,1) diag -> (2,2)
        assert_eq!(cost, Some(5 + 5 + 10 + 5));
    }

    #[test]
    fn test_blocked_destination() {
        let grid = open_grid().with_obstacle(Position::new(1, 0));
        let err = movement_cost(&grid, &none(), Position::new(0, 0), Position::new(1, 0), 30);
        assert_eq!(err, Err(MoveError::Blocked(Position::new(1, 0))));

        let mut occupied = BTreeSet::new();
        occupied.insert(Position::new(0, 1));
        let err = movement_cost(&grid, &occupied, Position::new(0, 0), Position::new(0, 1), 30);
        assert_eq!(err, Err(MoveError::Blocked(Position::new(0, 1))));
    }

    #[test]
    fn test_out_of_bounds_and_no_path() {
        let grid = GridGeometry::new(3, 3)
            .with_obstacle(Position::new(1, 0))
            .with_obstacle(Position::new(1, 1))
            .with_obstacle(Position::new(1, 2));

        assert_eq!(
            movement_cost(&grid, &none(), Position::new(0, 0), Position::new(5, 0), 100),
            Err(MoveError::OutOfBounds(Position::new(5, 0)))
        );
        assert_eq!(
            movement_cost(&grid, &none(), Position::new(0, 0), Position::new(2, 0), 100),
            Err(MoveError::NoPath(Position::new(2, 0)))
        );
    }

    #[test]
    fn test_budget() {
        let grid = open_grid();
        assert_eq!(
            movement_cost(&grid, &none(), Position::new(0, 0), Position::new(6, 0), 30),
            Ok(30)
        );
        assert_eq!(
            movement_cost(&grid, &none(), Position::new(0, 0), Position::new(7, 0), 30),
            Err(MoveError::OverBudget { cost: 35, budget: 30 })
        );
    }

    #[test]
    fn test_obstacles_on_direct_line_increase_cost() {
        let start = Position::new(0, 2);
        let goal = Position::new(4, 2);
        let clear = open_grid();
        let one = clear.clone().with_obstacle(Position::new(2, 2));
        let wall = one
            .clone()
            .with_obstacle(Position::new(2, 1))
            .with_obstacle(Position::new(2, 3));

        let c0 = shortest_cost(&clear, &none(), start, goal).unwrap();
        let c1 = shortest_cost(&one, &none(), start, goal).unwrap();
        let c2 = shortest_cost(&wall, &none(), start, goal).unwrap();
        assert!(c0 < c1, "{c0} < {c1}");
        assert!(c1 < c2, "{c1} < {c2}");
    }

    proptest! {
        #[test]
        fn prop_rotation_symmetry(
            cols in 2i32..9,
            rows in 2i32..9,
            walls in proptest::collection::vec((0i32..9, 0i32..9), 0..12),
            a in (0i32..9, 0i32..9),
            b in (0i32..9, 0i32..9),
        ) {
            let mut grid = GridGeometry::new(cols, rows);
            for (x, y) in walls {
                grid.obstacles.insert(Position::new(x % cols, y % rows));
            }
            let from = Position::new(a.0 % cols, a.1 % rows);
            let to = Position::new(b.0 % cols, b.1 % rows);
            grid.obstacles.remove(&from);

            let mut rotated = GridGeometry::new(cols, rows);
            for p in &grid.obstacles {
                rotated.obstacles.insert(grid.rotate_180(*p));
            }

            let forward = shortest_cost(&grid, &BTreeSet::new(), from, to);
            let turned = shortest_cost(
                &rotated,
                &BTreeSet::new(),
                grid.rotate_180(from),
                grid.rotate_180(to),
            );
            prop_assert_eq!(forward, turned);
        }

        #[test]
        fn prop_adding_obstacle_never_cheapens(
            walls in proptest::collection::vec((0i32..8, 0i32..8), 0..10),
            extra in (0i32..8, 0i32..8),
        ) {
            let from = Position::new(0, 0);
            let to = Position::new(7, 7);
            let mut grid = GridGeometry::new(8, 8);
            for (x, y) in walls {
                grid.obstacles.insert(Position::new(x, y));
            }
            grid.obstacles.remove(&from);
            grid.obstacles.remove(&to);
            let before = shortest_cost(&grid, &BTreeSet::new(), from, to);

            let extra = Position::new(extra.0, extra.1);
            prop_assume!(extra != from && extra != to);
            grid.obstacles.insert(extra);
            let after = shortest_cost(&grid, &BTreeSet::new(), from, to);

            match (before, after) {
                (Some(b), Some(a)) => prop_assert!(a >= b),
                (None, after) => prop_assert_eq!(after, None),
                (Some(_), None) => {}
            }
        }
    }
}
