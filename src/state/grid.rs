//! Battle map geometry.
//!
//! The grid is the large, rarely-changing part of the externally visible
//! state. It travels on its own versioned channel (see `sync`), so it is kept
//! as a plain value type that can be compared and serialized cheaply.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Feet covered by one grid square unless a map says otherwise.
pub const DEFAULT_FEET_PER_SQUARE: u32 = 5;

/// Default map size used before the desk loads a map.
pub const DEFAULT_GRID_COLS: i32 = 20;
pub const DEFAULT_GRID_ROWS: i32 = 20;

/// Grid cell coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Number of king moves between two cells.
    pub fn chebyshev(&self, other: &Position) -> i32 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }

    /// Check if two positions are adjacent (including diagonals).
    pub fn is_adjacent_to(&self, other: &Position) -> bool {
        self.chebyshev(other) == 1
    }

    /// Straight-line reach in feet, as used for range checks.
    pub fn distance_feet(&self, other: &Position, feet_per_square: u32) -> u32 {
        self.chebyshev(other) as u32 * feet_per_square
    }

    /// The 8 surrounding cells, orthogonal first.
    pub fn neighbors(&self) -> [(Position, bool); 8] {
        let Position { x, y } = *self;
        [
            (Position::new(x + 1, y), false),
            (Position::new(x - 1, y), false),
            (Position::new(x, y + 1), false),
            (Position::new(x, y - 1), false),
            (Position::new(x + 1, y + 1), true),
            (Position::new(x + 1, y - 1), true),
            (Position::new(x - 1, y + 1), true),
            (Position::new(x - 1, y - 1), true),
        ]
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A cell with a movement cost multiplier (difficult terrain is 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerrainCell {
    #[serde(flatten)]
    pub position: Position,
    pub multiplier: u32,
}

/// Map geometry: bounds, impassable cells and weighted cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub cols: i32,
    pub rows: i32,

    #[serde(default = "default_feet_per_square")]
    pub feet_per_square: u32,

    #[serde(default)]
    pub obstacles: BTreeSet<Position>,

    /// Multipliers keyed by cell; absent cells cost 1x.
    #[serde(default, with = "terrain_list")]
    pub terrain: BTreeMap<Position, u32>,
}

fn default_feet_per_square() -> u32 {
    DEFAULT_FEET_PER_SQUARE
}

impl Default for GridGeometry {
    fn default() -> Self {
        Self::new(DEFAULT_GRID_COLS, DEFAULT_GRID_ROWS)
    }
}

impl GridGeometry {
    pub fn new(cols: i32, rows: i32) -> Self {
        Self {
            cols,
            rows,
            feet_per_square: DEFAULT_FEET_PER_SQUARE,
            obstacles: BTreeSet::new(),
            terrain: BTreeMap::new(),
        }
    }

    pub fn with_obstacle(mut self, pos: Position) -> Self {
        self.obstacles.insert(pos);
        self
    }

    pub fn with_terrain(mut self, pos: Position, multiplier: u32) -> Self {
        self.set_terrain(pos, multiplier);
        self
    }

    /// Set a cell's cost multiplier. A multiplier of 1 (or 0) clears it.
    pub fn set_terrain(&mut self, pos: Position, multiplier: u32) {
        if multiplier <= 1 {
            self.terrain.remove(&pos);
        } else {
            self.terrain.insert(pos, multiplier);
        }
    }

    /// Check if position is within grid bounds.
    pub fn in_bounds(&self, pos: Position) -> bool {
        pos.x >= 0 && pos.y >= 0 && pos.x < self.cols && pos.y < self.rows
    }

    pub fn is_obstacle(&self, pos: Position) -> bool {
        self.obstacles.contains(&pos)
    }

    /// In bounds and not an obstacle.
    pub fn is_walkable(&self, pos: Position) -> bool {
        self.in_bounds(pos) && !self.is_obstacle(pos)
    }

    pub fn terrain_multiplier(&self, pos: Position) -> u32 {
        self.terrain.get(&pos).copied().unwrap_or(1)
    }

    /// The cell reached by rotating the map half a turn.
    pub fn rotate_180(&self, pos: Position) -> Position {
        Position::new(self.cols - 1 - pos.x, self.rows - 1 - pos.y)
    }
}

/// Terrain travels as a list of `{x, y, multiplier}` objects since JSON
/// object keys must be strings.
mod terrain_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{Position, TerrainCell};

    pub fn serialize<S: Serializer>(
        terrain: &BTreeMap<Position, u32>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let cells: Vec<TerrainCell> = terrain
            .iter()
            .map(|(position, multiplier)| TerrainCell {
                position: *position,
                multiplier: *multiplier,
            })
            .collect();
        cells.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Position, u32>, D::Error> {
        let cells = Vec::<TerrainCell>::deserialize(deserializer)?;
        Ok(cells
            .into_iter()
            .filter(|c| c.multiplier > 1)
            .map(|c| (c.position, c.multiplier))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_position_adjacency() {
        let p = Position::new(2, 2);

        for (n, _) in p.neighbors() {
            assert!(p.is_adjacent_to(&n));
        }

        assert!(!p.is_adjacent_to(&Position::new(2, 2)));
        assert!(!p.is_adjacent_to(&Position::new(0, 0)));
        assert!(!p.is_adjacent_to(&Position::new(4, 4)));
    }

    #[test]
    fn test_bounds_and_obstacles() {
        let grid = GridGeometry::new(5, 4).with_obstacle(Position::new(1, 1));

        assert!(grid.in_bounds(Position::new(4, 3)));
        assert!(!grid.in_bounds(Position::new(5, 3)));
        assert!(!grid.in_bounds(Position::new(-1, 0)));
        assert!(!grid.is_walkable(Position::new(1, 1)));
        assert!(grid.is_walkable(Position::new(2, 1)));
    }

    #[test]
    fn test_terrain_clears_at_unit_multiplier() {
        let mut grid = GridGeometry::new(5, 5).with_terrain(Position::new(2, 2), 2);
        assert_eq!(grid.terrain_multiplier(Position::new(2, 2)), 2);

        grid.set_terrain(Position::new(2, 2), 1);
        assert_eq!(grid.terrain_multiplier(Position::new(2, 2)), 1);
        assert!(grid.terrain.is_empty());
    }

    #[test]
    fn test_geometry_json_shape() {
        let grid = GridGeometry::new(3, 3)
            .with_obstacle(Position::new(0, 1))
            .with_terrain(Position::new(2, 2), 3);

        let json = serde_json::to_value(&grid).unwrap();
        assert_eq!(json["terrain"], serde_json::json!([{"x": 2, "y": 2, "multiplier": 3}]));
        assert_eq!(json["obstacles"], serde_json::json!([{"x": 0, "y": 1}]));

        let back: GridGeometry = serde_json::from_value(json).unwrap();
        assert_eq!(back, grid);
    }

    #[test]
    fn test_distance_feet() {
        let a = Position::new(0, 0);
        assert_eq!(a.distance_feet(&Position::new(3, 1), 5), 15);
        assert_eq!(a.distance_feet(&Position::new(0, 0), 5), 0);
    }
}
