//! Multiplayer snake on a wrapping grid.
//!
//! [`SnakeWorld`] is the snapshot both ends exchange; [`SnakeGame`] wraps it
//! with the seeded RNG the server needs for spawning food and respawning.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

use crate::state::{GameState, PredictedState};
use crate::ClientInput;

pub const DEFAULT_WORLD_WIDTH: i32 = 100;
pub const DEFAULT_WORLD_HEIGHT: i32 = 100;
pub const DEFAULT_FOOD_COUNT: usize = 80;

const MAX_SPAWN_ATTEMPTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Left => Direction::Right,
            Direction::Right => Direction::Left,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "UP",
            Direction::Down => "DOWN",
            Direction::Left => "LEFT",
            Direction::Right => "RIGHT",
        }
    }

    fn delta(self) -> (i32, i32) {
        match self {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown direction {0:?}")]
pub struct UnknownDirection(pub String);

impl FromStr for Direction {
    type Err = UnknownDirection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UP" => Ok(Direction::Up),
            "DOWN" => Ok(Direction::Down),
            "LEFT" => Ok(Direction::Left),
            "RIGHT" => Ok(Direction::Right),
            _ => Err(UnknownDirection(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snake {
    pub id: String,
    pub segments: Vec<Position>,
    pub direction: Direction,
}

impl Snake {
    pub fn new(id: &str, head: Position) -> Self {
        Self {
            id: id.to_string(),
            segments: vec![head],
            direction: Direction::Right,
        }
    }

    pub fn head(&self) -> Option<Position> {
        self.segments.first().copied()
    }

    /// Turns the snake unless the new direction would reverse it.
    pub fn steer(&mut self, direction: Direction) -> bool {
        if direction == self.direction.opposite() {
            return false;
        }
        self.direction = direction;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoodItem {
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnakeWorld {
    pub snakes: BTreeMap<String, Snake>,
    pub food_items: Vec<FoodItem>,
    pub width: i32,
    pub height: i32,
}

impl Default for SnakeWorld {
    fn default() -> Self {
        Self::new(DEFAULT_WORLD_WIDTH, DEFAULT_WORLD_HEIGHT)
    }
}

impl SnakeWorld {
    pub fn new(width: i32, height: i32) -> Self {
        Self {
            snakes: BTreeMap::new(),
            food_items: Vec::new(),
            width: width.max(3),
            height: height.max(3),
        }
    }

    pub fn snake(&self, id: &str) -> Option<&Snake> {
        self.snakes.get(id)
    }

    fn wrap(&self, position: Position) -> Position {
        Position {
            x: position.x.rem_euclid(self.width),
            y: position.y.rem_euclid(self.height),
        }
    }

    fn is_occupied(&self, position: Position) -> bool {
        self.food_items.iter().any(|f| f.position == position)
            || self
                .snakes
                .values()
                .any(|s| s.segments.contains(&position))
    }

    fn free_inner_cell<R: Rng>(&self, rng: &mut R) -> Position {
        let mut candidate = Position::new(1, 1);
        for _ in 0..MAX_SPAWN_ATTEMPTS {
            candidate = Position::new(
                rng.gen_range(1..self.width - 1),
                rng.gen_range(1..self.height - 1),
            );
            if !self.is_occupied(candidate) {
                break;
            }
        }
        candidate
    }

    /// Adds a food item on a free cell; gives up silently on a full board.
    pub fn spawn_food<R: Rng>(&mut self, rng: &mut R) {
        for _ in 0..MAX_SPAWN_ATTEMPTS {
            let candidate = Position::new(
                rng.gen_range(0..self.width),
                rng.gen_range(0..self.height),
            );
            if !self.is_occupied(candidate) {
                self.food_items.push(FoodItem {
                    position: candidate,
                });
                return;
            }
        }
    }

    pub fn spawn_snake<R: Rng>(&mut self, id: &str, rng: &mut R) {
        let head = self.free_inner_cell(rng);
        self.snakes.insert(id.to_string(), Snake::new(id, head));
    }

    fn respawn<R: Rng>(&mut self, id: &str, rng: &mut R) {
        let head = self.free_inner_cell(rng);
        if let Some(snake) = self.snakes.get_mut(id) {
            *snake = Snake::new(id, head);
        }
    }

    /// Moves every snake one cell in id order.
    pub fn step<R: Rng>(&mut self, rng: &mut R) {
        let ids: Vec<String> = self.snakes.keys().cloned().collect();
        for id in ids {
            self.move_snake(&id, rng);
        }
    }

    fn move_snake<R: Rng>(&mut self, id: &str, rng: &mut R) {
        let (new_head, own_len, hits_self) = match self.snakes.get(id) {
            Some(snake) => match snake.head() {
                Some(head) => {
                    let (dx, dy) = snake.direction.delta();
                    let new_head = self.wrap(Position::new(head.x + dx, head.y + dy));
                    let hits_self = snake.segments[1..].contains(&new_head);
                    (new_head, snake.segments.len(), hits_self)
                }
                None => {
                    self.respawn(id, rng);
                    return;
                }
            },
            None => return,
        };

        if hits_self {
            self.respawn(id, rng);
            return;
        }

        let collision = self
            .snakes
            .iter()
            .find(|(other_id, other)| other_id.as_str() != id && other.segments.contains(&new_head))
            .map(|(other_id, other)| (other_id.clone(), other.segments.clone()));

        let mut eaten = Vec::new();
        if let Some((other_id, other_segments)) = collision {
            if own_len > other_segments.len() {
                eaten = other_segments;
                self.respawn(&other_id, rng);
            } else {
                self.respawn(id, rng);
                return;
            }
        }

        let ate_food = match self.food_items.iter().position(|f| f.position == new_head) {
            Some(index) => {
                self.food_items.remove(index);
                true
            }
            None => false,
        };

        if let Some(snake) = self.snakes.get_mut(id) {
            snake.segments.extend(eaten);
            snake.segments.insert(0, new_head);
            if !ate_food {
                snake.segments.pop();
            }
        }

        if ate_food {
            self.spawn_food(rng);
        }
    }
}

fn interpolate_coordinate(current: i32, target: i32, factor: f32, size: i32) -> i32 {
    let mut diff = target - current;
    if diff.abs() > size / 2 {
        if diff > 0 {
            diff -= size;
        } else {
            diff += size;
        }
    }
    let value = current as f32 + factor * diff as f32;
    (value.round() as i32).rem_euclid(size)
}

impl PredictedState for SnakeWorld {
    fn apply_input(&mut self, client_id: &str, input: &str) {
        let Ok(direction) = input.parse::<Direction>() else {
            return;
        };
        if let Some(snake) = self.snakes.get_mut(client_id) {
            snake.steer(direction);
        }
    }

    fn advance_entity(&mut self, client_id: &str) {
        let Some(snake) = self.snakes.get(client_id) else {
            return;
        };
        let Some(head) = snake.head() else {
            return;
        };
        let (dx, dy) = snake.direction.delta();
        let new_head = self.wrap(Position::new(head.x + dx, head.y + dy));

        let ate_food = match self.food_items.iter().position(|f| f.position == new_head) {
            Some(index) => {
                self.food_items.remove(index);
                true
            }
            None => false,
        };

        if let Some(snake) = self.snakes.get_mut(client_id) {
            snake.segments.insert(0, new_head);
            if !ate_food {
                snake.segments.pop();
            }
        }
    }

    fn entity_matches(&self, other: &Self, client_id: &str) -> bool {
        match (self.snakes.get(client_id), other.snakes.get(client_id)) {
            (Some(a), Some(b)) => a.segments == b.segments,
            _ => false,
        }
    }

    fn graft_entity(&mut self, from: &Self, client_id: &str) {
        if let Some(snake) = from.snakes.get(client_id) {
            self.snakes.insert(client_id.to_string(), snake.clone());
        }
    }

    fn interpolate(&self, target: &Self, factor: f32) -> Self {
        let factor = factor.clamp(0.0, 1.0);
        let mut snakes = BTreeMap::new();

        for (id, target_snake) in &target.snakes {
            let Some(current_snake) = self.snakes.get(id) else {
                snakes.insert(id.clone(), target_snake.clone());
                continue;
            };

            let segments = target_snake
                .segments
                .iter()
                .enumerate()
                .map(|(i, to)| {
                    let from = current_snake.segments.get(i).copied().unwrap_or(*to);
                    Position {
                        x: interpolate_coordinate(from.x, to.x, factor, target.width),
                        y: interpolate_coordinate(from.y, to.y, factor, target.height),
                    }
                })
                .collect();

            snakes.insert(
                id.clone(),
                Snake {
                    id: id.clone(),
                    segments,
                    direction: target_snake.direction,
                },
            );
        }

        SnakeWorld {
            snakes,
            food_items: target.food_items.clone(),
            width: target.width,
            height: target.height,
        }
    }
}

/// Server-side snake simulation.
#[derive(Debug, Clone)]
pub struct SnakeGame {
    world: SnakeWorld,
    rng: StdRng,
}

impl SnakeGame {
    pub fn new(width: i32, height: i32, food_count: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut world = SnakeWorld::new(width, height);
        for _ in 0..food_count {
            world.spawn_food(&mut rng);
        }
        Self { world, rng }
    }

    pub fn world(&self) -> &SnakeWorld {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut SnakeWorld {
        &mut self.world
    }
}

impl Default for SnakeGame {
    fn default() -> Self {
        Self::new(DEFAULT_WORLD_WIDTH, DEFAULT_WORLD_HEIGHT, DEFAULT_FOOD_COUNT, 0)
    }
}

impl GameState for SnakeGame {
    type Snapshot = SnakeWorld;

    fn apply(&mut self, input: &ClientInput) {
        match input.input.parse::<Direction>() {
            Ok(direction) => {
                if let Some(snake) = self.world.snakes.get_mut(&input.client_id) {
                    snake.steer(direction);
                }
            }
            Err(e) => log::debug!("Ignoring input from {}: {}", input.client_id, e),
        }
    }

    // One grid cell per tick regardless of tick length.
    fn advance(&mut self, _dt: f32) {
        self.world.step(&mut self.rng);
    }

    fn snapshot(&self) -> SnakeWorld {
        self.world.clone()
    }

    fn init_entity(&mut self, client_id: &str) {
        self.world.spawn_snake(client_id, &mut self.rng);
    }

    fn remove_entity(&mut self, client_id: &str) {
        self.world.snakes.remove(client_id);
    }
}
