//! Reference top-down world used by the server binary and the tests.

use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::{EntityId, EntitySnapshot, PlayerId, INPUT_DOWN, INPUT_LEFT, INPUT_RIGHT, INPUT_UP};
use std::collections::BTreeMap;

use crate::simulation::Simulation;

pub const ARENA_SIZE: f32 = 32.0;
pub const BODY_RADIUS: f32 = 0.4;
pub const MOVE_SPEED: f32 = 5.0;
/// New bodies appear in `[0, SPAWN_AREA)` on both axes.
const SPAWN_AREA: f32 = 10.0;

const BOT_INPUTS: [u32; 9] = [
    0,
    INPUT_UP,
    INPUT_DOWN,
    INPUT_LEFT,
    INPUT_RIGHT,
    INPUT_UP | INPUT_LEFT,
    INPUT_UP | INPUT_RIGHT,
    INPUT_DOWN | INPUT_LEFT,
    INPUT_DOWN | INPUT_RIGHT,
];

#[derive(Debug, Clone, Copy)]
struct BotBrain {
    change_every: f32,
    until_change: f32,
}

#[derive(Debug, Clone)]
pub struct Body {
    pub entity_id: EntityId,
    pub player_id: PlayerId,
    pub x: f32,
    pub y: f32,
    pub vel_x: f32,
    pub vel_y: f32,
    pub view_id: u8,
    /// Last input bitmask, held until the next one arrives.
    pub input: u32,
    bot: Option<BotBrain>,
}

impl Body {
    fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            entity_id: self.entity_id,
            player_id: self.player_id,
            x: self.x,
            y: self.y,
            vel_x: self.vel_x,
            vel_y: self.vel_y,
            view_id: self.view_id,
        }
    }

    pub fn is_bot(&self) -> bool {
        self.bot.is_some()
    }
}

pub struct World {
    bodies: BTreeMap<EntityId, Body>,
    next_entity_id: EntityId,
    rng: StdRng,
}

impl Default for World {
    fn default() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic world for tests and benchmarks.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            bodies: BTreeMap::new(),
            next_entity_id: 1,
            rng,
        }
    }

    pub fn body(&self, entity: EntityId) -> Option<&Body> {
        self.bodies.get(&entity)
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    fn spawn(&mut self, player_id: PlayerId, bot: Option<BotBrain>) -> EntityId {
        let entity_id = self.next_entity_id;
        self.next_entity_id += 1;

        let body = Body {
            entity_id,
            player_id,
            x: self.rng.gen::<f32>() * SPAWN_AREA,
            y: self.rng.gen::<f32>() * SPAWN_AREA,
            vel_x: 0.0,
            vel_y: 0.0,
            view_id: self.rng.gen_range(1..=2),
            input: 0,
            bot,
        };

        info!(
            "Spawned entity {} for player {} at ({:.2}, {:.2})",
            entity_id, player_id, body.x, body.y
        );
        self.bodies.insert(entity_id, body);
        entity_id
    }

    /// Spawns a body that wanders on its own, changing direction every 0.5 to 1 seconds.
    pub fn spawn_bot(&mut self, player_id: PlayerId) -> EntityId {
        let change_every = self.rng.gen::<f32>() / 2.0 + 0.5;
        self.spawn(
            player_id,
            Some(BotBrain {
                change_every,
                until_change: 0.0,
            }),
        )
    }

    fn steer_bots(&mut self, dt: f32) {
        for body in self.bodies.values_mut() {
            let Some(brain) = body.bot.as_mut() else {
                continue;
            };

            brain.until_change -= dt;
            if brain.until_change <= 0.0 {
                brain.until_change = brain.change_every;
                body.input = BOT_INPUTS[self.rng.gen_range(0..BOT_INPUTS.len())];
            }
        }
    }

    fn separate_bodies(&mut self) {
        let min_distance = BODY_RADIUS * 2.0;
        let mut bodies: Vec<&mut Body> = self.bodies.values_mut().collect();

        for i in 0..bodies.len() {
            let (head, tail) = bodies.split_at_mut(i + 1);
            let a = &mut *head[i];

            for b in tail.iter_mut() {
                let dx = b.x - a.x;
                let dy = b.y - a.y;
                if dx.abs() >= min_distance || dy.abs() >= min_distance {
                    continue;
                }
                let distance = (dx * dx + dy * dy).sqrt();
                if distance >= min_distance {
                    continue;
                }

                // coincident centers are pushed apart along x
                let (nx, ny) = if distance > f32::EPSILON {
                    (dx / distance, dy / distance)
                } else {
                    (1.0, 0.0)
                };
                let push = (min_distance - distance) / 2.0;

                a.x = clamp_to_arena(a.x - nx * push);
                a.y = clamp_to_arena(a.y - ny * push);
                b.x = clamp_to_arena(b.x + nx * push);
                b.y = clamp_to_arena(b.y + ny * push);
            }
        }
    }
}

fn clamp_to_arena(value: f32) -> f32 {
    value.clamp(BODY_RADIUS, ARENA_SIZE - BODY_RADIUS)
}

/// Unit direction for an input bitmask. Up is positive y.
fn input_direction(input: u32) -> (f32, f32) {
    let mut x: f32 = 0.0;
    let mut y: f32 = 0.0;
    if input & INPUT_LEFT != 0 {
        x -= 1.0;
    }
    if input & INPUT_RIGHT != 0 {
        x += 1.0;
    }
    if input & INPUT_UP != 0 {
        y += 1.0;
    }
    if input & INPUT_DOWN != 0 {
        y -= 1.0;
    }

    let length = (x * x + y * y).sqrt();
    if length > 0.0 {
        (x / length, y / length)
    } else {
        (0.0, 0.0)
    }
}

impl Simulation for World {
    fn advance(&mut self, dt: f32) {
        self.steer_bots(dt);

        for body in self.bodies.values_mut() {
            let (dx, dy) = input_direction(body.input);
            body.vel_x = dx * MOVE_SPEED;
            body.vel_y = dy * MOVE_SPEED;
            body.x = clamp_to_arena(body.x + body.vel_x * dt);
            body.y = clamp_to_arena(body.y + body.vel_y * dt);
        }

        self.separate_bodies();
    }

    fn collect_snapshots(&self) -> Vec<EntitySnapshot> {
        self.bodies.values().map(Body::snapshot).collect()
    }

    fn spawn_entity(&mut self, player_id: PlayerId) -> EntityId {
        self.spawn(player_id, None)
    }

    fn despawn_entity(&mut self, entity: EntityId) -> bool {
        let removed = self.bodies.remove(&entity).is_some();
        if removed {
            info!("Despawned entity {}", entity);
        }
        removed
    }

    fn entity_is_alive(&self, entity: EntityId) -> bool {
        self.bodies.contains_key(&entity)
    }

    fn apply_input(&mut self, entity: EntityId, input: u32) {
        if let Some(body) = self.bodies.get_mut(&entity) {
            body.input = input;
        }
    }
}
