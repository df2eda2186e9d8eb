//! Churn demo: spawns, moves, re-materials, and despawns asteroids every frame
//! against the recording backend, then reports what reached the GPU.
//!
//! Usage: `instancing_churn [config.toml|config.ron]`

use instancing_engine::config::ConfigError;
use instancing_engine::foundation::logging;
use instancing_engine::prelude::*;
use rand::prelude::*;

// Simulation configuration
const FRAMES: usize = 600;
const MAX_ASTEROIDS: usize = 400;
const SPAWNS_PER_FRAME: usize = 6;
const DESPAWN_CHANCE: f64 = 0.015;
const RESKIN_CHANCE: f64 = 0.002;
const DRIFT_SPEED: f32 = 0.25;
const FIELD_RADIUS: f32 = 60.0;
const STATS_INTERVAL: usize = 100;

// Frames at which assets come and go
const WRECK_MESH_READY_FRAME: usize = 150;
const SCORCHED_DELETE_FRAME: usize = 300;
const SMALL_ROCK_DELETE_FRAME: usize = 450;

const SMALL_ROCK: MeshAssetId = MeshAssetId::new(1);
const LARGE_ROCK: MeshAssetId = MeshAssetId::new(2);
const WRECK: MeshAssetId = MeshAssetId::new(3);

const BASALT: MaterialId = MaterialId::new(1);
const ICE: MaterialId = MaterialId::new(2);
const SCORCHED: MaterialId = MaterialId::new(3);

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("instancing error: {0}")]
    Instancing(#[from] InstancingError),
}

struct Asteroid {
    entity: Entity,
    velocity: Vec3,
}

struct ChurnDemo {
    world: World,
    assets: AssetCatalog,
    instancing: InstancingSystem<RecordingBackend>,
    asteroids: Vec<Asteroid>,
    rng: StdRng,
}

impl ChurnDemo {
    fn new(config: InstancingConfig) -> Self {
        let mut assets = AssetCatalog::new();
        assets.insert_mesh(MeshAsset::new(SMALL_ROCK, "small_rock", 240, 720));
        assets.insert_mesh(MeshAsset::new(LARGE_ROCK, "large_rock", 1_800, 5_400));
        for material in [BASALT, ICE, SCORCHED] {
            assets.insert_material(material);
        }

        Self {
            world: World::new(),
            assets,
            instancing: InstancingSystem::new(RecordingBackend::new(), config),
            asteroids: Vec::new(),
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }

    fn random_mesh(&mut self) -> MeshComponent {
        let mesh = *[SMALL_ROCK, SMALL_ROCK, LARGE_ROCK, WRECK]
            .choose(&mut self.rng)
            .unwrap_or(&SMALL_ROCK);
        let material = *[BASALT, ICE, SCORCHED].choose(&mut self.rng).unwrap_or(&BASALT);
        MeshComponent::new(mesh, vec![material])
    }

    fn spawn_asteroids(&mut self) {
        let room = MAX_ASTEROIDS.saturating_sub(self.asteroids.len());
        for _ in 0..SPAWNS_PER_FRAME.min(room) {
            let position = Vec3::new(
                self.rng.gen_range(-FIELD_RADIUS..FIELD_RADIUS),
                self.rng.gen_range(-FIELD_RADIUS..FIELD_RADIUS),
                self.rng.gen_range(-FIELD_RADIUS..FIELD_RADIUS),
            );
            let velocity = Vec3::new(
                self.rng.gen_range(-DRIFT_SPEED..DRIFT_SPEED),
                self.rng.gen_range(-DRIFT_SPEED..DRIFT_SPEED),
                self.rng.gen_range(-DRIFT_SPEED..DRIFT_SPEED),
            );
            let scale = self.rng.gen_range(0.5..2.0);
            let mesh = self.random_mesh();
            let entity = self.world.spawn(Transform::from_position_scale(position, scale), mesh);
            self.asteroids.push(Asteroid { entity, velocity });
        }
    }

    fn update_asteroids(&mut self) {
        let mut index = 0;
        while index < self.asteroids.len() {
            let asteroid = &self.asteroids[index];
            let entity = asteroid.entity;
            let velocity = asteroid.velocity;

            if self.rng.gen_bool(DESPAWN_CHANCE) {
                self.world.despawn(entity);
                self.asteroids.swap_remove(index);
                continue;
            }

            // Only about a third of the field moves on a given frame
            if self.rng.gen_bool(0.3) {
                self.world.update_transform(entity, |t| t.translate(velocity));
            }
            if self.rng.gen_bool(RESKIN_CHANCE) {
                let mesh = self.random_mesh();
                self.world.insert_mesh(entity, mesh);
            }
            index += 1;
        }
    }

    fn asset_timeline(&mut self, frame: usize) {
        let event = match frame {
            WRECK_MESH_READY_FRAME => {
                log::info!("Frame {}: wreck mesh finished loading", frame);
                Some(self.assets.insert_mesh(MeshAsset::new(WRECK, "wreck", 3_000, 9_000)))
            }
            SCORCHED_DELETE_FRAME => {
                log::info!("Frame {}: deleting scorched material", frame);
                self.assets.remove_material(SCORCHED)
            }
            SMALL_ROCK_DELETE_FRAME => {
                log::info!("Frame {}: unloading small rock mesh", frame);
                self.assets.remove_mesh(SMALL_ROCK)
            }
            _ => None,
        };
        if let Some(event) = event {
            self.world.emit_asset_event(event);
        }
    }

    fn run(&mut self, frames: usize) -> Result<(), InstancingError> {
        for frame in 1..=frames {
            self.spawn_asteroids();
            self.update_asteroids();
            self.asset_timeline(frame);

            let events = self.world.drain_events();
            self.instancing.run_frame(events, &self.world, &self.assets)?;
            let draws = self.instancing.submit_draws()?;

            if frame % STATS_INTERVAL == 0 {
                let stats = self.instancing.stats();
                log::info!("Frame {}: {} draws, {}", frame, draws, stats);
                log::info!(
                    "  {} buffers live ({} bytes), {:.1}% of drawn slots are tombstones",
                    self.instancing.backend().live_buffer_count(),
                    self.instancing.backend().bytes_allocated(),
                    stats.waste_ratio() * 100.0
                );
            }
            self.instancing.backend_mut().take_calls();
        }
        Ok(())
    }
}

fn load_config() -> Result<InstancingConfig, ConfigError> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading instancing config from {}", path);
            InstancingConfig::load_from_file(&path)?
        }
        None => InstancingConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), DemoError> {
    logging::init();
    log::info!("Starting instancing churn demo");

    let config = load_config()?;
    let mut demo = ChurnDemo::new(config);
    demo.run(FRAMES)?;

    demo.instancing.clear();
    log::info!("Final: {}", demo.instancing.stats());
    Ok(())
}
