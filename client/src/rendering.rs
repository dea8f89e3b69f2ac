use macroquad::prelude::*;
use shared::sphere::SpherePoint;
use shared::terrain::GridTerrain;
use shared::{EntityId, EntityKind, EntityState, Faction, Lifecycle, ProjectileState, RegionId};
use std::collections::{BTreeMap, VecDeque};
use std::f64::consts::{PI, TAU};

/// Height of the HUD strip below the map.
const HUD_HEIGHT: f32 = 90.0;
const TANK_RADIUS: f32 = 4.0;
const BARREL_LENGTH: f32 = 9.0;

/// Per-frame state the renderer needs besides the world itself.
#[derive(Debug, Clone, Default)]
pub struct RenderConfig {
    pub client_id: Option<u32>,
    pub entity_id: Option<EntityId>,
    pub faction: Option<Faction>,
    pub prediction_enabled: bool,
    pub interpolation_enabled: bool,
    pub ping_ms: u64,
    pub fake_ping_ms: u64,
    pub tick: u32,
    pub pending_inputs: usize,
    pub divergence: Option<f64>,
    pub charge: Option<f32>,
    pub chat_draft: Option<String>,
    pub awaiting_deployment: bool,
    pub preview: Option<SpherePoint>,
}

/// What the frame shows of the world.
pub struct Scene<'a> {
    pub entities: &'a [EntityState],
    pub projectiles: &'a [ProjectileState],
    pub territory: &'a BTreeMap<RegionId, Faction>,
    pub terrain: Option<&'a GridTerrain>,
    pub kill_feed: &'a VecDeque<String>,
    pub chat_log: &'a VecDeque<String>,
}

pub fn faction_color(faction: Faction) -> Color {
    match faction {
        Faction::Red => Color::from_rgba(230, 70, 60, 255),
        Faction::Green => Color::from_rgba(80, 200, 90, 255),
        Faction::Blue => Color::from_rgba(70, 130, 240, 255),
    }
}

/// Equirectangular projection of a point onto a `width` x `height` map.
pub fn sphere_to_screen(point: &SpherePoint, width: f32, height: f32) -> (f32, f32) {
    (
        (point.theta / TAU) as f32 * width,
        (point.phi / PI) as f32 * height,
    )
}

/// Inverse of [`sphere_to_screen`]; `None` outside the map.
pub fn screen_to_sphere(x: f32, y: f32, width: f32, height: f32) -> Option<SpherePoint> {
    if width <= 0.0 || height <= 0.0 || !(0.0..width).contains(&x) || !(0.0..height).contains(&y) {
        return None;
    }
    Some(SpherePoint::new(
        f64::from(x / width) * TAU,
        f64::from(y / height) * PI,
    ))
}

/// Screen direction of a heading on the map (north is up, east is right).
fn heading_vector(heading: f64) -> (f32, f32) {
    let (sin_h, cos_h) = heading.sin_cos();
    (sin_h as f32, -cos_h as f32)
}

pub struct Renderer {
    width: f32,
    height: f32,
    map: Option<Texture2D>,
    map_territory: BTreeMap<RegionId, Faction>,
}

impl Renderer {
    pub fn new(width: usize, height: usize) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Renderer {
            width: width as f32,
            height: height as f32,
            map: None,
            map_territory: BTreeMap::new(),
        })
    }

    fn map_height(&self) -> f32 {
        (self.height - HUD_HEIGHT).max(1.0)
    }

    /// Map point under a screen position, for deployment picking.
    pub fn pick(&self, x: f32, y: f32) -> Option<SpherePoint> {
        screen_to_sphere(x, y, self.width, self.map_height())
    }

    pub fn render(&mut self, scene: &Scene<'_>, config: &RenderConfig) {
        self.width = screen_width();
        self.height = screen_height();

        clear_background(Color::from_rgba(26, 26, 26, 255));

        if let Some(terrain) = scene.terrain {
            self.draw_map(terrain, scene.territory);
        }

        for projectile in scene.projectiles {
            self.draw_projectile(projectile);
        }

        for entity in scene.entities {
            if entity.lifecycle != Lifecycle::Deployed {
                continue;
            }
            let is_local = Some(entity.id) == config.entity_id;
            self.draw_tank(entity, is_local);
        }

        if config.awaiting_deployment {
            if let Some(preview) = config.preview {
                let (x, y) = sphere_to_screen(&preview, self.width, self.map_height());
                draw_circle_lines(x, y, TANK_RADIUS * 2.0, 1.0, WHITE);
            }
        }

        self.draw_ui(scene, config);
    }

    /// Terrain and territory tint, rebuilt only when ownership changes.
    fn draw_map(&mut self, terrain: &GridTerrain, territory: &BTreeMap<RegionId, Faction>) {
        if self.map.is_none() || self.map_territory != *territory {
            self.map = Some(Self::build_map(terrain, territory));
            self.map_territory = territory.clone();
        }

        if let Some(texture) = &self.map {
            draw_texture_ex(
                texture,
                0.0,
                0.0,
                WHITE,
                DrawTextureParams {
                    dest_size: Some(vec2(self.width, self.map_height())),
                    ..Default::default()
                },
            );
        }
    }

    fn build_map(terrain: &GridTerrain, territory: &BTreeMap<RegionId, Faction>) -> Texture2D {
        let (cols, rows) = (terrain.lon_cells(), terrain.lat_cells());
        let ground = Color::from_rgba(48, 52, 44, 255);
        let mut image = Image::gen_image_color(cols as u16, rows as u16, ground);

        for row in 0..rows {
            for col in 0..cols {
                let color = if terrain.cell_blocked(col, row) {
                    Color::from_rgba(110, 100, 90, 255)
                } else {
                    match terrain
                        .cell_region(col, row)
                        .and_then(|region| territory.get(&region))
                    {
                        Some(owner) => {
                            let tint = faction_color(*owner);
                            Color::new(
                                ground.r * 0.6 + tint.r * 0.4,
                                ground.g * 0.6 + tint.g * 0.4,
                                ground.b * 0.6 + tint.b * 0.4,
                                1.0,
                            )
                        }
                        None => ground,
                    }
                };
                image.set_pixel(col as u32, row as u32, color);
            }
        }

        let texture = Texture2D::from_image(&image);
        texture.set_filter(FilterMode::Nearest);
        texture
    }

    fn draw_tank(&mut self, entity: &EntityState, is_local: bool) {
        let (x, y) = sphere_to_screen(&entity.motion.position(), self.width, self.map_height());
        let color = faction_color(entity.faction);

        draw_circle(x, y, TANK_RADIUS, color);
        let outline = if is_local { WHITE } else { Color::from_rgba(20, 20, 20, 255) };
        draw_circle_lines(x, y, TANK_RADIUS, if is_local { 2.0 } else { 1.0 }, outline);

        let (hx, hy) = heading_vector(entity.motion.heading);
        draw_line(x, y, x + hx * TANK_RADIUS * 1.5, y + hy * TANK_RADIUS * 1.5, 2.0, color);

        let turret = entity.motion.heading + f64::from(entity.turret_angle);
        let (tx, ty) = heading_vector(turret);
        draw_line(x, y, x + tx * BARREL_LENGTH, y + ty * BARREL_LENGTH, 1.0, WHITE);

        if entity.commander {
            draw_rectangle(x - 1.5, y - TANK_RADIUS - 6.0, 3.0, 3.0, YELLOW);
        }

        if entity.kind == EntityKind::Human && entity.max_hp > 0 {
            let ratio = (entity.hp.max(0) as f32) / (entity.max_hp as f32);
            let bar_width = TANK_RADIUS * 3.0;
            let bar_y = y + TANK_RADIUS + 2.0;
            draw_rectangle(x - bar_width / 2.0, bar_y, bar_width, 2.0, DARKGRAY);
            draw_rectangle(x - bar_width / 2.0, bar_y, bar_width * ratio, 2.0, GREEN);
        }
    }

    fn draw_projectile(&mut self, projectile: &ProjectileState) {
        let (x, y) = sphere_to_screen(&projectile.position, self.width, self.map_height());
        draw_circle(x, y, 1.5, faction_color(projectile.faction));
    }

    fn draw_ui(&mut self, scene: &Scene<'_>, config: &RenderConfig) {
        let y_start = self.map_height() + 8.0;
        let indicator_size = 12.0;
        let spacing = 25.0;

        let features = [
            ("P", config.prediction_enabled),
            ("I", config.interpolation_enabled),
        ];

        for (i, (label, enabled)) in features.iter().enumerate() {
            let x = 10.0 + (i as f32) * spacing;
            let color = if *enabled { GREEN } else { RED };

            draw_rectangle(x, y_start, indicator_size, indicator_size, color);
            draw_rectangle_lines(x, y_start, indicator_size, indicator_size, 1.0, WHITE);

            draw_text(label, x + 3.0, y_start + indicator_size + 12.0, 12.0, WHITE);
        }

        let connection_color = if config.client_id.is_some() {
            GREEN
        } else {
            RED
        };
        draw_rectangle(10.0, y_start + 35.0, 8.0, 8.0, connection_color);
        draw_text("CON", 20.0, y_start + 35.0 + 8.0, 12.0, WHITE);

        let ping_y = y_start + 50.0;
        let total_ping = config.ping_ms + config.fake_ping_ms;
        let ping_bars = ((total_ping / 20).min(10)) as i32;

        for i in 0..10i32 {
            let bar_color = if i < ping_bars {
                if total_ping < 50 {
                    GREEN
                } else if total_ping < 100 {
                    YELLOW
                } else {
                    RED
                }
            } else {
                Color::from_rgba(51, 51, 51, 255)
            };

            draw_rectangle(10.0 + (i as f32) * 3.0, ping_y, 2.0, 8.0, bar_color);
        }
        draw_text(&format!("{}ms", total_ping), 45.0, ping_y + 8.0, 12.0, WHITE);

        let column = 110.0;
        let mut lines = vec![format!("tick {}", config.tick)];
        if let (Some(entity_id), Some(faction)) = (config.entity_id, config.faction) {
            lines.push(format!("tank {} {:?}", entity_id, faction));
        }
        if let Some(local) = scene
            .entities
            .iter()
            .find(|entity| Some(entity.id) == config.entity_id)
        {
            lines.push(format!("hp {}/{} {:?}", local.hp, local.max_hp, local.lifecycle));
        }
        lines.push(format!(
            "pending {} / off {:.2}",
            config.pending_inputs,
            config.divergence.unwrap_or(0.0)
        ));
        for (i, line) in lines.iter().enumerate() {
            draw_text(line, column, y_start + 10.0 + (i as f32) * 14.0, 14.0, WHITE);
        }

        self.draw_territory_counts(scene.territory, column + 170.0, y_start + 10.0);

        if let Some(charge) = config.charge {
            let x = column + 170.0;
            let y = y_start + 60.0;
            draw_rectangle(x, y, 100.0, 8.0, DARKGRAY);
            draw_rectangle(x, y, 100.0 * charge.clamp(0.0, 1.0), 8.0, ORANGE);
        }

        let feed_x = self.width - 260.0;
        for (i, line) in scene.kill_feed.iter().enumerate() {
            draw_text(line, feed_x, 16.0 + (i as f32) * 14.0, 14.0, WHITE);
        }
        for (i, line) in scene.chat_log.iter().enumerate() {
            draw_text(line, feed_x, y_start + 10.0 + (i as f32) * 13.0, 13.0, LIGHTGRAY);
        }

        if let Some(draft) = &config.chat_draft {
            draw_text(&format!("> {}_", draft), 10.0, self.height - 6.0, 16.0, YELLOW);
        } else if config.awaiting_deployment {
            let hint = "Click the map to deploy";
            let size = measure_text(hint, None, 24, 1.0);
            draw_text(
                hint,
                (self.width - size.width) / 2.0,
                self.map_height() / 2.0,
                24.0,
                WHITE,
            );
        }
    }

    fn draw_territory_counts(&mut self, territory: &BTreeMap<RegionId, Faction>, x: f32, y: f32) {
        for (i, faction) in Faction::ALL.iter().enumerate() {
            let owned = territory.values().filter(|owner| *owner == faction).count();
            let line_y = y + (i as f32) * 14.0;
            draw_rectangle(x, line_y - 8.0, 8.0, 8.0, faction_color(*faction));
            draw_text(&format!("{} regions", owned), x + 12.0, line_y, 14.0, WHITE);
        }
    }
}
