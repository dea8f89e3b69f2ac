//! Performance benchmarks for critical game systems

use client::prediction::PredictionReconciler;
use server::capture::{CaptureEngine, CaptureTuning};
use server::game::{GameState, Tank};
use server::interest::{InterestManager, WorldView};
use server::projectiles::{advance_projectiles, spawn_projectile, ProjectileTuning};
use shared::motion::{integrate, MotionState, MotionTuning};
use shared::sphere::SpherePoint;
use shared::terrain::{GridTerrain, TerrainOracle};
use shared::{DirectionalKeys, EntityId, EntityKind, Faction, InputSample};
use std::collections::BTreeMap;
use std::f64::consts::{FRAC_PI_2, TAU};
use std::time::Instant;

fn spread_point(i: usize, count: usize) -> SpherePoint {
    let theta = TAU * (i as f64) / (count as f64);
    let phi = 0.6 + 1.9 * ((i * 7919) % count) as f64 / (count as f64);
    SpherePoint::new(theta, phi)
}

/// Benchmarks the motion solver including footprint probes
#[test]
fn benchmark_motion_integration() {
    let terrain = GridTerrain::generate(3);
    let tuning = MotionTuning::default();
    let keys = DirectionalKeys {
        forward: true,
        right: true,
        ..DirectionalKeys::default()
    };
    let start = terrain
        .nearest_open(&SpherePoint::new(1.0, FRAC_PI_2))
        .expect("open ground");
    let mut state = MotionState::at(start, 0.0);

    let iterations = 100_000;
    let begin = Instant::now();

    for _ in 0..iterations {
        state = integrate(state, &keys, 0.05, &terrain, &tuning).state;
    }

    let duration = begin.elapsed();
    println!(
        "Motion integration: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(state.position().is_finite());
    // Should complete in under 2 seconds even in debug builds
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks terrain oracle lookups
#[test]
fn benchmark_terrain_queries() {
    let terrain = GridTerrain::generate(9);
    let iterations = 200_000;
    let begin = Instant::now();

    let mut blocked = 0usize;
    for i in 0..iterations {
        let point = spread_point(i, iterations);
        if terrain.is_blocked(point.theta, point.phi) {
            blocked += 1;
        }
        let _ = terrain.region_at(point.theta, point.phi);
    }

    let duration = begin.elapsed();
    println!(
        "Terrain queries: {} iterations in {:?}, {} blocked",
        iterations, duration, blocked
    );

    assert!(duration.as_millis() < 1000);
}

/// Benchmarks swept projectile flight against a crowded field
#[test]
fn benchmark_projectile_sweep() {
    let terrain = GridTerrain::open(120, 60);
    let hitbox = MotionTuning::default();
    let tuning = ProjectileTuning::default();

    let mut tanks = BTreeMap::new();
    for i in 0..100 {
        let faction = Faction::ALL[i % 3];
        let mut tank = Tank::new(EntityId(i as u32), EntityKind::Automated, faction);
        tank.deploy_at(spread_point(i, 100), (i as f64) * 0.37);
        tank.max_hp = i32::MAX;
        tank.hp = i32::MAX;
        tanks.insert(tank.id, tank);
    }

    let iterations = 50;
    let begin = Instant::now();
    let mut total_hits = 0;

    for round in 0..iterations {
        let mut projectiles: Vec<_> = tanks
            .values()
            .map(|tank| spawn_projectile(tank, 1.0, round as u32, &tuning, &hitbox))
            .collect();
        for _ in 0..20 {
            total_hits +=
                advance_projectiles(&mut projectiles, &mut tanks, &terrain, 0.05, &tuning, &hitbox)
                    .len();
        }
    }

    let duration = begin.elapsed();
    println!(
        "Projectile sweep: {} rounds of 100 shells in {:?} ({} hits)",
        iterations, duration, total_hits
    );

    assert!(duration.as_millis() < 5000);
}

/// Benchmarks per-observer interest filtering
#[test]
fn benchmark_interest_rebuild() {
    let mut view = WorldView::default();
    for i in 0..500 {
        let mut tank = Tank::new(EntityId(i as u32), EntityKind::Automated, Faction::ALL[i % 3]);
        tank.deploy_at(spread_point(i, 500), 0.0);
        view.push_entity(tank.to_state(false));
    }

    let mut interest = InterestManager::new(35.0, 45.0);
    let iterations = 200;
    let begin = Instant::now();

    let mut included = 0;
    for tick in 0..iterations {
        for observer in 0..32u32 {
            let reference = spread_point((observer as usize * 13 + tick) % 500, 500);
            included += interest.rebuild(observer, Some(reference), &view).entities.len();
        }
    }

    let duration = begin.elapsed();
    println!(
        "Interest rebuild: {} ticks x 32 observers in {:?} ({} inclusions)",
        iterations, duration, included
    );

    assert!(included > 0);
    assert!(duration.as_millis() < 3000);
}

/// Benchmarks territory capture with every region contested
#[test]
fn benchmark_capture_update() {
    let terrain = GridTerrain::open(120, 60);
    let mut engine = CaptureEngine::from_terrain(&terrain, CaptureTuning::default());

    let occupants: Vec<_> = (0..600)
        .map(|i| {
            let point = spread_point(i, 600);
            (
                EntityId(i as u32),
                Faction::ALL[i % 3],
                terrain.region_at(point.theta, point.phi),
            )
        })
        .collect();

    let iterations = 2000;
    let begin = Instant::now();
    let mut changes = 0;

    for _ in 0..iterations {
        engine.update_membership(occupants.iter().copied());
        changes += engine.update(0.05).len();
    }

    let duration = begin.elapsed();
    println!(
        "Capture update: {} ticks over {} regions in {:?} ({} ownership changes)",
        iterations,
        engine.region_count(),
        duration,
        changes
    );

    assert!(duration.as_millis() < 5000);
}

/// Benchmarks the full server step with a bot population
#[test]
fn benchmark_game_step() {
    let mut game = GameState::new(5);
    for _ in 0..96 {
        game.add_bot();
    }

    let iterations = 200;
    let begin = Instant::now();

    for _ in 0..iterations {
        game.step(&[], &[], 0.05);
    }

    let duration = begin.elapsed();
    println!(
        "Game step: {} ticks with {} tanks in {:?} ({:.2} μs/tick)",
        iterations,
        game.tanks.len(),
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(game.tick, iterations);
    assert!(duration.as_millis() < 5000);
}

/// Benchmarks reconciliation with a full buffer of unconfirmed inputs
#[test]
fn benchmark_reconciliation_replay() {
    let terrain = GridTerrain::generate(4);
    let start = terrain
        .nearest_open(&SpherePoint::new(3.0, 1.4))
        .expect("open ground");
    let start = MotionState::at(start, 0.0);

    let iterations = 500;
    let begin = Instant::now();

    for _ in 0..iterations {
        let mut reconciler = PredictionReconciler::default();
        reconciler.reset(start);
        for sequence in 1..=60 {
            reconciler.record(
                InputSample {
                    sequence,
                    keys: DirectionalKeys {
                        forward: true,
                        left: sequence % 3 == 0,
                        ..DirectionalKeys::default()
                    },
                    turret_angle: 0.0,
                    dt: 1.0 / 60.0,
                },
                &terrain,
            );
        }
        reconciler.reconcile(start, 10, &terrain);
    }

    let duration = begin.elapsed();
    println!(
        "Reconciliation: {} replays of 50 inputs in {:?}",
        iterations, duration
    );

    assert!(duration.as_millis() < 3000);
}
