use flockgrid_core::{AgentData, FlockConfig, FlockWorld, NeighborStrategy, WorldError};
use glam::Vec3;

fn seeded_config(agents: usize, seed: u64) -> FlockConfig {
    let mut config = FlockConfig {
        initial_agents: agents,
        rng_seed: Some(seed),
        worker_threads: Some(4),
        history_capacity: 64,
        ..FlockConfig::default()
    };
    config.params.neighbor_capacity = 1024;
    config
}

fn positions(world: &FlockWorld) -> Vec<Vec3> {
    world.agents().columns().positions().to_vec()
}

#[test]
fn seeded_worlds_are_reproducible() {
    let run = |seed| {
        let mut world = FlockWorld::new(seeded_config(400, seed)).expect("world");
        for _ in 0..30 {
            world.step().expect("step");
        }
        (positions(&world), world.history().copied().collect::<Vec<_>>())
    };
    let (positions_a, history_a) = run(42);
    let (positions_b, history_b) = run(42);
    assert_eq!(positions_a, positions_b);
    assert_eq!(history_a, history_b);

    let (positions_c, _) = run(43);
    assert_ne!(positions_a, positions_c);
}

#[test]
fn strategy_switch_waits_for_the_next_tick() {
    let mut world = FlockWorld::new(seeded_config(200, 1)).expect("world");
    let first = world.step().expect("step");
    assert_eq!(first.strategy, NeighborStrategy::CellNeighborList);

    world.set_active_strategy(NeighborStrategy::MergedCellNeighborList);
    assert_eq!(world.active_strategy(), NeighborStrategy::CellNeighborList);
    assert_eq!(
        world.pending_strategy(),
        Some(NeighborStrategy::MergedCellNeighborList)
    );

    let second = world.step().expect("step");
    assert_eq!(second.strategy, NeighborStrategy::MergedCellNeighborList);
    assert_eq!(world.active_strategy(), NeighborStrategy::MergedCellNeighborList);
    assert_eq!(world.pending_strategy(), None);
}

#[test]
fn every_strategy_passes_the_crosscheck_while_flying() {
    let mut world = FlockWorld::new(seeded_config(500, 9)).expect("world");
    for strategy in NeighborStrategy::ALL {
        world.set_active_strategy(strategy);
        for _ in 0..5 {
            world.step().expect("step");
        }
        let mismatches = world.crosscheck().expect("crosscheck");
        assert!(mismatches.is_empty(), "{strategy}: {mismatches:?}");
        assert_eq!(world.active_strategy(), strategy);
    }
}

#[test]
fn combined_and_list_strategies_fly_the_same_flock() {
    let fly = |strategy| {
        let mut config = seeded_config(300, 17);
        config.strategy = strategy;
        let mut world = FlockWorld::new(config).expect("world");
        for _ in 0..3 {
            world.step().expect("step");
        }
        positions(&world)
    };
    let listed = fly(NeighborStrategy::CellNeighborList);
    for strategy in [
        NeighborStrategy::CombinedNeighborList,
        NeighborStrategy::CombinedCellCell,
    ] {
        let combined = fly(strategy);
        for (a, b) in listed.iter().zip(&combined) {
            assert!((*a - *b).length() < 1e-3, "{strategy}: {a} vs {b}");
        }
    }
}

#[test]
fn flock_stays_near_the_cage() {
    let mut world = FlockWorld::new(seeded_config(300, 5)).expect("world");
    for _ in 0..240 {
        world.step().expect("step");
    }
    let limit = world.config().wall_scale;
    for pos in positions(&world) {
        assert!(pos.is_finite());
        assert!(pos.abs().max_element() < limit, "escaped to {pos}");
    }
}

#[test]
fn population_changes_keep_handles_valid() {
    let mut world = FlockWorld::new(seeded_config(50, 2)).expect("world");
    world.set_population(80);
    assert_eq!(world.agent_count(), 80);
    assert_eq!(world.despawn(30), 30);
    assert_eq!(world.agent_count(), 50);

    let a = world.spawn_agent(AgentData::new(Vec3::new(-2.0, -2.0, -2.0), Vec3::Z * 2.0));
    let b = world.spawn_agent(AgentData::new(Vec3::new(-2.0, -2.0, -1.7), Vec3::Z * 2.0));
    world.refresh_neighbors().expect("refresh");
    assert_eq!(world.neighbors_of(a), Some(vec![b]));
    assert_eq!(world.neighbors_of(b), Some(Vec::new()));

    assert!(world.remove_agent(a).is_some());
    assert_eq!(world.neighbors_of(a), None);
    world.step().expect("step after removal");
    assert_eq!(world.agent_count(), 51);
    assert_eq!(world.neighbors_of(b).map(|n| n.len() <= 1), Some(true));
    world.set_population(0);
    let summary = world.step().expect("empty step");
    assert_eq!(summary.agent_count, 0);
    assert_eq!(summary.neighbor_pairs, 0);
}

#[test]
fn parameter_updates_apply_on_the_next_tick() {
    let mut world = FlockWorld::new(seeded_config(100, 8)).expect("world");
    world.step().expect("step");
    let before = world.grid().grid_size();

    let mut params = world.config().params;
    params.neighbor_search_range = 0.6;
    world.update_params(params).expect("valid params");
    assert_eq!(world.config().params.neighbor_search_range, 1.2);
    world.step().expect("step");
    assert_eq!(world.config().params.neighbor_search_range, 0.6);
    assert!(world.grid().grid_size().x > before.x);

    params.neighbor_search_angle = 0.0;
    assert!(matches!(
        world.update_params(params),
        Err(WorldError::InvalidConfig(_))
    ));
}

#[test]
fn wall_scale_resizes_the_domain() {
    let mut world = FlockWorld::new(seeded_config(100, 4)).expect("world");
    world.set_wall_scale(20.0).expect("valid scale");
    assert_eq!(world.domain().hi(), Vec3::splat(6.0));
    world.step().expect("step");
    assert_eq!(world.config().wall_scale, 20.0);
    assert_eq!(world.domain().hi(), Vec3::splat(11.0));
    assert!(world.set_wall_scale(4.0).is_err(), "walls closer than wall_distance");
}

#[test]
fn queued_wall_scale_bounds_parameter_updates() {
    let mut world = FlockWorld::new(seeded_config(100, 6)).expect("world");
    world.set_wall_scale(8.0).expect("valid scale");

    let mut params = world.config().params;
    params.wall_distance = 4.5;
    assert!(matches!(
        world.update_params(params),
        Err(WorldError::InvalidConfig(_))
    ));
    world.step().expect("queued scale still applies");
    assert_eq!(world.config().wall_scale, 8.0);
    assert_eq!(world.config().params.wall_distance, 3.0);

    params.wall_distance = 3.5;
    world.update_params(params).expect("fits the new cage");
    world.step().expect("step");
    assert_eq!(world.config().params.wall_distance, 3.5);
}

#[test]
fn queued_parameters_bound_wall_scale_changes() {
    let mut world = FlockWorld::new(seeded_config(100, 6)).expect("world");
    let mut params = world.config().params;
    params.wall_distance = 4.5;
    world.update_params(params).expect("fits the current cage");
    assert!(world.set_wall_scale(8.0).is_err());

    world.step().expect("step");
    assert_eq!(world.config().wall_scale, 10.0);
    assert_eq!(world.config().params.wall_distance, 4.5);
}

#[test]
fn unsizeable_grids_are_rejected_when_queued() {
    let mut world = FlockWorld::new(seeded_config(100, 2)).expect("world");
    world.step().expect("step");
    let grid_size = world.grid().grid_size();

    let mut params = world.config().params;
    params.neighbor_search_range = 0.001;
    assert!(matches!(
        world.update_params(params),
        Err(WorldError::Index(_))
    ));
    world.step().expect("step");
    assert_eq!(world.grid().grid_size(), grid_size);
    assert_eq!(world.config().params.neighbor_search_range, 1.2);
}

#[test]
fn direct_strategy_leaves_the_grid_empty() {
    let mut world = FlockWorld::new(seeded_config(200, 3)).expect("world");
    world.step().expect("step");
    assert_eq!(world.grid().len(), 200);

    world.set_active_strategy(NeighborStrategy::Direct);
    world.step().expect("step");
    assert!(world.grid().is_empty());
    let mut cells = Vec::new();
    world.grid().get_contains_index_list(&mut cells);
    assert!(cells.is_empty());

    world.set_active_strategy(NeighborStrategy::CellNeighborList);
    world.step().expect("step");
    assert!(!world.grid().is_empty());
}

#[test]
fn overflowing_lists_are_reported_in_the_summary() {
    let mut config = seeded_config(400, 12);
    config.params.neighbor_capacity = 3;
    let mut world = FlockWorld::new(config).expect("world");
    let summary = world.step().expect("step");
    assert!(summary.dropped_neighbors > 0);
    assert!(
        world
            .agents()
            .columns()
            .neighbors()
            .iter()
            .all(|list| list.len() <= 3)
    );
    assert!(world.crosscheck().expect("crosscheck").is_empty());
}

#[test]
fn invalid_configs_are_rejected() {
    let mut config = FlockConfig::default();
    config.params.range_coef = 20.0;
    assert!(matches!(
        FlockWorld::new(config),
        Err(WorldError::InvalidConfig(_))
    ));
}
