//! Demo driver: seeds a small coastal grid with two species and runs a few
//! simulated years, logging yearly stock summaries.

use anyhow::{Context, Result};
use rand::Rng;
use shoal_core::{
    BiomassMovement, HockeyStickRecruitment, LogisticGrower, Meristics, NaturalProcess, Species,
    SpeciesRegistry, StockConfig, StockWorld, TerminalBinPolicy,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const GRID_SIDE: usize = 8;
const YEARS: u64 = 5;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn registry() -> Result<SpeciesRegistry> {
    let anchovy = Species::new("anchovy", "ANC", Meristics::scalar(1.0));
    let yelloweye_meristics = Meristics::new(
        vec![vec![0.5, 1.2, 2.0], vec![0.5, 1.2, 2.0]],
        vec![vec![12.0, 25.0, 40.0], vec![12.0, 25.0, 40.0]],
        vec![0.0, 0.5, 1.0],
        None,
        vec![vec![0.2, 0.15, 0.1], vec![0.2, 0.15, 0.1]],
    )
    .context("yelloweye meristics")?;
    let yelloweye = Species::new("yelloweye", "YEL", yelloweye_meristics);
    SpeciesRegistry::new(vec![anchovy, yelloweye]).context("species registry")
}

fn bootstrap_world() -> Result<StockWorld> {
    let config = StockConfig {
        days_per_year: 365,
        rng_seed: Some(1701),
        observation_interval: 365,
        ..StockConfig::default()
    };
    let registry = registry()?;
    let (anchovy, _) = registry.by_name("anchovy").context("anchovy index")?;
    let (yelloweye_index, _) = registry.by_name("yelloweye").context("yelloweye index")?;
    let mut world = StockWorld::new(config, registry).context("world construction")?;

    // Biomass grid for the anchovy, one abundance column for the yelloweye.
    let mut grid = Vec::with_capacity(GRID_SIDE);
    for _ in 0..GRID_SIDE {
        let row: Vec<_> = (0..GRID_SIDE).map(|_| world.add_biomass_cell()).collect();
        grid.push(row);
    }
    for row in 0..GRID_SIDE {
        for col in 0..GRID_SIDE {
            if col + 1 < GRID_SIDE {
                world.connect(grid[row][col], grid[row][col + 1]);
            }
            if row + 1 < GRID_SIDE {
                world.connect(grid[row][col], grid[row + 1][col]);
            }
        }
    }

    let realloc = world
        .seed_biomass(anchovy, 2_000_000.0, 900_000.0, |_, rng| {
            rng.random_range(0.2..1.8)
        })
        .context("anchovy seeding")?;
    world.retire_barren_cells();

    let mut grower = LogisticGrower::new(anchovy, 0.6).context("grower")?;
    for id in world.arena().habitable_ids() {
        grower.track_cell(id).context("grower cells")?;
    }
    world.register_logistic_grower(grower).context("grower registration")?;
    let movement = BiomassMovement::differential(0.25, 0.1).context("movement")?;
    world
        .register_biomass_movement(anchovy, movement)
        .context("movement registration")?;
    world
        .register_reallocation(realloc)
        .context("reallocation registration")?;

    let rookery = world.add_abundance_cell();
    if let Some(matrix) = world
        .arena_mut()
        .get_mut(rookery)
        .and_then(|stock| stock.abundance_mut(yelloweye_index))
    {
        for subdivision in 0..matrix.subdivisions() {
            matrix.set(subdivision, 1, 5_000.0);
            matrix.set(subdivision, 2, 2_000.0);
        }
    }
    let rule =
        HockeyStickRecruitment::new(8_000.0, 0.2, 30_000.0).context("recruitment rule")?;
    let mut process = NaturalProcess::new(
        yelloweye_index,
        Box::new(rule),
        TerminalBinPolicy::PreserveLastAge,
        true,
    );
    process.track_cell(rookery).context("process cells")?;
    world
        .register_natural_process(process)
        .context("process registration")?;

    Ok(world)
}

fn main() -> Result<()> {
    init_tracing();
    let mut world = bootstrap_world()?;
    info!(
        cells = world.arena().len(),
        species = world.registry().len(),
        "world seeded"
    );

    let days = u64::from(world.config().days_per_year) * YEARS;
    for _ in 0..days {
        let events = world.step().context("world step")?;
        if events.year_rolled {
            if let Some(summary) = world.history().last() {
                info!(
                    year = summary.year,
                    habitable = summary.habitable_cells,
                    anchovy_biomass = summary.total_biomass[0],
                    yelloweye_biomass = summary.total_biomass[1],
                    yelloweye_recruits = summary.last_recruits[1],
                    "year closed"
                );
            }
        }
    }

    info!(ticks = world.tick().0, "run complete");
    Ok(())
}
