//! Headless driver: compile an entrant program, build a world, run it to the
//! tick limit, and report the score.

use anyhow::{Context, Result};
use clap::Parser;
use nanovat_asm::Program;
use nanovat_core::{OrganismKind, VatConfig, World};
use nanovat_isa::disassemble;
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "nanovat", about = "Artificial-life simulator for 16-bit organisms", version)]
struct Cli {
    /// Assembly source for the entrant organisms.
    program: PathBuf,

    /// RNG seed; omit for a fresh random run.
    #[arg(long)]
    seed: Option<u64>,

    /// Tick limit override.
    #[arg(long)]
    ticks: Option<u64>,

    /// Grid width override.
    #[arg(long)]
    width: Option<u16>,

    /// Grid height override.
    #[arg(long)]
    height: Option<u16>,

    /// Number of entrant organisms.
    #[arg(long)]
    organisms: Option<u16>,

    /// Number of built-in drones.
    #[arg(long)]
    drones: Option<u16>,

    /// Number of sludge elements.
    #[arg(long)]
    sludge: Option<u16>,

    /// Print the compiled listing instead of running.
    #[arg(long)]
    disassemble: bool,

    /// Log a progress line every N ticks; 0 disables.
    #[arg(long, default_value_t = 100_000)]
    report_every: u64,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

fn build_config(cli: &Cli) -> VatConfig {
    let defaults = VatConfig::default();
    VatConfig {
        grid_width: cli.width.unwrap_or(defaults.grid_width),
        grid_height: cli.height.unwrap_or(defaults.grid_height),
        organism_count: cli.organisms.unwrap_or(defaults.organism_count),
        drone_count: cli.drones.unwrap_or(defaults.drone_count),
        sludge_count: cli.sludge.unwrap_or(defaults.sludge_count),
        max_ticks: cli.ticks.unwrap_or(defaults.max_ticks),
        rng_seed: cli.seed,
        ..defaults
    }
}

/// Print the program as address-annotated disassembly, stopping after the
/// last populated 3-word group.
fn print_listing(program: &Program) {
    let last = program
        .image
        .iter()
        .rposition(|&word| word != 0)
        .unwrap_or(0);
    let end = (last / 3 + 1) * 3;
    for at in (0..end).step_by(3) {
        let words = [
            program.image[at],
            program.image[at + 1],
            program.image[at + 2],
        ];
        println!(
            "{at:4}  {:04X} {:04X} {:04X}  {}",
            words[0],
            words[1],
            words[2],
            disassemble(words, at as u16)
        );
    }
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let source = fs::read_to_string(&cli.program)
        .with_context(|| format!("reading {}", cli.program.display()))?;
    let program = nanovat_asm::compile(&source)
        .with_context(|| format!("compiling {}", cli.program.display()))?;

    if cli.disassemble {
        print_listing(&program);
        return Ok(());
    }

    let config = build_config(&cli);
    let mut world = World::new(config, &program.image).context("building world")?;
    info!(
        seed = world.seed(),
        name = %program.name,
        author = %program.author,
        "simulation starting"
    );

    while !world.is_finished() {
        world.step();
        if cli.report_every != 0 && world.tick().0.is_multiple_of(cli.report_every) {
            info!(tick = world.tick().0, score = world.score(), "progress");
        }
    }

    let snapshots = world.organism_snapshots();
    let active = |kind: OrganismKind| {
        snapshots
            .iter()
            .filter(|s| s.kind == kind && !s.hibernating)
            .count()
    };
    let mutated = snapshots.iter().filter(|s| !s.mutations.is_empty()).count();

    println!("Entrant: {}, {}", program.name, program.author);
    println!("Seed:    {}", world.seed());
    println!("Ticks:   {}", world.tick().0);
    println!("Score:   {}", world.score());
    println!(
        "Active:  {} organisms, {} drones ({} mutated)",
        active(OrganismKind::Standard),
        active(OrganismKind::Drone),
        mutated
    );

    Ok(())
}
