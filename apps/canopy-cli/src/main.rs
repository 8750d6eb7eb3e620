use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use canopy_batch::{VegetationSettings, VegetationSystem};
use canopy_cell::ProceduralPlacement;
use canopy_common::{Rect, Transform, VegetationPackage, splitmix64};
use canopy_persist::{InstanceSource, PersistentVegetationStorage, StorageFile};
use canopy_spatial::CellGrid;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "canopy-cli", about = "CLI tool for vegetation streaming and batching")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print version and crate info
    Info,
    /// Sweep a camera view across a terrain and report per-cycle statistics
    Simulate {
        /// Terrain edge length in world units
        #[arg(long, default_value = "2000")]
        terrain_size: f32,
        /// Cell edge length; overrides the settings file
        #[arg(long)]
        cell_size: Option<f32>,
        /// Number of update cycles
        #[arg(short, long, default_value = "60")]
        frames: usize,
        /// Worker threads; overrides the settings file
        #[arg(short, long)]
        threads: Option<i32>,
        /// View rectangle edge length
        #[arg(long, default_value = "400")]
        view_size: f32,
        /// Distance beyond the view that still casts shadows
        #[arg(long, default_value = "100")]
        shadow_margin: f32,
        /// JSON settings file
        #[arg(long)]
        settings: Option<PathBuf>,
        /// JSON vegetation package file
        #[arg(long)]
        package: Option<PathBuf>,
        /// Persistent storage directory to merge into the cells
        #[arg(long)]
        storage: Option<PathBuf>,
    },
    /// Persistent storage operations
    Storage {
        #[command(subcommand)]
        command: StorageCommand,
    },
}

#[derive(Subcommand)]
enum StorageCommand {
    /// Print the metadata of a storage directory
    Inspect { dir: PathBuf },
    /// Check a storage directory's payload hash and schema
    Verify { dir: PathBuf },
    /// Write a storage directory with scattered manual instances
    Seed {
        dir: PathBuf,
        /// Instances to place
        #[arg(short, long, default_value = "100")]
        instances: usize,
        /// Terrain edge length in world units
        #[arg(long, default_value = "2000")]
        terrain_size: f32,
        /// Cell edge length the instances are filed under
        #[arg(long, default_value = "100")]
        cell_size: f32,
        #[arg(long, default_value = "7")]
        seed: u64,
        /// JSON vegetation package file
        #[arg(long)]
        package: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Info => {
            println!("canopy-cli v{}", env!("CARGO_PKG_VERSION"));
            println!("common: {}", canopy_common::crate_info());
            println!("spatial: {}", canopy_spatial::crate_info());
            println!("pool: {}", canopy_pool::crate_info());
            println!("persist: {}", canopy_persist::crate_info());
            println!("cell: {}", canopy_cell::crate_info());
            println!("batch: {}", canopy_batch::crate_info());
        }
        Commands::Simulate {
            terrain_size,
            cell_size,
            frames,
            threads,
            view_size,
            shadow_margin,
            settings,
            package,
            storage,
        } => {
            let mut settings = match settings {
                Some(path) => VegetationSettings::from_json_file(&path)
                    .with_context(|| format!("loading settings from {}", path.display()))?,
                None => VegetationSettings::default(),
            };
            if let Some(cell_size) = cell_size {
                settings.cell_size = cell_size;
            }
            if let Some(threads) = threads {
                settings.thread_count = threads;
            }
            let package = load_package(package)?;

            let terrain = Rect::from_xz(0.0, 0.0, terrain_size, terrain_size);
            let mut system = VegetationSystem::new(
                package,
                settings,
                terrain,
                Arc::new(ProceduralPlacement::default()),
            )?;
            if let Some(dir) = storage {
                let loaded = StorageFile::new(&dir)
                    .load()
                    .with_context(|| format!("loading storage from {}", dir.display()))?;
                println!(
                    "Storage: {} instances, {} removed",
                    loaded.instance_count(),
                    loaded.removed_count()
                );
                system = system.with_storage(loaded);
            }

            println!(
                "Simulate: terrain={terrain_size}, cells={}, threads={}, frames={frames}",
                system.cells().len(),
                system.settings().effective_thread_count()
            );

            let travel = (terrain_size - view_size).max(0.0);
            for frame in 0..frames {
                let t = if frames > 1 {
                    frame as f32 / (frames - 1) as f32
                } else {
                    0.0
                };
                let x = t * travel;
                system.update_visibility(
                    Rect::from_xz(x, travel * 0.5, view_size, view_size),
                    shadow_margin,
                );
                let stats = system.run_cycle();
                println!(
                    "frame {frame:>4}: selected={:>4} loaded={:>3} batches={:>5} \
                     instances={:>8} failures={} time={:?}",
                    stats.selected_cells,
                    stats.loaded_cells,
                    stats.committed_batches,
                    stats.committed_instances,
                    stats.failures(),
                    stats.total_time()
                );
            }

            tracing::info!(frames, redraw = system.needs_redraw(), "simulation finished");
            let timer = system.timer();
            let pool = system.cache_pool().stats();
            let (allocated, reused) = pool
                .models
                .iter()
                .fold((0, 0), |(a, r), s| (a + s.allocated, r + s.reused));
            println!(
                "Cycle time: avg={:?}, max={:?}, over budget={}",
                timer.average(),
                timer.max(),
                timer.over_budget_count()
            );
            println!(
                "Pool: generation={}, lists allocated={allocated}, reused={reused}, \
                 recycled buffers={}",
                pool.generation, pool.recycled_buffers
            );
        }
        Commands::Storage { command } => match command {
            StorageCommand::Inspect { dir } => {
                let meta = StorageFile::new(&dir).meta()?;
                println!("Storage: {}", dir.display());
                println!("  schema: v{}", meta.schema_version);
                println!("  package: {}", meta.package_name);
                match meta.cell_size {
                    Some(size) => println!("  cell size: {size}"),
                    None => println!("  cell size: unknown"),
                }
                println!("  instances: {}", meta.instance_count);
                println!("  removed: {}", meta.removed_count);
                println!("  sha256: {}", meta.sha256);
            }
            StorageCommand::Verify { dir } => {
                let file = StorageFile::new(&dir);
                file.verify_integrity()?;
                let storage = file.load()?;
                println!(
                    "OK: {} cells, {} instances, {} removed",
                    storage.cells().count(),
                    storage.instance_count(),
                    storage.removed_count()
                );
            }
            StorageCommand::Seed {
                dir,
                instances,
                terrain_size,
                cell_size,
                seed,
                package,
            } => {
                let package = load_package(package)?;
                anyhow::ensure!(!package.models.is_empty(), "package has no models");
                let bounds = Rect::from_xz(0.0, 0.0, terrain_size, terrain_size);
                let grid = CellGrid::new(bounds, cell_size)?;

                let mut storage = PersistentVegetationStorage::new(package.name.clone())
                    .with_cell_size(cell_size);
                let mut state = seed;
                for _ in 0..instances {
                    state = splitmix64(state);
                    let x = (state >> 40) as f32 / (1u64 << 24) as f32 * terrain_size;
                    state = splitmix64(state);
                    let z = (state >> 40) as f32 / (1u64 << 24) as f32 * terrain_size;
                    let model = (state % package.models.len() as u64) as usize;

                    let transform = Transform::from_position(glam::Vec3::new(x, 0.0, z));
                    if let Some(cell) = grid.position_to_cell(transform.position) {
                        storage.add_instance(cell, model, transform, InstanceSource::Baked);
                    }
                }

                let meta = StorageFile::new(&dir).save(&storage)?;
                println!(
                    "Seeded {} instances into {} ({})",
                    meta.instance_count,
                    dir.display(),
                    meta.sha256
                );
            }
        },
    }

    Ok(())
}

fn load_package(path: Option<PathBuf>) -> anyhow::Result<VegetationPackage> {
    Ok(match path {
        Some(path) => VegetationPackage::from_json_file(&path)
            .with_context(|| format!("loading package from {}", path.display()))?,
        None => VegetationPackage::default(),
    })
}
