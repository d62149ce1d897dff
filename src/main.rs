//! forest-upload - data ingestion for the forest inventory map

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use forest_upload::base::{self, RasterUpload};
use forest_upload::checksum::ChecksumTracker;
use forest_upload::inventory::Inventory;
use forest_upload::workflow::{self, InventoryOutcome};
use forest_upload::{gpkg, Environment, InventorySession, Prompt, Step};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forest-upload")]
#[command(version)]
#[command(about = "Upload inventory data and raster base layers for the forest map")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory (geoserver data, inventory.gpkg, base rasters)
    #[arg(long, env = "DATADIR", global = true)]
    data_dir: Option<PathBuf>,

    /// Web root served to the map client
    #[arg(long, env = "WWWDIR", global = true)]
    www_dir: Option<PathBuf>,

    /// Image directory (default: <WWWDIR>/assets/img)
    #[arg(long, env = "IMGDIR", global = true)]
    img_dir: Option<PathBuf>,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload inventory data: a tree CSV plus a ZIP of tree images
    Inventory {
        /// Inventory CSV with header TreeID,Radius,X,Y,Height,Image
        #[arg(long)]
        csv: Option<PathBuf>,

        /// ZIP archive with one image per tree
        #[arg(long)]
        images: Option<PathBuf>,

        /// Layer name inside inventory.gpkg (default: inventory-<year>)
        #[arg(short, long)]
        layer: Option<String>,

        /// Continue without asking when inventory and archive disagree
        #[arg(short, long)]
        yes: bool,
    },

    /// Upload raster base layers (.tif)
    Base {
        /// Raster files to upload
        files: Vec<PathBuf>,
    },

    /// List inventory layers already on the server
    Layers,

    /// Recompute every checksum in checksums.json
    Checksums,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(if cli.verbose {
                "forest_upload=debug".parse()?
            } else {
                "forest_upload=warn".parse()?
            }))
            .init();
    }

    let env = Environment::resolve(cli.data_dir, cli.www_dir, cli.img_dir);

    match cli.command {
        Commands::Inventory {
            csv,
            images,
            layer,
            yes,
        } => run_inventory(&env, csv, images, layer, yes)?,

        Commands::Base { files } => run_base(&env, &files)?,

        Commands::Layers => {
            let layers = gpkg::list_layers(&env.inventory_gpkg)?;
            if layers.is_empty() {
                println!("No existing inventory data found at {}", env.inventory_gpkg.display());
            } else {
                for layer in &layers {
                    println!("{}", layer);
                }
                eprintln!("\nTotal: {} layers", layers.len());
            }
        }

        Commands::Checksums => {
            let record = ChecksumTracker::new(&env).update(&[])?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

fn run_inventory(
    env: &Environment,
    mut csv: Option<PathBuf>,
    mut images: Option<PathBuf>,
    layer: Option<String>,
    yes: bool,
) -> Result<()> {
    println!("Upload inventory data");
    println!("Data dir:   {}", env.data_dir.display());
    println!("Image dir:  {}", env.img_dir.display());
    println!();

    let layer = layer.unwrap_or_else(workflow::default_layer_name);
    let (existing, collides) = workflow::layer_collision(env, &layer)?;
    if existing.is_empty() {
        println!("No existing inventory data found on the server.");
    } else {
        println!("Existing inventory layers: [{}]", existing.join(", "));
    }
    if collides {
        println!("WARNING: You will overwrite the layer: {}", layer);
    }

    let mut session = InventorySession::new();

    loop {
        match session.advance(env, &layer)? {
            Step::NeedsInput(Prompt::InventoryCsv) => {
                let path = match csv.take() {
                    Some(path) => path,
                    None => prompt_path(
                        "Inventory CSV (header TreeID,Radius,X,Y,Height,Image; coordinates in EPSG:32632)",
                    )?,
                };
                let bytes = read_upload(&path)?;
                session
                    .provide_inventory(&bytes)
                    .with_context(|| format!("Invalid inventory {}", path.display()))?;
                print_inventory_preview(session.require_inventory()?);
            }

            Step::NeedsInput(Prompt::ImageArchive) => {
                let path = match images.take() {
                    Some(path) => path,
                    None => prompt_path("Image archive (.zip) with one image per tree")?,
                };
                let bytes = read_upload(&path)?;
                session
                    .provide_archive(bytes)
                    .with_context(|| format!("Invalid image archive {}", path.display()))?;
                if let Some(archive) = session.archive() {
                    println!("Archive:    {} images", archive.len());
                }
            }

            Step::NeedsInput(Prompt::ConfirmMismatches(report)) => {
                println!("\nWARNINGS");
                println!("{}", serde_json::to_string_pretty(&report)?);

                if yes || confirm("Continue anyway?")? {
                    session.confirm_mismatches();
                } else {
                    session.drop_cache();
                    println!("Aborted.");
                    return Ok(());
                }
            }

            Step::NeedsInput(Prompt::BaseRasters) => {
                bail!("Inventory upload does not take base rasters")
            }

            Step::Complete(outcome) => {
                print_inventory_summary(&outcome);
                return Ok(());
            }
        }
    }
}

fn print_inventory_preview(inventory: &Inventory) {
    println!("Inventory:  {} trees", inventory.len());
    for row in inventory.rows.iter().take(5) {
        println!(
            "  {:>6}  x={:<12} y={:<12} r={:<6} h={:<6} {}",
            row.tree_id, row.x, row.y, row.radius, row.height, row.image
        );
    }
    if inventory.len() > 5 {
        println!("  ... {} more", inventory.len() - 5);
    }
}

fn print_inventory_summary(outcome: &InventoryOutcome) {
    println!("\n=== Upload Summary ===");
    println!(
        "Layer:      {} ({} features{})",
        outcome.layer.layer,
        outcome.layer.features,
        if outcome.layer.replaced { ", replaced" } else { "" }
    );
    println!(
        "Images:     {} extracted ({} bytes)",
        outcome.images.extracted, outcome.images.bytes
    );
    if !outcome.reconciliation.is_clean() {
        println!(
            "Unmatched:  {} not in archive, {} not in inventory",
            outcome.reconciliation.missing_in_archive.len(),
            outcome.reconciliation.missing_in_inventory.len()
        );
    }
    println!("\ndone.");
}

fn run_base(env: &Environment, files: &[PathBuf]) -> Result<()> {
    println!("Upload base data");
    println!("Base dir:   {}", env.base_dir.display());
    println!();

    let uploads = files
        .iter()
        .map(|p| RasterUpload::from_path(p))
        .collect::<forest_upload::Result<Vec<_>>>()?;

    let pb = ProgressBar::new(uploads.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] Writing [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("=>-"),
    );

    let step = base::upload_rasters(env, &uploads, |done, _| pb.set_position(done as u64))?;
    pb.finish_and_clear();

    match step {
        Step::NeedsInput(_) => {
            println!("No raster files given. Pass one or more .tif files.");
        }
        Step::Complete(outcome) => {
            for path in &outcome.written {
                println!("Wrote {}", path.display());
            }
            println!("\ndone.");
        }
    }

    Ok(())
}

fn read_upload(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn prompt_path(label: &str) -> Result<PathBuf> {
    print!("{}: ", label);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    let input = input.trim();
    if input.is_empty() {
        bail!("No file provided");
    }
    Ok(PathBuf::from(input))
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
