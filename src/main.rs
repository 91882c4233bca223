//! Headless shell around the cutout library.
//!
//! Opens the library once at startup and runs a single command against it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cutout::upload::normalize::decode_preview;
use cutout::{
    config, HttpRemover, Library, RemoverConfig, Store, UploadError, UploadPipeline,
    UNTITLED_FOLDER_ID,
};

#[derive(Parser, Debug)]
#[command(name = "cutout")]
#[command(about = "Organize images in folders and remove their backgrounds")]
struct Args {
    /// Library database (defaults to the platform data directory)
    #[arg(long, env = config::DB_PATH_VAR)]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List folders and their images
    List,
    /// Create a folder
    NewFolder { name: String },
    /// Upload image files and remove their backgrounds
    Upload {
        /// Target folder id
        #[arg(long, default_value = UNTITLED_FOLDER_ID)]
        folder: String,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Move an image to another folder
    Move { image: String, folder: String },
    /// Send an image for processing again
    Reprocess { image: String },
    /// Write an image's processed result (or original) to a PNG file
    Export {
        image: String,
        out: PathBuf,
        #[arg(long)]
        original: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    let db_path = match args.db {
        Some(path) => path,
        None => config::default_db_path()?,
    };
    let store = Store::open(&db_path)
        .with_context(|| format!("Failed to open library at {}", db_path.display()))?;
    let library = Arc::new(Library::new(store));

    match args.command {
        Command::List => list(&library),
        Command::NewFolder { name } => {
            let folder = library.add_folder(&name)?;
            println!("{}\t{}", folder.id, folder.name);
        }
        Command::Upload { folder, files } => {
            let pipeline = pipeline(&library)?;
            let mut failed = 0;
            for file in files {
                match pipeline.upload_file(&folder, &file).await {
                    Ok(image) => println!("✅ {}\t{}", image.id, image.name),
                    Err(UploadError::Remote { image, source }) => {
                        failed += 1;
                        println!("⚠️  {}\t{}\tno result: {}", image.id, image.name, source);
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("❌ {}: {}", file.display(), e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} upload(s) failed", failed);
            }
        }
        Command::Move { image, folder } => {
            let image = library.move_image_to_folder(&image, &folder)?;
            println!("{}\t{}", image.id, image.folder_id);
        }
        Command::Reprocess { image } => {
            let image = pipeline(&library)?.reprocess(&image).await?;
            println!("✅ {}\t{}", image.id, image.name);
        }
        Command::Export {
            image,
            out,
            original,
        } => {
            let image = library
                .image(&image)
                .with_context(|| format!("No image with id {}", image))?;
            let preview = (if original {
                Some(&image.base64_original)
            } else {
                image.base64_result.as_ref()
            })
            .with_context(|| format!("Image {} has no result yet", image.id))?;

            let bytes = decode_preview(preview)?;
            tokio::fs::write(&out, bytes)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            info!(image_id = %image.id, out = %out.display(), "Exported image");
        }
    }

    Ok(())
}

fn pipeline(library: &Arc<Library>) -> Result<UploadPipeline> {
    let config = RemoverConfig::from_env()?;
    let remover = HttpRemover::new(&config)?;
    Ok(UploadPipeline::new(Arc::clone(library), Arc::new(remover)))
}

fn list(library: &Library) {
    for folder in library.folders() {
        println!("📁 {} ({})", folder.name, folder.id);
        for image in folder.images {
            let status = if image.has_result() { "done" } else { "no result" };
            println!("   {}\t{}\t{}", image.id, image.name, status);
        }
    }
}
