use anyhow::Context;
use clap::{Parser, Subcommand};
use imagevault_engine::blob::{LocalBlobStore, UrlSigner};
use imagevault_engine::config::Config;
use imagevault_engine::models::{ImageRecord, UserProfile, UserRecord};
use imagevault_engine::records::MemoryRepository;
use imagevault_engine::{MediaService, ServiceOptions, TransformationSpec, pipeline};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

type LocalService = MediaService<LocalBlobStore, MemoryRepository<ImageRecord>, MemoryRepository<UserRecord>>;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log at debug level regardless of RUST_LOG
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a user account
    Register {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Check an email/password pair
    Login {
        #[arg(short, long)]
        email: String,
        #[arg(short, long)]
        password: String,
    },
    /// Show one user's profile
    Me {
        #[arg(short, long)]
        user: Uuid,
    },
    /// List user accounts
    Users {
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Store an image file for a user
    Upload {
        #[arg(short, long)]
        user: Uuid,
        #[arg(short, long)]
        input: PathBuf,
    },
    /// List a user's images
    List {
        #[arg(short, long)]
        user: Uuid,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print a presigned URL for an image
    Url {
        #[arg(short, long)]
        user: Uuid,
        #[arg(long)]
        image: Uuid,
    },
    /// Transform a stored image. SPEC is inline JSON or @path/to/spec.json
    Transform {
        #[arg(short, long)]
        user: Uuid,
        #[arg(long)]
        image: Uuid,
        #[arg(short, long)]
        spec: String,
    },
    /// Delete a stored image
    Delete {
        #[arg(short, long)]
        user: Uuid,
        #[arg(long)]
        image: Uuid,
    },
    /// Run a transformation on a local file without touching any store
    Apply {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long)]
        spec: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Config::from_env()?;

    match cli.command {
        Commands::Apply { input, output, spec } => apply_local(&input, &output, &spec)?,
        command => {
            let service = open_service(&config).await?;
            run(&service, command).await?;
        }
    }

    Ok(())
}

async fn run(service: &LocalService, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Register {
            username,
            email,
            password,
        } => {
            let user = service.register_user(&username, &email, &password).await?;
            print_json(&UserProfile::from(&user))?;
        }
        Commands::Login { email, password } => {
            let user = service.verify_credentials(&email, &password).await?;
            print_json(&UserProfile::from(&user))?;
        }
        Commands::Me { user } => {
            print_json(&service.get_user(user).await?)?;
        }
        Commands::Users { skip, limit } => {
            print_json(&service.list_users(skip, limit).await?)?;
        }
        Commands::Upload { user, input } => {
            let bytes = std::fs::read(&input).with_context(|| format!("reading {}", input.display()))?;
            let filename = input
                .file_name()
                .and_then(|name| name.to_str())
                .context("input path has no usable file name")?;
            print_json(&service.upload(user, filename, bytes).await?)?;
        }
        Commands::List { user, skip, limit } => {
            print_json(&service.list_images(user, skip, limit).await?)?;
        }
        Commands::Url { user, image } => {
            println!("{}", service.image_url(image, user).await?);
        }
        Commands::Transform { user, image, spec } => {
            let spec = load_spec(&spec)?;
            print_json(&service.transform(image, user, spec).await?)?;
        }
        Commands::Delete { user, image } => {
            service.delete(image, user).await?;
            println!("Deleted {}", image);
        }
        Commands::Apply { input, output, spec } => apply_local(&input, &output, &spec)?,
    }
    Ok(())
}

fn apply_local(input: &Path, output: &Path, spec: &str) -> anyhow::Result<()> {
    let spec = load_spec(spec)?;
    let bytes = std::fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let original_format = extension(input)?;
    let result = pipeline::apply(&bytes, &spec, &original_format)?;
    std::fs::write(output, &result.bytes).with_context(|| format!("writing {}", output.display()))?;
    info!(
        width = result.width,
        height = result.height,
        format = %result.format,
        "wrote {}",
        output.display()
    );
    Ok(())
}

async fn open_service(config: &Config) -> anyhow::Result<LocalService> {
    let signer = UrlSigner::new(config.public_url.clone(), config.signing_key.clone().into_bytes())?;
    let blobs = LocalBlobStore::new(config.blob_dir(), signer);
    let images = MemoryRepository::open(config.images_path()).await?;
    let users = MemoryRepository::open(config.users_path()).await?;
    Ok(MediaService::new(
        Arc::new(blobs),
        Arc::new(images),
        Arc::new(users),
        ServiceOptions::from(config),
    ))
}

fn load_spec(arg: &str) -> anyhow::Result<TransformationSpec> {
    let json = match arg.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading spec file {}", path))?,
        None => arg.to_string(),
    };
    Ok(TransformationSpec::from_json(&json)?)
}

fn extension(path: &Path) -> anyhow::Result<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no file extension", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing(debug: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
