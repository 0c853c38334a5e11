//! ALFA Photos Sync - CLI
//!
//! Offline tooling for envelopes, key bundles and the local cache.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use alfa_photos_sync::crypto::StandardSuite;
use alfa_photos_sync::{
    EnvelopeCodec, EnvelopeMeta, FileType, KeyBundle, KeyManager, LocalFiles, RecordKind,
    SqliteStore, SyncConfig, VaultResult,
};

#[derive(Parser)]
#[command(name = "alfa-sync")]
#[command(author = "Karen Tonoyan")]
#[command(version = alfa_photos_sync::VERSION)]
#[command(about = "ALFA Photos Sync - End-to-end encrypted photo backup tools")]
struct Cli {
    /// Config file (JSON); defaults apply when missing
    #[arg(short, long, default_value = "./alfa_sync.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a key pair and write its password-wrapped bundle
    Keygen {
        /// Bundle output path
        out: PathBuf,

        /// Password wrapping the private key
        #[arg(short, long)]
        password: String,
    },

    /// Encrypt a file to the bundle's public key
    Encrypt {
        input: PathBuf,
        output: PathBuf,

        /// Key bundle path
        #[arg(short, long)]
        bundle: PathBuf,

        #[arg(short = 't', long = "type", value_enum, default_value = "photo")]
        file_type: KindArg,

        /// Video duration in seconds
        #[arg(long, default_value_t = 0)]
        duration: u32,
    },

    /// Decrypt an envelope
    Decrypt {
        input: PathBuf,
        output: PathBuf,

        #[arg(short, long)]
        bundle: PathBuf,

        #[arg(short, long)]
        password: String,
    },

    /// Show envelope header details
    Inspect {
        input: PathBuf,

        /// Needed to open the sealed header
        #[arg(short, long, requires = "password")]
        bundle: Option<PathBuf>,

        #[arg(short, long)]
        password: Option<String>,
    },

    /// Show local cache and index statistics
    CacheStats,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    General,
    Photo,
    Video,
}

impl From<KindArg> for FileType {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::General => FileType::General,
            KindArg::Photo => FileType::Photo,
            KindArg::Video => FileType::Video,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;
    let codec = EnvelopeCodec::new(Arc::new(StandardSuite), config.chunk_size)?;

    match cli.command {
        Commands::Keygen { out, password } => {
            let keys = key_manager(&config);
            let bundle = keys.generate_keypair(&SecretString::new(password))?;
            bundle
                .save(&out)
                .with_context(|| format!("writing bundle {}", out.display()))?;
            println!("✅ Key bundle written to: {}", out.display());
            println!("   Public key: {}", hex::encode(bundle.public.as_bytes()));
        }

        Commands::Encrypt {
            input,
            output,
            bundle,
            file_type,
            duration,
        } => {
            let bundle = KeyBundle::load(&bundle)
                .with_context(|| format!("reading bundle {}", bundle.display()))?;
            let source = File::open(&input).with_context(|| format!("opening {}", input.display()))?;
            let data_size = source.metadata()?.len();

            let meta = EnvelopeMeta {
                file_id: EnvelopeCodec::new_file_id()?.to_vec(),
                filename: file_name(&input),
                file_type: file_type.into(),
                data_size,
                video_duration: duration,
            };
            let header = write_via_partial(&output, |sink| {
                codec.encode(BufReader::new(source), sink, &meta, &bundle.public)
            })
            .with_context(|| format!("encrypting {}", input.display()))?;

            info!(chunks = header.chunk_count(), bytes = data_size, "Encrypted");
            println!("🔐 Encrypted {} -> {}", input.display(), output.display());
        }

        Commands::Decrypt {
            input,
            output,
            bundle,
            password,
        } => {
            let keys = unlock(&config, &bundle, password)?;
            let keypair = keys.keypair()?;

            // Plaintext only appears under `output` once every chunk verified
            let source = File::open(&input).with_context(|| format!("opening {}", input.display()))?;
            let header = write_via_partial(&output, |sink| {
                codec.decode(BufReader::new(source), sink, &keypair)
            })
            .with_context(|| format!("decrypting {}", input.display()))?;
            println!("🔓 Decrypted {} ({} bytes) -> {}", header.filename, header.data_size, output.display());
        }

        Commands::Inspect {
            input,
            bundle,
            password,
        } => {
            let raw = codec.read_header_bytes(
                File::open(&input).with_context(|| format!("opening {}", input.display()))?,
            )?;
            println!("📦 Envelope: {}", input.display());
            println!("{:-<40}", "");
            println!("Header length:    {} bytes", raw.len());

            if let (Some(bundle), Some(password)) = (bundle, password) {
                let keys = unlock(&config, &bundle, password)?;
                let header = codec.decode_header(raw.as_slice(), &keys.keypair()?)?;
                println!("File id:          {}", hex::encode(header.file_id));
                println!("File version:     {}", header.file_version);
                println!("Header version:   {}", header.header_version);
                println!("Type:             {:?}", header.file_type);
                println!("Filename:         {}", header.filename);
                println!("Data size:        {} bytes", header.data_size);
                println!("Chunk size:       {} bytes", header.chunk_size);
                println!("Chunks:           {}", header.chunk_count());
                println!("Video duration:   {} s", header.video_duration);
            }
        }

        Commands::CacheStats => {
            let files = LocalFiles::new(&config.storage_root)?;
            let stats = files.stats()?;
            let index = config.index_path();

            println!("📊 ALFA Photos Sync Cache");
            println!("{:-<40}", "");
            println!("Root:             {}", config.storage_root.display());
            println!("Thumbnails:       {}", stats.thumbs);
            println!("Originals:        {}", stats.originals);
            println!("Cache size:       {} KB", stats.total_bytes / 1024);

            if index.exists() {
                let store = SqliteStore::open(&index)?;
                println!("Gallery records:  {}", store.count(RecordKind::Gallery)?);
                println!("Trash records:    {}", store.count(RecordKind::Trash)?);
            } else {
                debug!(path = %index.display(), "No index database");
                println!("Index:            (none)");
            }
        }
    }

    Ok(())
}

fn key_manager(config: &SyncConfig) -> KeyManager {
    KeyManager::new(Arc::new(StandardSuite), config.wrap_kdf, config.storage_kdf)
}

/// Load a bundle and unwrap its private key
fn unlock(config: &SyncConfig, bundle: &Path, password: String) -> Result<KeyManager> {
    let text = fs::read_to_string(bundle).with_context(|| format!("reading bundle {}", bundle.display()))?;
    let keys = key_manager(config);
    if KeyBundle::from_base64(&text)?.wrapped.is_none() {
        bail!("{} holds no private key", bundle.display());
    }
    keys.import_bundle(&text, &SecretString::new(password))
        .context("wrong password or corrupted bundle")?;
    Ok(keys)
}

/// Write through `<output>.part` and rename onto `output` only on success
fn write_via_partial<T>(
    output: &Path,
    write: impl FnOnce(BufWriter<File>) -> VaultResult<T>,
) -> Result<T> {
    let mut partial = output.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let sink = File::create(&partial).with_context(|| format!("creating {}", partial.display()))?;
    match write(BufWriter::new(sink)) {
        Ok(value) => {
            fs::rename(&partial, output)
                .with_context(|| format!("moving into place {}", output.display()))?;
            Ok(value)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e.into())
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string()
}
